// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `tracing` subscriber setup.
//!
//! One-line human-readable output on stderr by default, with thread names
//! turned on: ingest threads are named per stream, so the name column is
//! effectively the stream column. `LIGHTNVR_LOG` takes an `env_filter`
//! directive; `LIGHTNVR_FORMAT=json` switches to machine-readable output
//! for log shippers. Panics are routed through the subscriber so a dying
//! ingest thread leaves a timestamped record instead of bare stderr.

use tracing::error;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::Layer as _;

struct WallTimer;

impl FormatTime for WallTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", jiff::Zoned::now().strftime("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("LIGHTNVR_LOG")
        .from_env_lossy()
}

fn log_panic(info: &std::panic::PanicHookInfo) {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str));
    error!(
        target: "panic",
        location = info.location().map(tracing::field::display),
        payload,
        "thread panicked"
    );
}

/// Installs the global subscriber and panic hook. Call once, before
/// spawning any threads.
pub fn install() {
    tracing_log::LogTracer::init().unwrap();
    if std::env::var("LIGHTNVR_FORMAT").is_ok_and(|v| v == "json") {
        let sub = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .json()
                .with_filter(env_filter()),
        );
        tracing::subscriber::set_global_default(sub).unwrap();
    } else {
        let sub = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_timer(WallTimer)
                .with_filter(env_filter()),
        );
        tracing::subscriber::set_global_default(sub).unwrap();
    }
    std::panic::set_hook(Box::new(log_panic));
}

/// Like [`install`], but writes through the test harness's capture.
pub fn install_for_tests() {
    tracing_log::LogTracer::init().unwrap();
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_thread_names(true)
            .with_timer(WallTimer)
            .with_filter(env_filter()),
    );
    tracing::subscriber::set_global_default(sub).unwrap();
}
