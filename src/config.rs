// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! TOML configuration.
//!
//! Out-of-range values are clamped to their defaults with a warning rather
//! than refusing to start; a recorder that stays down over a typo'd grid
//! size records nothing at all.

use std::path::PathBuf;

use base::{err, Error};
use serde::Deserialize;
use tracing::warn;

use crate::hls;
use crate::ringbuf;

fn default_hls_segment_duration() -> u32 {
    hls::DEFAULT_TARGET_DURATION_SECS
}

fn default_hls_window() -> usize {
    hls::DEFAULT_WINDOW
}

fn default_pool_bytes() -> usize {
    ringbuf::DEFAULT_POOL_BYTES
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of recordings, HLS output, and the metadata store.
    pub storage_path: PathBuf,

    /// Base URL of the upstream RTSP mux; raw udp/rtp sources need it.
    #[serde(default)]
    pub upstream_url: Option<String>,

    #[serde(default = "default_hls_segment_duration")]
    pub hls_segment_duration_secs: u32,

    #[serde(default = "default_hls_window")]
    pub hls_window: usize,

    /// Process-wide cap on pre-roll packet buffers.
    #[serde(default = "default_pool_bytes")]
    pub buffer_pool_bytes: usize,

    /// Streams seeded into the metadata store on startup; the store is
    /// authoritative afterwards.
    #[serde(default)]
    pub streams: Vec<StreamSeed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSeed {
    pub name: String,
    pub url: String,

    #[serde(default)]
    pub transport: Option<String>,

    /// Snapshot endpoint for motion detection.
    #[serde(default)]
    pub snapshot_url: Option<String>,

    #[serde(default)]
    pub record: Option<bool>,
    #[serde(default)]
    pub streaming: Option<bool>,
    #[serde(default)]
    pub detection: Option<bool>,
    #[serde(default)]
    pub record_audio: Option<bool>,
    #[serde(default)]
    pub segment_duration_secs: Option<u32>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub detection_retention_days: Option<u32>,
    #[serde(default)]
    pub pre_buffer_secs: Option<u32>,
    #[serde(default)]
    pub post_buffer_secs: Option<u32>,
    #[serde(default)]
    pub detection_sensitivity: Option<f64>,
    #[serde(default)]
    pub detection_grid_size: Option<u32>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut cfg: Config = toml::from_str(text)
            .map_err(|e| err!(InvalidArgument, msg("unable to parse config"), source(e)))?;
        cfg.clamp();
        Ok(cfg)
    }

    /// Clamps out-of-range values to defaults.
    fn clamp(&mut self) {
        if !(1..=10).contains(&self.hls_segment_duration_secs) {
            warn!(
                "hls_segment_duration_secs {} out of range; using {}",
                self.hls_segment_duration_secs,
                default_hls_segment_duration()
            );
            self.hls_segment_duration_secs = default_hls_segment_duration();
        }
        if !(2..=64).contains(&self.hls_window) {
            warn!(
                "hls_window {} out of range; using {}",
                self.hls_window,
                default_hls_window()
            );
            self.hls_window = default_hls_window();
        }
        if self.buffer_pool_bytes < (1 << 20) {
            warn!(
                "buffer_pool_bytes {} too small; using {}",
                self.buffer_pool_bytes,
                default_pool_bytes()
            );
            self.buffer_pool_bytes = default_pool_bytes();
        }
        for s in &mut self.streams {
            if let Some(d) = s.segment_duration_secs {
                if !(1..=3600).contains(&d) {
                    warn!("stream {}: segment duration {d} out of range; using 60", s.name);
                    s.segment_duration_secs = Some(60);
                }
            }
        }
    }
}

impl StreamSeed {
    /// The stream row this seed creates when absent from the store.
    pub fn to_change(&self) -> db::StreamChange {
        let d = db::StreamChange::default();
        db::StreamChange {
            name: self.name.clone(),
            url: self.url.clone(),
            transport: self
                .transport
                .as_deref()
                .and_then(db::Transport::parse)
                .unwrap_or_default(),
            record: self.record.unwrap_or(d.record),
            streaming_enabled: self.streaming.unwrap_or(d.streaming_enabled),
            detection_enabled: self.detection.unwrap_or(d.detection_enabled),
            record_audio: self.record_audio.unwrap_or(d.record_audio),
            segment_duration: self.segment_duration_secs.unwrap_or(d.segment_duration),
            retention_days: self.retention_days.unwrap_or(d.retention_days),
            detection_retention_days: self
                .detection_retention_days
                .unwrap_or(d.detection_retention_days),
            pre_buffer_seconds: self.pre_buffer_secs.unwrap_or(d.pre_buffer_seconds),
            post_buffer_seconds: self.post_buffer_secs.unwrap_or(d.post_buffer_seconds),
            detection_sensitivity: self
                .detection_sensitivity
                .unwrap_or(d.detection_sensitivity),
            detection_grid_size: self.detection_grid_size.unwrap_or(d.detection_grid_size),
            ..d
        }
    }
}
