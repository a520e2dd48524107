// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `run` subcommand: the composition root. Opens the store, seeds
//! configured streams, spawns a supervisor per enabled stream, and drains
//! everything in order on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use base::clock::RealClocks;
use base::{Error, FastHashMap};
use bpaf::Bpaf;
use tracing::{info, warn};
use url::Url;

use crate::coordinator::ShutdownCoordinator;
use crate::ringbuf::PoolBudget;
use crate::stream::{self, Opener, SourceKind};
use crate::supervisor::{StreamSet, StreamSupervisor, SupervisorEnv, DEFAULT_STOP_TIMEOUT};
use crate::upstream::UpstreamClient;

/// Runs the recorder.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(crate::cmds::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = super::read_config(&args.config)?;
    std::fs::create_dir_all(&cfg.storage_path)?;
    let clocks = RealClocks::default();
    let db = Arc::new(db::Database::open(clocks, &super::db_path(&cfg))?);

    // Seed configured streams the store doesn't know yet; the store is
    // authoritative from then on.
    {
        let mut l = db.lock();
        for seed in &cfg.streams {
            match l.get_stream(&seed.name) {
                Ok(_) => {}
                Err(e) if e.kind() == base::ErrorKind::NotFound => {
                    l.add_stream(&seed.to_change())?;
                    l.add_event_now(
                        db::EventType::StreamAdded,
                        Some(&seed.name),
                        "seeded from config",
                        None,
                    )?;
                    info!("seeded stream {:?} from config", seed.name);
                }
                Err(e) => return Err(e),
            }
        }
        let open_id = l.open_id().to_string();
        l.add_event_now(db::EventType::Startup, None, "lightnvr starting", Some(&open_id))?;
        info!(%open_id, "lightnvr starting");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let opener: Arc<dyn Opener> = Arc::new(stream::RealOpener::new(rt.handle().clone()));
    let upstream = match &cfg.upstream_url {
        Some(u) => Some(UpstreamClient::new(u.clone())?),
        None => None,
    };
    let pool = PoolBudget::new(cfg.buffer_pool_bytes);
    let snapshot_urls: FastHashMap<String, String> = cfg
        .streams
        .iter()
        .filter_map(|s| Some((s.name.clone(), s.snapshot_url.clone()?)))
        .collect();

    let set = Arc::new(StreamSet::new());
    let streams = db.lock().list_streams()?;
    for mut s in streams.into_iter().filter(|s| s.enabled) {
        let parsed = match Url::parse(&s.url) {
            Ok(u) => u,
            Err(e) => {
                warn!("{}: skipping; bad url {:?}: {e}", s.name, s.url);
                continue;
            }
        };
        match stream::check_source_url(&parsed) {
            Ok(SourceKind::Rtsp) => {}
            Ok(SourceKind::RawUdp) => {
                // Raw udp/rtp goes through the upstream mux and comes back
                // over local RTSP.
                let Some(up) = &upstream else {
                    warn!(
                        "{}: skipping; raw source {:?} needs upstream_url configured",
                        s.name, s.url
                    );
                    continue;
                };
                if stream::is_multicast(&parsed) {
                    info!("{}: multicast group {:?} joined by the mux", s.name, s.url);
                }
                if !up.stream_exists(&s.name)? {
                    up.add_stream(&s.name, &s.url)?;
                }
                if let Err(e) = up.preload(&s.name) {
                    warn!("{}: preload failed: {}", s.name, e.chain());
                }
                s.url = up.local_rtsp_url(&s.name)?;
            }
            Err(e) => {
                warn!("{}: skipping; {}", s.name, e.chain());
                continue;
            }
        }
        let env = SupervisorEnv {
            clocks,
            db: db.clone(),
            opener: opener.clone(),
            storage_root: cfg.storage_path.clone(),
            pool: pool.clone(),
            hls_target_duration_secs: cfg.hls_segment_duration_secs,
            hls_window: cfg.hls_window,
            snapshot_url: snapshot_urls.get(&s.name).cloned(),
        };
        let name = s.name.clone();
        let mut sup = StreamSupervisor::new(s, env);
        if let Err(e) = sup.start() {
            warn!("{name}: not started: {}", e.chain());
        }
        set.insert(sup)?;
    }
    info!("running with {} supervised stream(s)", set.names().len());

    let mut coordinator = ShutdownCoordinator::new();
    {
        let set = set.clone();
        coordinator.register("stream supervisors", DEFAULT_STOP_TIMEOUT, move |t| {
            set.stop_all(t);
            Ok(())
        });
    }

    rt.block_on(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut int = signal(SignalKind::interrupt())?;
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = int.recv() => info!("got SIGINT"),
            _ = term.recv() => info!("got SIGTERM"),
        }
        Ok::<_, std::io::Error>(())
    })?;

    info!("shutting down");
    coordinator.shutdown();
    db.lock()
        .add_event_now(db::EventType::Shutdown, None, "lightnvr stopping", None)?;
    match Arc::try_unwrap(db) {
        Ok(d) => d.close()?,
        Err(_) => warn!("metadata store still referenced; relying on drop checkpoint"),
    }
    info!("done");
    Ok(0)
}
