// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-stream supervisor: owns the ingest thread, the reconnect policy,
//! and the feature toggles (streaming / recording / detection).
//!
//! External consumers hold a [`StreamHandle`]; dropping it releases the
//! reference. A stream is removable only once every handle besides the
//! creator's is gone. Callbacks are gated by an atomic flag that is cleared
//! before teardown, so late-arriving packets become silent no-ops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use base::clock::Clocks;
use base::{bail, Error};
use tracing::{info, warn};

use crate::hls;
use crate::motion::{self, MotionEventQueue};
use crate::motion::recorder::{MotionEventRecorder, MotionRecorderOptions, MotionSink};
use crate::recorder::{DbObserver, SegmentRecorder, SegmentRecorderOptions};
use crate::ringbuf::PoolBudget;
use crate::stream::{Opener, PacketSink};
use crate::streamer::{SinkSet, Streamer};

/// Default bound on waiting for a supervisor to stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamState {
    Inactive,
    Starting,
    Active,
    Reconnecting,
    Stopping,
    Error,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Inactive => "inactive",
            StreamState::Starting => "starting",
            StreamState::Active => "active",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Stopping => "stopping",
            StreamState::Error => "error",
        };
        f.write_str(s)
    }
}

/// State shared between the supervisor, its ingest thread, and handles.
pub struct SupervisorShared {
    pub name: String,
    state: Mutex<StreamState>,
    state_changed: Condvar,
    pub callbacks_enabled: std::sync::atomic::AtomicBool,
    pub force_reconnect: std::sync::atomic::AtomicBool,
}

impl SupervisorShared {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(SupervisorShared {
            name,
            state: Mutex::new(StreamState::Inactive),
            state_changed: Condvar::new(),
            callbacks_enabled: std::sync::atomic::AtomicBool::new(true),
            force_reconnect: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: StreamState) {
        let mut l = self.state.lock().unwrap();
        if *l == StreamState::Stopping && s != StreamState::Inactive {
            return; // Stopping only ever proceeds to Inactive.
        }
        if *l != s {
            info!("{}: {} -> {}", self.name, *l, s);
            *l = s;
            self.state_changed.notify_all();
        }
    }

    /// Blocks up to `timeout` for `pred` to hold on the state.
    pub fn wait_for_state(
        &self,
        pred: impl Fn(StreamState) -> bool,
        timeout: Duration,
    ) -> Result<StreamState, Error> {
        let l = self.state.lock().unwrap();
        let (l, res) = self
            .state_changed
            .wait_timeout_while(l, timeout, |s| !pred(*s))
            .unwrap();
        if res.timed_out() && !pred(*l) {
            bail!(
                DeadlineExceeded,
                msg("{}: still {} after {:?}", self.name, *l, timeout)
            );
        }
        Ok(*l)
    }
}

/// A capability to use a stream, tagged by component. Dropping it releases
/// the reference.
pub struct StreamHandle {
    shared: Arc<SupervisorShared>,
    _token: Arc<()>,
    component: &'static str,
}

impl StreamHandle {
    pub fn stream_name(&self) -> &str {
        &self.shared.name
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }
}

/// Everything a supervisor needs beyond its stream row.
pub struct SupervisorEnv<C: Clocks + Clone> {
    pub clocks: C,
    pub db: Arc<db::Database<C>>,
    pub opener: Arc<dyn Opener>,
    pub storage_root: PathBuf,
    pub pool: Arc<PoolBudget>,
    pub hls_target_duration_secs: u32,
    pub hls_window: usize,

    /// Snapshot endpoint for the motion detector, when detection is wanted.
    pub snapshot_url: Option<String>,
}

pub struct StreamSupervisor<C: Clocks + Clone> {
    cfg: db::Stream,
    env: SupervisorEnv<C>,
    shared: Arc<SupervisorShared>,
    token: Arc<()>,
    shutdown: Option<base::shutdown::Sender>,
    shutdown_rx: base::shutdown::Receiver,
    queue: Arc<MotionEventQueue>,
    ingest: Option<std::thread::JoinHandle<()>>,
    detection: Option<std::thread::JoinHandle<()>>,
    consumer: Option<std::thread::JoinHandle<()>>,
    stop_timeout: Duration,
}

impl<C: Clocks + Clone> StreamSupervisor<C> {
    pub fn new(cfg: db::Stream, env: SupervisorEnv<C>) -> Self {
        let (shutdown, shutdown_rx) = base::shutdown::channel();
        let shared = SupervisorShared::new(cfg.name.clone());
        StreamSupervisor {
            cfg,
            env,
            shared,
            token: Arc::new(()),
            shutdown: Some(shutdown),
            shutdown_rx,
            queue: Arc::new(MotionEventQueue::new()),
            ingest: None,
            detection: None,
            consumer: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn shared(&self) -> Arc<SupervisorShared> {
        self.shared.clone()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Acquires a tagged reference.
    pub fn handle(&self, component: &'static str) -> StreamHandle {
        StreamHandle {
            shared: self.shared.clone(),
            _token: self.token.clone(),
            component,
        }
    }

    /// Outstanding references beyond the creator's own.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.token) - 1
    }

    /// Starts the enabled features. With no feature enabled the stream goes
    /// to `Error` and this fails.
    pub fn start(&mut self) -> Result<(), Error> {
        let cfg = &self.cfg;
        if !cfg.record && !cfg.streaming_enabled && !cfg.detection_enabled {
            self.shared.set_state(StreamState::Error);
            bail!(
                FailedPrecondition,
                msg("stream {} has no features enabled", cfg.name)
            );
        }
        self.shared.set_state(StreamState::Starting);

        // The motion recorder outlives individual source connections so its
        // pre-roll ring survives reconnects.
        let motion_recorder = if cfg.detection_enabled {
            let observer = DbObserver::new(self.env.db.clone(), cfg.name.clone());
            Some(Arc::new(Mutex::new(MotionEventRecorder::new(
                self.env.clocks.clone(),
                MotionRecorderOptions {
                    storage_root: self.env.storage_root.clone(),
                    stream_name: cfg.name.clone(),
                    pre_buffer: Duration::from_secs(u64::from(cfg.pre_buffer_seconds)),
                    post_buffer: Duration::from_secs(u64::from(cfg.post_buffer_seconds)),
                    max_file_duration: motion::recorder::DEFAULT_MAX_FILE_DURATION,
                },
                Box::new(observer),
                // Replaced by the real source parameters on first connect;
                // until then only the ring buffer is in use.
                crate::stream::VideoParams {
                    sample_entry: Vec::new(),
                    rfc6381_codec: String::new(),
                    width: 0,
                    height: 0,
                    fps: None,
                },
                self.env.pool.clone(),
            ))))
        } else {
            None
        };

        let sink_factory = {
            let cfg = self.cfg.clone();
            let env_db = self.env.db.clone();
            let clocks = self.env.clocks.clone();
            let storage_root = self.env.storage_root.clone();
            let hls_dir = self.env.storage_root.join("hls").join(&cfg.name);
            let hls_target = self.env.hls_target_duration_secs;
            let hls_window = self.env.hls_window;
            let motion_recorder = motion_recorder.clone();
            move |video: &crate::stream::VideoParams,
                  audio: Option<&crate::stream::AudioParams>|
                  -> Result<SinkSet, Error> {
                let mut sinks: Vec<Box<dyn PacketSink>> = Vec::new();
                let mut counter = None;
                if cfg.record {
                    let r = SegmentRecorder::new(
                        clocks.clone(),
                        SegmentRecorderOptions {
                            storage_root: storage_root.clone(),
                            stream_name: cfg.name.clone(),
                            segment_duration: Duration::from_secs(u64::from(
                                cfg.segment_duration.max(1),
                            )),
                            record_audio: cfg.record_audio,
                            trigger: db::TriggerType::Scheduled,
                        },
                        Box::new(DbObserver::new(env_db.clone(), cfg.name.clone())),
                        video.clone(),
                        audio.cloned(),
                    );
                    counter = Some(r.segments_finalized());
                    sinks.push(Box::new(r));
                }
                if cfg.streaming_enabled {
                    sinks.push(Box::new(hls::HlsSegmenter::new(
                        hls::HlsOptions {
                            dir: hls_dir.clone(),
                            target_duration_secs: hls_target,
                            window: hls_window,
                        },
                        video,
                        audio.cloned(),
                    )?));
                }
                if let Some(m) = &motion_recorder {
                    m.lock().unwrap().set_video_params(video.clone());
                    sinks.push(Box::new(MotionSink(m.clone())));
                }
                Ok(SinkSet {
                    sinks,
                    segments_finalized: counter,
                })
            }
        };

        let mut streamer = Streamer::new(
            self.env.clocks.clone(),
            self.env.db.clone(),
            self.env.opener.clone(),
            &self.cfg,
            self.shared.clone(),
            self.shutdown_rx.clone(),
            Box::new(sink_factory),
        )?;
        let thread_name = format!("s-{}", cfg.name);
        self.ingest = Some(
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || streamer.run())
                .expect("spawn ingest thread"),
        );

        if let (Some(recorder), true) = (motion_recorder, cfg.detection_enabled) {
            let consumer = {
                let db = self.env.db.clone();
                let name = cfg.name.clone();
                let queue = self.queue.clone();
                let shutdown = self.shutdown_rx.clone();
                std::thread::Builder::new()
                    .name(format!("m-{}", cfg.name))
                    .spawn(move || {
                        motion::recorder::run_motion_consumer(db, &name, queue, recorder, shutdown)
                    })
                    .expect("spawn motion consumer thread")
            };
            self.consumer = Some(consumer);
            if let Some(url) = self.env.snapshot_url.clone() {
                let clocks = self.env.clocks.clone();
                let name = cfg.name.clone();
                let queue = self.queue.clone();
                let shutdown = self.shutdown_rx.clone();
                let detector = motion::MotionDetector::new(
                    motion::DetectorConfig {
                        grid_size: cfg.detection_grid_size,
                        sensitivity: cfg.detection_sensitivity,
                        cooldown: Duration::from_secs(u64::from(cfg.detection_cooldown_seconds)),
                        ..Default::default()
                    }
                    .sanitized(),
                );
                self.detection = Some(
                    std::thread::Builder::new()
                        .name(format!("d-{}", cfg.name))
                        .spawn(move || {
                            match motion::SnapshotSource::new(url) {
                                Ok(source) => motion::run_detection_loop(
                                    clocks,
                                    &name,
                                    Box::new(source),
                                    detector,
                                    queue,
                                    Duration::from_millis(500),
                                    shutdown,
                                ),
                                Err(e) => {
                                    warn!("{name}: snapshot source unavailable: {}", e.chain())
                                }
                            }
                        })
                        .expect("spawn detection thread"),
                );
            } else {
                warn!(
                    "{}: detection enabled but no snapshot url configured",
                    cfg.name
                );
            }
        }
        Ok(())
    }

    /// Public interface to the motion queue, for detection sources wired
    /// externally (e.g. tests).
    pub fn motion_queue(&self) -> Arc<MotionEventQueue> {
        self.queue.clone()
    }

    /// Asks the ingest loop to drop its demuxer on the next iteration.
    pub fn force_reconnect(&self) {
        self.shared
            .force_reconnect
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Stops children in reverse dependency order and waits (bounded) for
    /// the ingest thread to exit. Idempotent.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), Error> {
        // Disable callbacks first so anything late-arriving is a no-op.
        self.shared
            .callbacks_enabled
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.shared.set_state(StreamState::Stopping);
        self.queue.shutdown();
        self.shutdown.take(); // dropping the sender signals everyone.

        if self.ingest.is_none() {
            // Never started (or already stopped); nothing to wait on.
            self.shared.set_state(StreamState::Inactive);
            return Ok(());
        }
        let result = self
            .shared
            .wait_for_state(|s| s == StreamState::Inactive, timeout);
        for (label, handle) in [
            ("ingest", self.ingest.take()),
            ("detection", self.detection.take()),
            ("consumer", self.consumer.take()),
        ] {
            if let Some(h) = handle {
                if h.is_finished() {
                    let _ = h.join();
                } else {
                    warn!(
                        "{}: {label} thread still running after {timeout:?}; marking stopped",
                        self.shared.name
                    );
                }
            }
        }
        if result.is_err() {
            // Forced: the thread is detached but callbacks are gated off.
            self.shared.set_state(StreamState::Inactive);
        }
        result.map(|_| ())
    }
}

/// All supervised streams, keyed by name.
pub struct StreamSet<C: Clocks + Clone> {
    streams: Mutex<HashMap<String, StreamSupervisor<C>>>,
}

impl<C: Clocks + Clone> StreamSet<C> {
    pub fn new() -> Self {
        StreamSet {
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, sup: StreamSupervisor<C>) -> Result<(), Error> {
        let mut l = self.streams.lock().unwrap();
        let name = sup.cfg.name.clone();
        if l.contains_key(&name) {
            bail!(AlreadyExists, msg("stream {name:?} is already supervised"));
        }
        l.insert(name, sup);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn handle(&self, name: &str, component: &'static str) -> Result<StreamHandle, Error> {
        let l = self.streams.lock().unwrap();
        match l.get(name) {
            Some(s) => Ok(s.handle(component)),
            None => bail!(NotFound, msg("no supervised stream {name:?}")),
        }
    }

    /// Removes a stream; fails while any consumer still holds a handle.
    pub fn remove(&self, name: &str, timeout: Duration) -> Result<(), Error> {
        let mut l = self.streams.lock().unwrap();
        let Some(sup) = l.get_mut(name) else {
            bail!(NotFound, msg("no supervised stream {name:?}"));
        };
        if sup.ref_count() > 0 {
            bail!(
                FailedPrecondition,
                msg(
                    "stream {name:?} still has {} outstanding reference(s)",
                    sup.ref_count()
                )
            );
        }
        sup.stop(timeout)?;
        l.remove(name);
        Ok(())
    }

    /// Stops every stream; used by the shutdown coordinator.
    pub fn stop_all(&self, timeout: Duration) {
        let mut l = self.streams.lock().unwrap();
        for (name, sup) in l.iter_mut() {
            if let Err(e) = sup.stop(timeout) {
                warn!("{name}: stop timed out: {}", e.chain());
            }
        }
        l.clear();
    }
}

impl<C: Clocks + Clone> Default for StreamSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::{video_packet, MockOpener, SyntheticStream};
    use base::clock::SimulatedClocks;
    use db::testutil::{TestDb, TEST_STREAM_NAME};

    fn test_env(
        tdb: &TestDb,
        opener: Arc<dyn Opener>,
    ) -> SupervisorEnv<SimulatedClocks> {
        SupervisorEnv {
            clocks: tdb.clocks.clone(),
            db: tdb.db.clone(),
            opener,
            storage_root: tdb.tmpdir.path().to_owned(),
            pool: PoolBudget::new(1 << 20),
            hls_target_duration_secs: 2,
            hls_window: 4,
            snapshot_url: None,
        }
    }

    fn test_cfg() -> db::Stream {
        tdb_stream(true, false, false)
    }

    fn tdb_stream(record: bool, streaming: bool, detection: bool) -> db::Stream {
        db::Stream {
            id: 1,
            name: TEST_STREAM_NAME.to_owned(),
            url: "rtsp://test-camera/main".to_owned(),
            enabled: true,
            segment_duration: 60,
            transport: db::Transport::Tcp,
            record_audio: false,
            streaming_enabled: streaming,
            record,
            retention_days: 7,
            detection_enabled: detection,
            detection_sensitivity: 0.25,
            detection_grid_size: 8,
            detection_cooldown_seconds: 3,
            detection_retention_days: 30,
            pre_buffer_seconds: 5,
            post_buffer_seconds: 10,
            onvif_username: None,
            onvif_password: None,
            onvif_profile: None,
        }
    }

    fn clip(secs: i64) -> SyntheticStream {
        SyntheticStream::new(
            (0..secs)
                .map(|t| video_packet(t * 90_000, t % 2 == 0))
                .collect(),
        )
    }

    #[test]
    fn lifecycle_reaches_active_and_stops() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        let tdb = TestDb::new(clocks);
        let opener = Arc::new(MockOpener::new(vec![clip(3)]));
        let mut sup = StreamSupervisor::new(test_cfg(), test_env(&tdb, opener));
        assert_eq!(sup.state(), StreamState::Inactive);
        sup.start().unwrap();

        // The scripted clip connects, then runs out; either state proves the
        // ingest thread came up.
        sup.shared()
            .wait_for_state(
                |s| matches!(s, StreamState::Active | StreamState::Reconnecting),
                Duration::from_secs(10),
            )
            .unwrap();

        // A forced reconnect is absorbed by the retry loop without killing
        // the supervisor.
        sup.force_reconnect();

        sup.stop(Duration::from_secs(10)).unwrap();
        assert_eq!(sup.state(), StreamState::Inactive);

        // Stop is idempotent.
        sup.stop(Duration::from_secs(10)).unwrap();

        // The clip's recording was finalized on the way down.
        let l = tdb.db.lock();
        let recs = l.query_recordings(&db::RecordingQuery::default()).unwrap();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].is_complete);
    }

    #[test]
    fn no_features_is_an_error() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        let tdb = TestDb::new(clocks);
        let opener = Arc::new(MockOpener::new(vec![]));
        let mut sup = StreamSupervisor::new(tdb_stream(false, false, false), test_env(&tdb, opener));
        let e = sup.start().unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
        assert_eq!(sup.state(), StreamState::Error);
        // Stopping an errored supervisor works and is prompt.
        sup.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(sup.state(), StreamState::Inactive);
    }

    #[test]
    fn removal_blocked_by_outstanding_handles() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        let tdb = TestDb::new(clocks);
        let opener = Arc::new(MockOpener::new(vec![]));
        let sup = StreamSupervisor::new(test_cfg(), test_env(&tdb, opener));
        assert_eq!(sup.ref_count(), 0);

        let set = StreamSet::new();
        set.insert(sup).unwrap();
        assert_eq!(set.names(), [TEST_STREAM_NAME.to_owned()]);
        let handle = set.handle(TEST_STREAM_NAME, "api").unwrap();
        assert_eq!(handle.component(), "api");
        assert_eq!(handle.stream_name(), TEST_STREAM_NAME);
        assert_eq!(handle.state(), StreamState::Inactive);

        let e = set
            .remove(TEST_STREAM_NAME, Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);

        drop(handle);
        set.remove(TEST_STREAM_NAME, Duration::from_secs(1)).unwrap();
        assert!(set.handle(TEST_STREAM_NAME, "api").is_err());
    }

    /// Detection-only streams run the motion consumer; events pushed into
    /// the queue land in the event log.
    #[test]
    fn detection_only_stream_consumes_motion_events() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        let tdb = TestDb::new(clocks);
        let opener = Arc::new(MockOpener::new(vec![]));
        let mut sup = StreamSupervisor::new(tdb_stream(false, false, true), test_env(&tdb, opener));
        sup.start().unwrap();

        sup.motion_queue().push(crate::motion::MotionEvent {
            timestamp: 1_700_000_123,
            active: true,
            confidence: 0.8,
        });

        // The consumer thread runs on real time; wait for it to drain.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let n = tdb
                .db
                .lock()
                .list_events(Some(TEST_STREAM_NAME), 10)
                .unwrap()
                .iter()
                .filter(|e| e.kind == "motion_begin")
                .count();
            if n == 1 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "motion event never consumed"
            );
            std::thread::sleep(Duration::from_millis(20));
        }

        sup.stop(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn duplicate_insert_rejected() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        let tdb = TestDb::new(clocks);
        let set = StreamSet::new();
        let opener: Arc<dyn Opener> = Arc::new(MockOpener::new(vec![]));
        set.insert(StreamSupervisor::new(
            test_cfg(),
            test_env(&tdb, opener.clone()),
        ))
        .unwrap();
        let e = set
            .insert(StreamSupervisor::new(test_cfg(), test_env(&tdb, opener)))
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);
    }
}
