// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-stream ingest loop: opens the source, repairs timestamps, and
//! fans packets out serially to the sinks.
//!
//! Meant to be long-lived; it sleeps with exponential backoff after each
//! failure and reports state transitions to the supervisor. The demuxer is
//! also torn down and reopened every N finalized segments to bound
//! long-running resource growth.

use std::sync::atomic::Ordering;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use base::clock::{Backoff, Clocks, TimerGuard};
use base::{err, Error};
use tracing::{debug, info, warn};
use url::Url;

use crate::recorder::DEFAULT_DEMUX_RESET_SEGMENTS;
use crate::stream::{AudioParams, Opener, Options, PacketSink, Track, VideoParams};
use crate::supervisor::{StreamState, SupervisorShared};
use crate::timestamp::TimestampTracker;

/// Cap on the reconnect backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Every this many consecutive failures, note an aggressive reset. All
/// demuxer state is released between attempts anyway, and by the fifth
/// failure the backoff already exceeds the reset pause.
const AGGRESSIVE_RESET_FAILURES: u32 = 5;

/// The sinks for one source connection, plus the recorder's finalized
/// counter when recording is on.
pub struct SinkSet {
    pub sinks: Vec<Box<dyn PacketSink>>,
    pub segments_finalized: Option<Arc<AtomicU64>>,
}

/// Builds the sinks once the source's parameters are known. Invoked on
/// every (re)connect.
pub type SinkFactory =
    Box<dyn FnMut(&VideoParams, Option<&AudioParams>) -> Result<SinkSet, Error> + Send>;

pub struct Streamer<C: Clocks + Clone> {
    clocks: C,
    db: Arc<db::Database<C>>,
    opener: Arc<dyn Opener>,
    name: String,
    url: Url,
    redacted_url: String,
    transport: db::Transport,
    want_audio: bool,
    shared: Arc<SupervisorShared>,
    shutdown_rx: base::shutdown::Receiver,
    sink_factory: SinkFactory,
    backoff: Backoff,
    pub(crate) demux_reset_segments: u64,
}

impl<C: Clocks + Clone> Streamer<C> {
    pub fn new(
        clocks: C,
        db: Arc<db::Database<C>>,
        opener: Arc<dyn Opener>,
        cfg: &db::Stream,
        shared: Arc<SupervisorShared>,
        shutdown_rx: base::shutdown::Receiver,
        sink_factory: SinkFactory,
    ) -> Result<Self, Error> {
        let url = Url::parse(&cfg.url)
            .map_err(|e| err!(InvalidArgument, msg("bad source url {:?}", cfg.url), source(e)))?;
        let mut redacted = url.clone();
        if redacted.password().is_some() {
            redacted.set_password(Some("redacted")).expect("has host");
        }
        Ok(Streamer {
            clocks,
            db,
            opener,
            name: cfg.name.clone(),
            url,
            redacted_url: redacted.to_string(),
            transport: cfg.transport,
            want_audio: cfg.record_audio,
            shared,
            shutdown_rx,
            sink_factory,
            backoff: Backoff::new(BACKOFF_CAP),
            demux_reset_segments: DEFAULT_DEMUX_RESET_SEGMENTS,
        })
    }

    pub fn run(&mut self) {
        while self.shutdown_rx.check().is_ok() {
            if let Err(e) = self.run_once() {
                let delay = self.backoff.fail();
                let n = self.backoff.consecutive_failures();
                self.shared.set_state(StreamState::Reconnecting);
                if n == 1 {
                    let mut l = self.db.lock();
                    if let Err(e2) = l.add_event_now(
                        db::EventType::Error,
                        Some(&self.name),
                        "source failed; reconnecting",
                        Some(&e.to_string()),
                    ) {
                        warn!(err = %e2.chain(), "unable to log source error");
                    }
                }
                if n % AGGRESSIVE_RESET_FAILURES == 0 {
                    warn!(
                        "{}: {n} consecutive failures; aggressively resetting source state",
                        self.name
                    );
                }
                warn!(
                    "{}: sleeping for {delay:?} after error: {}",
                    self.name,
                    e.chain()
                );
                // Sleep in one-second slices so shutdown isn't held up by a
                // 30-second backoff.
                for _ in 0..delay.as_secs().max(1) {
                    if self.shutdown_rx.check().is_err() {
                        break;
                    }
                    self.clocks.sleep(Duration::from_secs(1));
                }
            }
        }
        self.shared.set_state(StreamState::Inactive);
        info!("{}: shutting down", self.name);
    }

    fn run_once(&mut self) -> Result<(), Error> {
        self.shared.set_state(if self.backoff.consecutive_failures() > 0 {
            StreamState::Reconnecting
        } else {
            StreamState::Starting
        });
        info!("{}: opening input: {}", self.name, self.redacted_url);
        let mut stream = {
            let _t = TimerGuard::new(&self.clocks, || format!("opening {}", self.redacted_url));
            self.opener.open(
                self.name.clone(),
                Options {
                    url: self.url.clone(),
                    transport: self.transport,
                    want_audio: self.want_audio,
                    shutdown_rx: self.shutdown_rx.clone(),
                },
            )?
        };
        self.backoff.succeed();
        self.shared.set_state(StreamState::Active);

        let video = stream.video_params().clone();
        let audio = stream.audio_params().cloned();
        let SinkSet {
            mut sinks,
            segments_finalized,
        } = (self.sink_factory)(&video, audio.as_ref())?;
        let reset_base = segments_finalized
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst));

        let is_udp = self.transport == db::Transport::Udp;
        let mut video_ts =
            TimestampTracker::new(format!("{}-video", self.name), is_udp, video.fps);
        let mut audio_ts = TimestampTracker::new(format!("{}-audio", self.name), is_udp, None);
        let mut seen_key_frame = false;

        let result = loop {
            if self.shutdown_rx.check().is_err() {
                break Ok(());
            }
            if self.shared.force_reconnect.swap(false, Ordering::SeqCst) {
                info!("{}: reconnecting on request", self.name);
                break Ok(());
            }
            let mut pkt = match stream.next() {
                Ok(p) => p,
                Err(e) if e.kind() == base::ErrorKind::Cancelled => break Ok(()),
                Err(e) => break Err(e),
            };
            pkt.arrival = self.clocks.monotonic();
            if pkt.is_empty() {
                debug!("{}: dropping empty packet", self.name);
                continue;
            }
            if !seen_key_frame {
                if pkt.track != Track::Video || !pkt.is_keyframe {
                    continue;
                }
                debug!("{}: have first key frame", self.name);
                seen_key_frame = true;
            }
            match pkt.track {
                Track::Video => video_ts.repair(&mut pkt),
                Track::Audio => audio_ts.repair(&mut pkt),
            }
            if !self.shared.callbacks_enabled.load(Ordering::SeqCst) {
                continue; // gated during stop; late packets are no-ops.
            }
            for sink in &mut sinks {
                if let Err(e) = sink.write(&pkt) {
                    warn!(
                        "{}: sink {} failed: {}",
                        self.name,
                        sink.label(),
                        e.chain()
                    );
                }
            }
            if let (Some(c), Some(base)) = (&segments_finalized, reset_base) {
                if c.load(Ordering::SeqCst).saturating_sub(base) >= self.demux_reset_segments {
                    info!(
                        "{}: tearing down source after {} segments",
                        self.name, self.demux_reset_segments
                    );
                    break Ok(());
                }
            }
        };
        for sink in &mut sinks {
            if let Err(e) = sink.finish() {
                warn!("{}: sink {} close failed: {}", self.name, sink.label(), e.chain());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{DbObserver, SegmentRecorder, SegmentRecorderOptions};
    use crate::stream::testutil::{video_packet, MockOpener, SyntheticStream};
    use base::clock::SimulatedClocks;
    use db::testutil::{TestDb, TEST_STREAM_NAME};

    fn test_clocks() -> SimulatedClocks {
        SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap())
    }

    fn test_stream_cfg() -> db::Stream {
        db::Stream {
            id: 1,
            name: TEST_STREAM_NAME.to_owned(),
            url: "rtsp://test-camera/main".to_owned(),
            enabled: true,
            segment_duration: 5,
            transport: db::Transport::Tcp,
            record_audio: false,
            streaming_enabled: false,
            record: true,
            retention_days: 7,
            detection_enabled: false,
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

    fn no_sinks_factory() -> SinkFactory {
        Box::new(|_, _| {
            Ok(SinkSet {
                sinks: Vec::new(),
                segments_finalized: None,
            })
        })
    }

    /// A scripted clip: keyframes every 2 s at 1 fps, `secs` seconds long.
    fn clip(secs: i64) -> SyntheticStream {
        SyntheticStream::new(
            (0..secs)
                .map(|t| video_packet(t * 90_000, t % 2 == 0))
                .collect(),
        )
    }

    /// With the source down, reconnect attempts are spaced 1, 2, 4, 8, 16,
    /// 30, 30 seconds apart.
    #[test]
    fn reconnect_backoff_ladder() {
        db::testutil::init();
        let clocks = test_clocks();
        let tdb = TestDb::new(clocks.clone());
        let opener = Arc::new(MockOpener::new(vec![]));
        opener.trigger_shutdown_after(8);
        let rx = opener.shutdown_rx();
        let shared = SupervisorShared::new(TEST_STREAM_NAME.to_owned());
        let mut s = Streamer::new(
            clocks.clone(),
            tdb.db.clone(),
            opener.clone(),
            &test_stream_cfg(),
            shared.clone(),
            rx,
            no_sinks_factory(),
        )
        .unwrap();
        s.run();

        assert_eq!(opener.opens.load(Ordering::SeqCst), 8);
        // Sleeps after the first seven failures: 1+2+4+8+16+30+30 = 91 s.
        assert_eq!(clocks.monotonic(), Duration::from_secs(91));
        assert_eq!(shared.state(), StreamState::Inactive);

        // The failure was logged to the event log once, not once per retry.
        let events = tdb.db.lock().list_events(Some(TEST_STREAM_NAME), 100).unwrap();
        assert_eq!(
            events.iter().filter(|e| e.kind == "error").count(),
            1
        );
    }

    /// A source drop finalizes the in-flight recording with its partial
    /// size and a fresh recording opens on reconnect.
    #[test]
    fn source_drop_preserves_metadata() {
        db::testutil::init();
        let clocks = test_clocks();
        let tdb = TestDb::new(clocks.clone());
        let opener = Arc::new(MockOpener::new(vec![clip(3), clip(3)]));
        opener.trigger_shutdown_after(3);
        let rx = opener.shutdown_rx();
        let shared = SupervisorShared::new(TEST_STREAM_NAME.to_owned());

        let factory: SinkFactory = {
            let db = tdb.db.clone();
            let clocks = clocks.clone();
            let root = tdb.tmpdir.path().to_owned();
            Box::new(move |video, audio| {
                let r = SegmentRecorder::new(
                    clocks.clone(),
                    SegmentRecorderOptions {
                        storage_root: root.clone(),
                        stream_name: TEST_STREAM_NAME.to_owned(),
                        segment_duration: Duration::from_secs(60),
                        record_audio: false,
                        trigger: db::TriggerType::Scheduled,
                    },
                    Box::new(DbObserver::new(db.clone(), TEST_STREAM_NAME.to_owned())),
                    video.clone(),
                    audio.cloned(),
                );
                let counter = r.segments_finalized();
                Ok(SinkSet {
                    sinks: vec![Box::new(r)],
                    segments_finalized: Some(counter),
                })
            })
        };

        let mut s = Streamer::new(
            clocks.clone(),
            tdb.db.clone(),
            opener.clone(),
            &test_stream_cfg(),
            shared,
            rx,
            factory,
        )
        .unwrap();
        s.run();

        let l = tdb.db.lock();
        let recordings = l.query_recordings(&db::RecordingQuery::default()).unwrap();
        assert_eq!(recordings.len(), 2);
        for r in &recordings {
            assert!(r.is_complete, "recording {} left open", r.id);
            assert!(r.size_bytes > 0);
            assert_eq!(
                std::fs::metadata(&r.file_path).unwrap().len() as i64,
                r.size_bytes
            );
        }
        // No uncompleted rows remain.
        assert!(l
            .query_recordings(&db::RecordingQuery {
                is_complete: Some(false),
                ..Default::default()
            })
            .unwrap()
            .is_empty());
    }

    /// Every N finalized segments, the source is torn down and reopened
    /// cleanly, with no error logged and no backoff.
    #[test]
    fn periodic_demux_teardown() {
        use crate::stream::testutil::TickingStream;
        db::testutil::init();
        let clocks = test_clocks();
        let tdb = TestDb::new(clocks.clone());
        let opener = Arc::new(MockOpener::new(vec![]));
        // Keyframes every 2 s at one packet per second; 2 s segments.
        opener.push(Box::new(TickingStream::new(
            clip(9),
            clocks.clone(),
            Duration::from_secs(1),
        )));
        opener.trigger_shutdown_after(2);
        let rx = opener.shutdown_rx();
        let shared = SupervisorShared::new(TEST_STREAM_NAME.to_owned());

        let factory: SinkFactory = {
            let db = tdb.db.clone();
            let clocks = clocks.clone();
            let root = tdb.tmpdir.path().to_owned();
            Box::new(move |video, audio| {
                let r = SegmentRecorder::new(
                    clocks.clone(),
                    SegmentRecorderOptions {
                        storage_root: root.clone(),
                        stream_name: TEST_STREAM_NAME.to_owned(),
                        segment_duration: Duration::from_secs(2),
                        record_audio: false,
                        trigger: db::TriggerType::Scheduled,
                    },
                    Box::new(DbObserver::new(db.clone(), TEST_STREAM_NAME.to_owned())),
                    video.clone(),
                    audio.cloned(),
                );
                let counter = r.segments_finalized();
                Ok(SinkSet {
                    sinks: vec![Box::new(r)],
                    segments_finalized: Some(counter),
                })
            })
        };

        let mut s = Streamer::new(
            clocks.clone(),
            tdb.db.clone(),
            opener.clone(),
            &test_stream_cfg(),
            shared,
            rx,
            factory,
        )
        .unwrap();
        s.demux_reset_segments = 2;
        s.run();

        // The first connection ended in a clean teardown after two
        // finalized segments; the second open found the source gone.
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        let l = tdb.db.lock();
        let recordings = l.query_recordings(&db::RecordingQuery::default()).unwrap();
        assert!(recordings.len() >= 2, "got {} recordings", recordings.len());
        assert!(recordings.iter().all(|r| r.is_complete));
        // Only the final (real) failure hit the event log.
        assert_eq!(
            l.list_events(Some(TEST_STREAM_NAME), 100)
                .unwrap()
                .iter()
                .filter(|e| e.kind == "error")
                .count(),
            1
        );
    }

    /// With callbacks gated off, packets flow but no work happens.
    #[test]
    fn callback_gating() {
        db::testutil::init();
        let clocks = test_clocks();
        let tdb = TestDb::new(clocks.clone());
        let opener = Arc::new(MockOpener::new(vec![clip(5)]));
        opener.trigger_shutdown_after(2);
        let rx = opener.shutdown_rx();
        let shared = SupervisorShared::new(TEST_STREAM_NAME.to_owned());
        shared
            .callbacks_enabled
            .store(false, Ordering::SeqCst);

        let factory: SinkFactory = {
            let db = tdb.db.clone();
            let clocks = clocks.clone();
            let root = tdb.tmpdir.path().to_owned();
            Box::new(move |video, audio| {
                let r = SegmentRecorder::new(
                    clocks.clone(),
                    SegmentRecorderOptions {
                        storage_root: root.clone(),
                        stream_name: TEST_STREAM_NAME.to_owned(),
                        segment_duration: Duration::from_secs(60),
                        record_audio: false,
                        trigger: db::TriggerType::Scheduled,
                    },
                    Box::new(DbObserver::new(db.clone(), TEST_STREAM_NAME.to_owned())),
                    video.clone(),
                    audio.cloned(),
                );
                Ok(SinkSet {
                    sinks: vec![Box::new(r)],
                    segments_finalized: None,
                })
            })
        };

        let mut s = Streamer::new(
            clocks.clone(),
            tdb.db.clone(),
            opener,
            &test_stream_cfg(),
            shared,
            rx,
            factory,
        )
        .unwrap();
        s.run();

        assert!(tdb
            .db
            .lock()
            .query_recordings(&db::RecordingQuery::default())
            .unwrap()
            .is_empty());
    }
}
