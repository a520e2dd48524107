// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The motion event recorder: ties motion events to the pre-roll ring
//! buffer and produces gap-free event clips.
//!
//! States: `Idle → Buffering → Recording → Finalizing → (Idle | Buffering)`.
//! While buffering, video packets accumulate in the ring; `motion_begin`
//! flushes the ring (truncated forward to a keyframe) into a fresh file and
//! switches to live appending. Two quiet seconds start finalization; the
//! post-buffer then runs out before the file closes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base::clock::Clocks;
use base::Error;
use tracing::{debug, info, warn};

use crate::motion::queue::{MotionEvent, MotionEventQueue};
use crate::recorder::{SegmentFile, SegmentMeta, SegmentObserver};
use crate::ringbuf::{PacketRingBuffer, PoolBudget};
use crate::stream::{Packet, PacketSink, Track, VideoParams, TIME_UNITS_PER_SEC};

/// Quiet time after the last motion before finalization starts.
const QUIET_PERIOD: Duration = Duration::from_secs(2);

pub const DEFAULT_POST_BUFFER: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FILE_DURATION: Duration = Duration::from_secs(300);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MotionRecorderState {
    Idle,
    Buffering,
    Recording,
    Finalizing,
}

pub struct MotionRecorderOptions {
    pub storage_root: PathBuf,
    pub stream_name: String,
    pub pre_buffer: Duration,
    pub post_buffer: Duration,
    pub max_file_duration: Duration,
}

pub struct MotionEventRecorder<C: Clocks + Clone> {
    clocks: C,
    opts: MotionRecorderOptions,
    observer: Box<dyn SegmentObserver>,
    video: VideoParams,
    meta: SegmentMeta,
    frame_ticks: u32,
    ring: PacketRingBuffer,

    state: MotionRecorderState,
    current: Option<(SegmentFile, i64)>,

    /// Monotonic time of the most recent `motion_begin`.
    last_motion: Duration,
    finalizing_since: Duration,
    file_opened_at: Duration,

    /// Set when the max file duration is hit; the swap happens on the next
    /// keyframe so the new file starts decodable.
    rotate_pending: bool,
}

impl<C: Clocks + Clone> MotionEventRecorder<C> {
    pub fn new(
        clocks: C,
        opts: MotionRecorderOptions,
        observer: Box<dyn SegmentObserver>,
        video: VideoParams,
        pool: Arc<PoolBudget>,
    ) -> Self {
        let ring = PacketRingBuffer::new(
            format!("{}-motion", opts.stream_name),
            pool,
            opts.pre_buffer,
        );
        let state = if opts.pre_buffer.is_zero() {
            MotionRecorderState::Idle
        } else {
            MotionRecorderState::Buffering
        };
        let meta = SegmentMeta::from_params(&video);
        let frame_ticks = (TIME_UNITS_PER_SEC / i64::from(video.fps.unwrap_or(30).max(1))) as u32;
        MotionEventRecorder {
            clocks,
            opts,
            observer,
            video,
            meta,
            frame_ticks,
            ring,
            state,
            current: None,
            last_motion: Duration::ZERO,
            finalizing_since: Duration::ZERO,
            file_opened_at: Duration::ZERO,
            rotate_pending: false,
        }
    }

    pub fn state(&self) -> MotionRecorderState {
        self.state
    }

    /// Adopts the connected source's parameters. Called on every (re)connect
    /// before packets flow; the recorder itself outlives connections.
    pub fn set_video_params(&mut self, video: VideoParams) {
        if video == self.video {
            return;
        }
        self.meta = SegmentMeta::from_params(&video);
        self.frame_ticks =
            (TIME_UNITS_PER_SEC / i64::from(video.fps.unwrap_or(30).max(1))) as u32;
        self.video = video;
    }

    /// Feeds one packet from the stream fan-out. Only video participates.
    pub fn handle_packet(&mut self, pkt: &Packet) -> Result<(), Error> {
        if pkt.track != Track::Video {
            return Ok(());
        }
        match self.state {
            MotionRecorderState::Idle => {}
            MotionRecorderState::Buffering => self.ring.push(pkt.clone()),
            MotionRecorderState::Recording | MotionRecorderState::Finalizing => {
                if pkt.is_keyframe && self.rotate_pending {
                    self.rotate_pending = false;
                    self.stop_recording()?;
                    self.open_file_at_packet(pkt)?;
                    self.state = MotionRecorderState::Recording;
                }
                if self.current.is_none() {
                    // Entered Recording with an empty ring (no pre-roll);
                    // the clip starts at the next keyframe.
                    if pkt.is_keyframe {
                        self.open_file_at_packet(pkt)?;
                    } else {
                        return Ok(());
                    }
                }
                if let Err(e) = self.append(pkt) {
                    warn!(
                        stream = %self.opts.stream_name,
                        err = %e.chain(),
                        "event clip write failed; closing as partial"
                    );
                    self.close_partial();
                }
            }
        }
        self.tick()
    }

    /// Applies a motion begin/end transition.
    pub fn handle_motion_event(&mut self, ev: MotionEvent) -> Result<(), Error> {
        let now = self.clocks.monotonic();
        if ev.active {
            match self.state {
                MotionRecorderState::Idle | MotionRecorderState::Buffering => {
                    self.start_recording()?;
                    self.last_motion = now;
                }
                MotionRecorderState::Recording => self.last_motion = now,
                MotionRecorderState::Finalizing => {
                    debug!(
                        "{}: motion resumed during finalization",
                        self.opts.stream_name
                    );
                    self.state = MotionRecorderState::Recording;
                    self.last_motion = now;
                }
            }
        }
        self.tick()
    }

    /// Time-driven transitions; called from packet handling and from the
    /// consumer loop on poll timeouts.
    pub fn tick(&mut self) -> Result<(), Error> {
        let now = self.clocks.monotonic();
        match self.state {
            MotionRecorderState::Recording => {
                if now.saturating_sub(self.last_motion) > QUIET_PERIOD {
                    self.state = MotionRecorderState::Finalizing;
                    self.finalizing_since = now;
                } else if self.current.is_some()
                    && now.saturating_sub(self.file_opened_at) > self.opts.max_file_duration
                {
                    self.rotate_pending = true;
                }
            }
            MotionRecorderState::Finalizing => {
                if now.saturating_sub(self.finalizing_since) >= self.opts.post_buffer {
                    self.stop_recording()?;
                    self.state = if self.opts.pre_buffer.is_zero() {
                        MotionRecorderState::Idle
                    } else {
                        MotionRecorderState::Buffering
                    };
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Closes any open clip; the terminal transition for shutdown.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.stop_recording()?;
        self.state = if self.opts.pre_buffer.is_zero() {
            MotionRecorderState::Idle
        } else {
            MotionRecorderState::Buffering
        };
        Ok(())
    }

    /// Flushes the ring into a fresh file and goes live.
    fn start_recording(&mut self) -> Result<(), Error> {
        let now_mono = self.clocks.monotonic();
        let now_wall = self.clocks.realtime();
        let cutoff = now_mono.saturating_sub(self.opts.pre_buffer);

        let MotionEventRecorder {
            ring,
            observer,
            opts,
            video,
            meta,
            frame_ticks,
            current,
            ..
        } = self;
        let mut open_err = None;
        let flush_result = ring.flush(cutoff, &mut |p| {
            if current.is_none() {
                // The clip's start time is the wall-clock moment of the
                // flushed keyframe, not of the trigger.
                let age = now_mono.saturating_sub(p.arrival);
                let start = now_wall - jiff::SignedDuration::try_from(age).unwrap_or_default();
                match SegmentFile::create(
                    &opts.storage_root,
                    &opts.stream_name,
                    start,
                    db::TriggerType::Motion,
                    video,
                    None,
                    *frame_ticks,
                )
                .and_then(|file| {
                    let id = observer.on_segment_started(
                        file.path(),
                        start.as_second(),
                        meta,
                        db::TriggerType::Motion,
                    )?;
                    Ok((file, id))
                }) {
                    Ok(v) => *current = Some(v),
                    Err(e) => {
                        open_err = Some(e);
                        return Err(base::err!(Aborted));
                    }
                }
            }
            if let Some((file, _)) = current {
                file.add_packet(p)?;
            }
            Ok(())
        });
        if let Some(e) = open_err {
            return Err(e);
        }
        flush_result?;
        self.file_opened_at = now_mono;
        self.state = MotionRecorderState::Recording;
        info!("{}: motion recording started", self.opts.stream_name);
        Ok(())
    }

    fn open_file_at_packet(&mut self, _pkt: &Packet) -> Result<(), Error> {
        let now_wall = self.clocks.realtime();
        let file = SegmentFile::create(
            &self.opts.storage_root,
            &self.opts.stream_name,
            now_wall,
            db::TriggerType::Motion,
            &self.video,
            None,
            self.frame_ticks,
        )?;
        let id = self.observer.on_segment_started(
            file.path(),
            now_wall.as_second(),
            &self.meta,
            db::TriggerType::Motion,
        )?;
        self.current = Some((file, id));
        self.file_opened_at = self.clocks.monotonic();
        Ok(())
    }

    fn append(&mut self, pkt: &Packet) -> Result<(), Error> {
        if let Some((file, _)) = &mut self.current {
            file.add_packet(pkt)?;
        }
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<(), Error> {
        if let Some((file, id)) = self.current.take() {
            let end = self.clocks.realtime().as_second();
            let size = file.finalize()?;
            self.observer.on_segment_finalized(id, end, size as i64, true)?;
            info!("{}: motion recording stopped", self.opts.stream_name);
        }
        Ok(())
    }

    fn close_partial(&mut self) {
        if let Some((file, id)) = self.current.take() {
            let end = self.clocks.realtime().as_second();
            let size = file.bytes_written();
            drop(file);
            if let Err(e) = self.observer.on_segment_finalized(id, end, size as i64, false) {
                warn!(err = %e.chain(), "unable to record partial event clip");
            }
        }
    }
}

/// A [`PacketSink`] adapter so the ingest fan-out can feed a recorder that
/// the motion consumer thread also drives.
pub struct MotionSink<C: Clocks + Clone>(pub Arc<Mutex<MotionEventRecorder<C>>>);

impl<C: Clocks + Clone> PacketSink for MotionSink<C> {
    fn label(&self) -> &str {
        "motion"
    }

    fn write(&mut self, pkt: &Packet) -> Result<(), Error> {
        self.0.lock().unwrap().handle_packet(pkt)
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.0.lock().unwrap().finish()
    }
}

/// The consumer side of the motion queue: applies events to the recorder
/// and mirrors them into the event log.
pub fn run_motion_consumer<C: Clocks + Clone>(
    db: Arc<db::Database<C>>,
    stream_name: &str,
    queue: Arc<MotionEventQueue>,
    recorder: Arc<Mutex<MotionEventRecorder<C>>>,
    shutdown: base::shutdown::Receiver,
) {
    while shutdown.check().is_ok() {
        match queue.pop(Duration::from_millis(250)) {
            Some(ev) => {
                let kind = if ev.active {
                    db::EventType::MotionBegin
                } else {
                    db::EventType::MotionEnd
                };
                if let Err(e) = db.lock().add_event(
                    ev.timestamp,
                    kind,
                    Some(stream_name),
                    &format!("confidence {:.3}", ev.confidence),
                    None,
                ) {
                    warn!(err = %e.chain(), "unable to log motion event");
                }
                if let Err(e) = recorder.lock().unwrap().handle_motion_event(ev) {
                    warn!(err = %e.chain(), "motion event handling failed");
                }
            }
            None => {
                if queue.is_shut_down() {
                    break;
                }
                if let Err(e) = recorder.lock().unwrap().tick() {
                    warn!(err = %e.chain(), "motion recorder tick failed");
                }
            }
        }
    }
    if let Err(e) = recorder.lock().unwrap().finish() {
        warn!(err = %e.chain(), "unable to finalize motion recording at shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testutil::{ObservedEvent, RecordingObserver};
    use crate::stream::testutil::{test_video_params, video_packet};
    use base::clock::SimulatedClocks;

    const BOOT: i64 = 1_700_000_000;

    struct Fixture {
        clocks: SimulatedClocks,
        r: MotionEventRecorder<SimulatedClocks>,
        observer: RecordingObserver,
        _tmp: tempfile::TempDir,
    }

    fn fixture(pre_buffer_secs: u64, max_file_secs: u64) -> Fixture {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(BOOT).unwrap());
        let observer = RecordingObserver::default();
        let r = MotionEventRecorder::new(
            clocks.clone(),
            MotionRecorderOptions {
                storage_root: tmp.path().to_owned(),
                stream_name: "yard".to_owned(),
                pre_buffer: Duration::from_secs(pre_buffer_secs),
                post_buffer: DEFAULT_POST_BUFFER,
                max_file_duration: Duration::from_secs(max_file_secs),
            },
            Box::new(observer.clone()),
            test_video_params(),
            PoolBudget::new(1 << 20),
        );
        Fixture {
            clocks,
            r,
            observer,
            _tmp: tmp,
        }
    }

    /// Advances the clock to second `t` and feeds one packet (keyframes on
    /// even seconds).
    fn feed_second(f: &mut Fixture, t: u64) {
        let now = Duration::from_secs(t);
        let cur = f.clocks.monotonic();
        if now > cur {
            f.clocks.sleep(now - cur);
        }
        let mut pkt = video_packet(t as i64 * TIME_UNITS_PER_SEC, t % 2 == 0);
        pkt.arrival = now;
        f.r.handle_packet(&pkt).unwrap();
    }

    fn motion(f: &mut Fixture, t: u64, active: bool) {
        let now = Duration::from_secs(t);
        let cur = f.clocks.monotonic();
        if now > cur {
            f.clocks.sleep(now - cur);
        }
        f.r.handle_motion_event(MotionEvent {
            timestamp: BOOT + t as i64,
            active,
            confidence: 0.9,
        })
        .unwrap();
    }

    /// Pre-buffer 3 s, keyframes at even seconds, motion at t=10: the clip
    /// starts with the keyframe at t=8 and runs through the post-buffer
    /// after the motion ends.
    #[test]
    fn pre_roll_starts_at_keyframe() {
        let mut f = fixture(3, 300);
        assert_eq!(f.r.state(), MotionRecorderState::Buffering);
        for t in 0..=10 {
            feed_second(&mut f, t);
        }
        motion(&mut f, 10, true);
        assert_eq!(f.r.state(), MotionRecorderState::Recording);

        let events = f.observer.events.lock().unwrap().clone();
        assert_eq!(
            events,
            &[ObservedEvent::Started {
                id: 1,
                start_time: BOOT + 8,
            }]
        );

        // Motion ends at t=12; quiet from t=12; finalizing at t>14; the
        // post-buffer (10 s) holds the file open until t=24.
        feed_second(&mut f, 11);
        feed_second(&mut f, 12);
        motion(&mut f, 12, false);
        motion(&mut f, 12, true); // overlapping begin extends the clip
        for t in 13..=24 {
            feed_second(&mut f, t);
        }
        assert_eq!(f.r.state(), MotionRecorderState::Finalizing);
        feed_second(&mut f, 25);
        assert_eq!(f.r.state(), MotionRecorderState::Buffering);

        let events = f.observer.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        match &events[1] {
            ObservedEvent::Finalized { id, end_time, clean, .. } => {
                assert_eq!(*id, 1);
                assert!(*clean);
                // Quiet from t=12, finalizing just after t=14, +10 s post.
                assert!((BOOT + 24..=BOOT + 25).contains(end_time));
            }
            other => panic!("expected finalize, got {other:?}"),
        }
        // The file exists with the reported size.
        let paths = f.observer.paths.lock().unwrap().clone();
        let size = match events[1] {
            ObservedEvent::Finalized { size, .. } => size,
            _ => unreachable!(),
        };
        assert_eq!(std::fs::metadata(&paths[0]).unwrap().len() as i64, size);
    }

    #[test]
    fn overlapping_motion_extends_recording() {
        let mut f = fixture(3, 300);
        for t in 0..=4 {
            feed_second(&mut f, t);
        }
        motion(&mut f, 4, true);
        // Re-trigger every second; the recorder never finalizes.
        for t in 5..=20 {
            feed_second(&mut f, t);
            motion(&mut f, t, true);
        }
        assert_eq!(f.r.state(), MotionRecorderState::Recording);
        assert_eq!(f.observer.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn finalizing_returns_to_recording_on_new_motion() {
        let mut f = fixture(3, 300);
        for t in 0..=4 {
            feed_second(&mut f, t);
        }
        motion(&mut f, 4, true);
        // Quiet until finalizing.
        for t in 5..=8 {
            feed_second(&mut f, t);
        }
        assert_eq!(f.r.state(), MotionRecorderState::Finalizing);
        motion(&mut f, 8, true);
        assert_eq!(f.r.state(), MotionRecorderState::Recording);
        // Still one file.
        assert_eq!(f.observer.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn max_file_duration_rotates_without_leaving_recording() {
        let mut f = fixture(3, 5);
        for t in 0..=2 {
            feed_second(&mut f, t);
        }
        motion(&mut f, 2, true);
        for t in 3..=12 {
            feed_second(&mut f, t);
            motion(&mut f, t, true);
        }
        assert_eq!(f.r.state(), MotionRecorderState::Recording);
        let events = f.observer.events.lock().unwrap().clone();
        // Rotated at least once: start, finalize, start.
        assert!(events.len() >= 3);
        assert!(matches!(events[1], ObservedEvent::Finalized { clean: true, .. }));
        assert!(matches!(events[2], ObservedEvent::Started { .. }));
    }

    #[test]
    fn idle_without_pre_buffer_starts_at_next_keyframe() {
        let mut f = fixture(0, 300);
        assert_eq!(f.r.state(), MotionRecorderState::Idle);
        for t in 0..=4 {
            feed_second(&mut f, t);
        }
        // Nothing buffered, nothing recorded.
        assert!(f.observer.events.lock().unwrap().is_empty());

        motion(&mut f, 5, true);
        assert_eq!(f.r.state(), MotionRecorderState::Recording);
        // t=5 is not a keyframe; the clip opens at t=6.
        feed_second(&mut f, 5);
        assert!(f.observer.events.lock().unwrap().is_empty());
        feed_second(&mut f, 6);
        let events = f.observer.events.lock().unwrap().clone();
        assert_eq!(
            events,
            &[ObservedEvent::Started {
                id: 1,
                start_time: BOOT + 6,
            }]
        );
    }
}
