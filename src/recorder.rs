// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The segment recorder: turns the per-stream packet sequence into a series
//! of fixed-duration MP4 files.
//!
//! Rotation is armed when the wall clock passes a boundary on the fixed
//! `segment_duration` grid measured from the first segment's start, and
//! performed on the next keyframe. Every file therefore begins on a
//! keyframe, and segment length is bounded by `segment_duration` plus one
//! GOP.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base::clock::Clocks;
use base::{err, Error};
use tracing::{debug, warn};

use crate::mp4::{self, FragmentBuilder};
use crate::stream::{AudioParams, Packet, PacketSink, Track, VideoParams, TIME_UNITS_PER_SEC};

/// Tear down and reopen the demuxer after this many finalized segments, to
/// bound long-running resource growth.
pub const DEFAULT_DEMUX_RESET_SEGMENTS: u64 = 10;

/// Stream properties recorded in each segment's metadata row.
#[derive(Clone, Debug)]
pub struct SegmentMeta {
    pub codec: String,
    pub width: u16,
    pub height: u16,
    pub fps: Option<u32>,
}

impl SegmentMeta {
    pub fn from_params(v: &VideoParams) -> Self {
        SegmentMeta {
            codec: v.rfc6381_codec.clone(),
            width: v.width,
            height: v.height,
            fps: v.fps,
        }
    }
}

/// Receives segment lifecycle callbacks, so the metadata row is created at a
/// moment aligned to the first playable frame.
///
/// For segment N+1, `on_segment_started` is called strictly after segment
/// N's `on_segment_finalized`.
pub trait SegmentObserver: Send {
    /// A new file began with a keyframe at `start_time` (epoch seconds).
    /// Returns an id to hand back on finalization.
    fn on_segment_started(
        &mut self,
        path: &Path,
        start_time: i64,
        meta: &SegmentMeta,
        trigger: db::TriggerType,
    ) -> Result<i64, Error>;

    /// The file is closed on disk with the given final size. `clean` is
    /// false when a write error forced the close.
    fn on_segment_finalized(
        &mut self,
        id: i64,
        end_time: i64,
        size_bytes: i64,
        clean: bool,
    ) -> Result<(), Error>;
}

/// The production observer: one metadata row per segment, plus an event on
/// unclean closes.
pub struct DbObserver<C: Clocks + Clone> {
    db: Arc<db::Database<C>>,
    stream_name: String,
}

impl<C: Clocks + Clone> DbObserver<C> {
    pub fn new(db: Arc<db::Database<C>>, stream_name: String) -> Self {
        DbObserver { db, stream_name }
    }
}

impl<C: Clocks + Clone> SegmentObserver for DbObserver<C> {
    fn on_segment_started(
        &mut self,
        path: &Path,
        start_time: i64,
        meta: &SegmentMeta,
        trigger: db::TriggerType,
    ) -> Result<i64, Error> {
        let insert = db::RecordingToInsert {
            stream_name: self.stream_name.clone(),
            file_path: path.to_string_lossy().into_owned(),
            start_time,
            codec: Some(meta.codec.clone()),
            width: Some(u32::from(meta.width)),
            height: Some(u32::from(meta.height)),
            fps: meta.fps,
            trigger_type: trigger,
        };
        let mut l = self.db.lock();
        match l.add_recording(&insert) {
            Ok(id) => Ok(id),
            Err(e) if e.kind() == base::ErrorKind::FailedPrecondition => {
                // A previous process crashed with a recording open. Close the
                // stale row so this stream can record again.
                warn!(
                    stream = %self.stream_name,
                    "closing stale uncompleted recording before starting a new one"
                );
                let stale = l.query_recordings(&db::RecordingQuery {
                    stream_name: Some(self.stream_name.clone()),
                    is_complete: Some(false),
                    ..Default::default()
                })?;
                for r in stale {
                    let size = std::fs::metadata(&r.file_path).map(|m| m.len()).unwrap_or(0);
                    l.update_recording(
                        r.id,
                        &db::RecordingUpdate {
                            end_time: Some(start_time),
                            size_bytes: Some(size as i64),
                            is_complete: Some(true),
                        },
                    )?;
                }
                l.add_recording(&insert)
            }
            Err(e) => Err(e),
        }
    }

    fn on_segment_finalized(
        &mut self,
        id: i64,
        end_time: i64,
        size_bytes: i64,
        clean: bool,
    ) -> Result<(), Error> {
        let mut l = self.db.lock();
        l.update_recording(
            id,
            &db::RecordingUpdate {
                end_time: Some(end_time),
                size_bytes: Some(size_bytes),
                is_complete: Some(true),
            },
        )?;
        if !clean {
            l.add_event(
                end_time,
                db::EventType::RecordingStop,
                Some(&self.stream_name),
                "recording closed after write failure",
                None,
            )?;
        }
        Ok(())
    }
}

/// Builds `<root>/<stream>/<YYYY>/<MM>/<DD>/<stream>_<YYYYMMDD_HHMMSS>_<trigger>.mp4`
/// (UTC) and creates the directories, mode 0755, as needed.
pub(crate) fn segment_path(
    root: &Path,
    stream_name: &str,
    when: jiff::Timestamp,
    trigger: db::TriggerType,
) -> Result<PathBuf, Error> {
    let z = when.to_zoned(jiff::tz::TimeZone::UTC);
    let dir = root
        .join(stream_name)
        .join(z.strftime("%Y").to_string())
        .join(z.strftime("%m").to_string())
        .join(z.strftime("%d").to_string());
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut b = std::fs::DirBuilder::new();
        b.recursive(true).mode(0o755);
        b.create(&dir)
            .map_err(|e| err!(Internal, msg("unable to create {}", dir.display()), source(e)))?;
    }
    Ok(dir.join(format!(
        "{stream_name}_{}_{}.mp4",
        z.strftime("%Y%m%d_%H%M%S"),
        trigger.as_str()
    )))
}

/// One open MP4 file: init segment plus appended fragments. Shared between
/// the segment recorder and the motion event recorder.
pub(crate) struct SegmentFile {
    path: PathBuf,
    file: std::fs::File,
    frag: FragmentBuilder,
    bytes_written: u64,
    video_samples: u64,
}

impl SegmentFile {
    pub fn create(
        root: &Path,
        stream_name: &str,
        now: jiff::Timestamp,
        trigger: db::TriggerType,
        video: &VideoParams,
        audio: Option<&AudioParams>,
        frame_ticks: u32,
    ) -> Result<Self, Error> {
        let path = segment_path(root, stream_name, now, trigger)?;
        let mut file = std::fs::File::create(&path)
            .map_err(|e| err!(Internal, msg("unable to create {}", path.display()), source(e)))?;
        let bytes_written = mp4::write_init_segment(&mut file, video, audio)?;
        // Audio sample durations come from timestamp deltas; a nominal 20 ms
        // covers the first sample.
        let audio_ticks = audio.map(|a| (a.clock_rate / 50).max(1));
        Ok(SegmentFile {
            path,
            file,
            frag: FragmentBuilder::new(frame_ticks, audio_ticks),
            bytes_written,
            video_samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn video_samples(&self) -> u64 {
        self.video_samples
    }

    /// Appends one packet. Closes the pending fragment first when a
    /// keyframe arrives, so fragments are keyframe-led GOPs.
    pub fn add_packet(&mut self, pkt: &Packet) -> Result<(), Error> {
        let Some(pts) = pkt.pts else {
            debug!("dropping packet with unrepaired pts");
            return Ok(());
        };
        match pkt.track {
            Track::Video => {
                if pkt.is_keyframe {
                    self.bytes_written += self.frag.flush(&mut self.file)?;
                }
                self.frag.add_video(&pkt.data, pts, pkt.is_keyframe)?;
                self.video_samples += 1;
            }
            Track::Audio => self.frag.add_audio(&pkt.data, pts)?,
        }
        Ok(())
    }

    /// Flushes pending samples and syncs; returns the final byte size.
    pub fn finalize(mut self) -> Result<u64, Error> {
        self.bytes_written += self.frag.flush(&mut self.file)?;
        self.file.sync_all()?;
        Ok(self.bytes_written)
    }
}

pub struct SegmentRecorderOptions {
    pub storage_root: PathBuf,
    pub stream_name: String,
    pub segment_duration: std::time::Duration,
    pub record_audio: bool,
    pub trigger: db::TriggerType,
}

/// A [`PacketSink`] producing fixed-duration MP4 segments.
pub struct SegmentRecorder<C: Clocks + Clone> {
    clocks: C,
    opts: SegmentRecorderOptions,
    observer: Box<dyn SegmentObserver>,
    video: VideoParams,
    audio: Option<AudioParams>,
    meta: SegmentMeta,
    frame_ticks: u32,

    current: Option<(SegmentFile, i64)>, // (file, row id)

    /// Next rotation boundary (epoch seconds) on the fixed grid.
    next_rotate: Option<i64>,

    /// Total finalized segments; the ingest loop reads this to schedule
    /// periodic demuxer teardown.
    segments_finalized: Arc<AtomicU64>,
}

impl<C: Clocks + Clone> SegmentRecorder<C> {
    pub fn new(
        clocks: C,
        opts: SegmentRecorderOptions,
        observer: Box<dyn SegmentObserver>,
        video: VideoParams,
        audio: Option<AudioParams>,
    ) -> Self {
        let meta = SegmentMeta::from_params(&video);
        let frame_ticks = (TIME_UNITS_PER_SEC / i64::from(video.fps.unwrap_or(30).max(1))) as u32;
        let audio = if opts.record_audio { audio } else { None };
        SegmentRecorder {
            clocks,
            opts,
            observer,
            video,
            audio,
            meta,
            frame_ticks,
            current: None,
            next_rotate: None,
            segments_finalized: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of finalized segments, shared with the ingest loop.
    pub fn segments_finalized(&self) -> Arc<AtomicU64> {
        self.segments_finalized.clone()
    }

    fn start_segment(&mut self, now: jiff::Timestamp) -> Result<(), Error> {
        let file = SegmentFile::create(
            &self.opts.storage_root,
            &self.opts.stream_name,
            now,
            self.opts.trigger,
            &self.video,
            self.audio.as_ref(),
            self.frame_ticks,
        )?;
        let start = now.as_second();
        let id =
            self.observer
                .on_segment_started(file.path(), start, &self.meta, self.opts.trigger)?;
        let d = self.opts.segment_duration.as_secs() as i64;
        // Keep rotation on the grid established by the first segment.
        let next = match self.next_rotate {
            None => start + d,
            Some(mut boundary) => {
                while boundary <= start {
                    boundary += d;
                }
                boundary
            }
        };
        self.next_rotate = Some(next);
        self.current = Some((file, id));
        Ok(())
    }

    fn finalize_current(&mut self, end_time: i64, clean: bool) -> Result<(), Error> {
        if let Some((file, id)) = self.current.take() {
            let size = file.finalize()?;
            self.observer
                .on_segment_finalized(id, end_time, size as i64, clean)?;
            self.segments_finalized.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Closes the current segment as a partial after a write error and
    /// forgets it; recording resumes at the next keyframe.
    fn close_after_write_error(&mut self, e: &Error) {
        warn!(
            stream = %self.opts.stream_name,
            err = %e.chain(),
            "write error; closing segment as partial"
        );
        let now = self.clocks.realtime().as_second();
        if let Some((file, id)) = self.current.take() {
            let size = file.bytes_written();
            drop(file); // best effort; the write already failed.
            if let Err(e2) = self.observer.on_segment_finalized(id, now, size as i64, false) {
                warn!(err = %e2.chain(), "unable to record partial segment");
            }
            self.segments_finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn write_inner(&mut self, pkt: &Packet) -> Result<(), Error> {
        let now = self.clocks.realtime();
        match pkt.track {
            Track::Video => {
                if pkt.is_keyframe {
                    let armed = self
                        .next_rotate
                        .is_some_and(|b| self.current.is_some() && now.as_second() >= b);
                    if armed {
                        self.finalize_current(now.as_second(), true)?;
                    }
                    if self.current.is_none() {
                        self.start_segment(now)?;
                    }
                } else if self.current.is_none() {
                    // Wait for a keyframe to begin the file.
                    return Ok(());
                }
            }
            Track::Audio => {
                if self.audio.is_none() || self.current.is_none() {
                    return Ok(());
                }
            }
        }
        if let Some((file, _)) = &mut self.current {
            file.add_packet(pkt)?;
        }
        Ok(())
    }
}

impl<C: Clocks + Clone> PacketSink for SegmentRecorder<C> {
    fn label(&self) -> &str {
        "recorder"
    }

    fn write(&mut self, pkt: &Packet) -> Result<(), Error> {
        if let Err(e) = self.write_inner(pkt) {
            // A failed write closes the segment as a partial; the stream
            // itself is still healthy, so don't error the fan-out.
            self.close_after_write_error(&e);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let now = self.clocks.realtime().as_second();
        self.finalize_current(now, true)
    }
}

impl<C: Clocks + Clone> Drop for SegmentRecorder<C> {
    fn drop(&mut self) {
        if self.current.is_some() {
            let now = self.clocks.realtime().as_second();
            if let Err(e) = self.finalize_current(now, true) {
                warn!(err = %e.chain(), "unable to finalize segment on drop");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, PartialEq)]
    pub enum ObservedEvent {
        Started { id: i64, start_time: i64 },
        Finalized { id: i64, end_time: i64, size: i64, clean: bool },
    }

    /// Records callbacks and verifies paths exist with the reported size.
    #[derive(Clone, Default)]
    pub struct RecordingObserver {
        pub events: Arc<Mutex<Vec<ObservedEvent>>>,
        pub paths: Arc<Mutex<Vec<PathBuf>>>,
        next_id: Arc<Mutex<i64>>,
    }

    impl SegmentObserver for RecordingObserver {
        fn on_segment_started(
            &mut self,
            path: &Path,
            start_time: i64,
            _meta: &SegmentMeta,
            _trigger: db::TriggerType,
        ) -> Result<i64, Error> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = *next;
            self.paths.lock().unwrap().push(path.to_owned());
            self.events
                .lock()
                .unwrap()
                .push(ObservedEvent::Started { id, start_time });
            Ok(id)
        }

        fn on_segment_finalized(
            &mut self,
            id: i64,
            end_time: i64,
            size: i64,
            clean: bool,
        ) -> Result<(), Error> {
            self.events.lock().unwrap().push(ObservedEvent::Finalized {
                id,
                end_time,
                size,
                clean,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{ObservedEvent, RecordingObserver};
    use super::*;
    use crate::stream::testutil::{test_video_params, video_packet};
    use base::clock::SimulatedClocks;
    use std::time::Duration;

    const BOOT: i64 = 1_700_000_000;

    fn recorder_with_observer(
        tmp: &std::path::Path,
        clocks: SimulatedClocks,
        segment_duration: u64,
    ) -> (SegmentRecorder<SimulatedClocks>, RecordingObserver) {
        let observer = RecordingObserver::default();
        let r = SegmentRecorder::new(
            clocks,
            SegmentRecorderOptions {
                storage_root: tmp.to_owned(),
                stream_name: "cam".to_owned(),
                segment_duration: Duration::from_secs(segment_duration),
                record_audio: false,
                trigger: db::TriggerType::Scheduled,
            },
            Box::new(observer.clone()),
            test_video_params(),
            None,
        );
        (r, observer)
    }

    /// 5 s segments, 2 s GOP, 11 s of input with keyframes at even seconds:
    /// segments start at t=0, t=6 (armed at 5, swap at next keyframe), and
    /// t=10 (armed at the t=10 grid boundary).
    #[test]
    fn rotation_armed_then_swapped_on_keyframe() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(BOOT).unwrap());
        let (mut r, observer) = recorder_with_observer(tmp.path(), clocks.clone(), 5);

        for t in 0..=10i64 {
            let mut pkt = video_packet(t * 90_000, t % 2 == 0);
            pkt.arrival = Duration::from_secs(t as u64);
            r.write(&pkt).unwrap();
            clocks.sleep(Duration::from_secs(1));
        }
        r.finish().unwrap();

        let events = observer.events.lock().unwrap().clone();
        let starts: Vec<i64> = events
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Started { start_time, .. } => Some(start_time - BOOT),
                _ => None,
            })
            .collect();
        assert_eq!(starts, &[0, 6, 10]);

        // Finalize of segment N strictly precedes start of segment N+1.
        let order: Vec<&str> = events
            .iter()
            .map(|e| match e {
                ObservedEvent::Started { .. } => "start",
                ObservedEvent::Finalized { .. } => "finalize",
            })
            .collect();
        assert_eq!(
            order,
            &["start", "finalize", "start", "finalize", "start", "finalize"]
        );

        // Reported sizes match the files on disk, and all three exist.
        let paths = observer.paths.lock().unwrap().clone();
        assert_eq!(paths.len(), 3);
        let sizes: Vec<i64> = events
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Finalized { size, clean, .. } => {
                    assert!(clean);
                    Some(*size)
                }
                _ => None,
            })
            .collect();
        for (path, size) in paths.iter().zip(&sizes) {
            assert_eq!(std::fs::metadata(path).unwrap().len() as i64, *size);
        }
        assert_eq!(r.segments_finalized().load(Ordering::SeqCst), 3);
    }

    #[test]
    fn waits_for_keyframe_before_first_segment() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(BOOT).unwrap());
        let (mut r, observer) = recorder_with_observer(tmp.path(), clocks.clone(), 5);

        // Non-keyframes are dropped until the first keyframe.
        for t in 0..3i64 {
            r.write(&video_packet(t * 90_000, false)).unwrap();
            clocks.sleep(Duration::from_secs(1));
        }
        assert!(observer.events.lock().unwrap().is_empty());
        r.write(&video_packet(3 * 90_000, true)).unwrap();
        let events = observer.events.lock().unwrap().clone();
        assert!(matches!(events[0], ObservedEvent::Started { .. }));
    }

    #[test]
    fn path_layout() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        // 2026-01-31 04:05:06 UTC.
        let when = jiff::Timestamp::from_second(1_769_832_306).unwrap();
        let p = segment_path(tmp.path(), "porch", when, db::TriggerType::Motion).unwrap();
        let rel = p.strip_prefix(tmp.path()).unwrap();
        assert_eq!(
            rel.to_str().unwrap(),
            "porch/2026/01/31/porch_20260131_040506_motion.mp4"
        );
        assert!(p.parent().unwrap().is_dir());
    }
}
