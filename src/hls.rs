// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HLS live output: a rolling playlist over fMP4 media segments.
//!
//! `init.mp4` is written once; media segments `seg_<n>.m4s` are keyframe-led
//! and roughly `target_duration` long. The playlist references only segments
//! that closed successfully and is rewritten atomically (tmp + rename), so a
//! reader never sees a half-written playlist or a missing segment.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use base::{err, Error};
use tracing::{debug, warn};

use crate::mp4::{self, FragmentBuilder};
use crate::stream::{AudioParams, Packet, PacketSink, Track, VideoParams, TIME_UNITS_PER_SEC};

pub const DEFAULT_TARGET_DURATION_SECS: u32 = 2;
pub const DEFAULT_WINDOW: usize = 6;

const INIT_NAME: &str = "init.mp4";
const PLAYLIST_NAME: &str = "stream.m3u8";

pub struct HlsOptions {
    pub dir: PathBuf,
    pub target_duration_secs: u32,
    pub window: usize,
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    index: u64,
    start_pts: i64,
}

/// A [`PacketSink`] writing a sliding window of live segments.
pub struct HlsSegmenter {
    opts: HlsOptions,
    frag: FragmentBuilder,
    audio: Option<AudioParams>,
    current: Option<OpenSegment>,
    next_index: u64,

    /// Closed segments currently referenced by the playlist.
    window: VecDeque<(u64, f64)>,

    ended: bool,
}

impl HlsSegmenter {
    pub fn new(
        opts: HlsOptions,
        video: &VideoParams,
        audio: Option<AudioParams>,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&opts.dir)?;
        let mut init = File::create(opts.dir.join(INIT_NAME))?;
        mp4::write_init_segment(&mut init, video, audio.as_ref())?;
        init.sync_all()?;
        let frame_ticks =
            (TIME_UNITS_PER_SEC / i64::from(video.fps.unwrap_or(30).max(1))) as u32;
        let audio_ticks = audio.as_ref().map(|a| (a.clock_rate / 50).max(1));
        Ok(HlsSegmenter {
            opts,
            frag: FragmentBuilder::new(frame_ticks, audio_ticks),
            audio,
            current: None,
            next_index: 0,
            window: VecDeque::new(),
            ended: false,
        })
    }

    fn begin_segment(&mut self, start_pts: i64) -> Result<(), Error> {
        let index = self.next_index;
        self.next_index += 1;
        let path = self.opts.dir.join(format!("seg_{index}.m4s"));
        let file = File::create(&path)
            .map_err(|e| err!(Internal, msg("unable to create {}", path.display()), source(e)))?;
        self.current = Some(OpenSegment {
            file,
            path,
            index,
            start_pts,
        });
        Ok(())
    }

    /// Closes the open segment, publishes it in the playlist, and prunes the
    /// window.
    fn close_segment(&mut self, end_pts: i64) -> Result<(), Error> {
        let Some(mut seg) = self.current.take() else {
            return Ok(());
        };
        self.frag.flush(&mut seg.file)?;
        seg.file.flush()?;
        let duration = (end_pts - seg.start_pts).max(0) as f64 / TIME_UNITS_PER_SEC as f64;
        self.window.push_back((seg.index, duration));
        while self.window.len() > self.opts.window {
            let (old, _) = self.window.pop_front().unwrap();
            let path = self.opts.dir.join(format!("seg_{old}.m4s"));
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("unable to remove expired {}: {e}", path.display());
            }
        }
        self.write_playlist()
    }

    /// Discards the open segment after a write error, leaving the playlist
    /// untouched: it only ever references segments that closed cleanly.
    fn discard_segment(&mut self, e: &Error) {
        warn!(err = %e.chain(), "hls write error; discarding segment");
        if let Some(seg) = self.current.take() {
            drop(seg.file);
            let _ = std::fs::remove_file(&seg.path);
        }
    }

    fn write_playlist(&self) -> Result<(), Error> {
        let target = self
            .window
            .iter()
            .map(|(_, d)| d.ceil() as u64)
            .max()
            .unwrap_or(u64::from(self.opts.target_duration_secs));
        let media_sequence = self.window.front().map(|(i, _)| *i).unwrap_or(0);
        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:7\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
        out.push_str(&format!("#EXT-X-MAP:URI=\"{INIT_NAME}\"\n"));
        for (index, duration) in &self.window {
            out.push_str(&format!("#EXTINF:{duration:.3},\nseg_{index}.m4s\n"));
        }
        if self.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        let tmp = self.opts.dir.join(format!("{PLAYLIST_NAME}.tmp"));
        let final_path = self.opts.dir.join(PLAYLIST_NAME);
        {
            let mut f = File::create(&tmp)?;
            f.write_all(out.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }

    fn write_inner(&mut self, pkt: &Packet) -> Result<(), Error> {
        let Some(pts) = pkt.pts else {
            return Ok(());
        };
        match pkt.track {
            Track::Video => {
                if pkt.is_keyframe {
                    // The pending GOP belongs to the open segment.
                    if let Some(seg) = &mut self.current {
                        self.frag.flush(&mut seg.file)?;
                        let elapsed = pts - seg.start_pts;
                        if elapsed
                            >= i64::from(self.opts.target_duration_secs) * TIME_UNITS_PER_SEC
                        {
                            self.close_segment(pts)?;
                        }
                    }
                    if self.current.is_none() {
                        self.begin_segment(pts)?;
                    }
                } else if self.current.is_none() {
                    return Ok(()); // wait for a keyframe.
                }
                self.frag.add_video(&pkt.data, pts, pkt.is_keyframe)?;
            }
            Track::Audio => {
                if self.audio.is_none() || self.current.is_none() {
                    return Ok(());
                }
                self.frag.add_audio(&pkt.data, pts)?;
            }
        }
        Ok(())
    }
}

impl PacketSink for HlsSegmenter {
    fn label(&self) -> &str {
        "hls"
    }

    fn write(&mut self, pkt: &Packet) -> Result<(), Error> {
        if let Err(e) = self.write_inner(pkt) {
            self.discard_segment(&e);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.ended = true;
        match self.current.as_ref().map(|seg| {
            // The tail segment ends at its last sample.
            self.frag.last_video_pts().unwrap_or(seg.start_pts)
        }) {
            Some(end_pts) => self.close_segment(end_pts)?,
            None => self.write_playlist()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::{test_video_params, video_packet};

    fn feed(h: &mut HlsSegmenter, secs: std::ops::Range<i64>) {
        // 1 fps with keyframes every 2 s.
        for t in secs {
            let pkt = video_packet(t * TIME_UNITS_PER_SEC, t % 2 == 0);
            h.write(&pkt).unwrap();
        }
    }

    fn playlist(dir: &std::path::Path) -> String {
        std::fs::read_to_string(dir.join(PLAYLIST_NAME)).unwrap()
    }

    #[test]
    fn rolling_window() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let mut h = HlsSegmenter::new(
            HlsOptions {
                dir: tmp.path().to_owned(),
                target_duration_secs: 2,
                window: 3,
            },
            &test_video_params(),
            None,
        )
        .unwrap();

        feed(&mut h, 0..13);

        assert!(tmp.path().join(INIT_NAME).exists());
        let p = playlist(tmp.path());
        assert!(p.starts_with("#EXTM3U"));
        assert!(p.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        // 6 segments closed (0..5); the window keeps the last 3.
        assert!(p.contains("seg_3.m4s") && p.contains("seg_4.m4s") && p.contains("seg_5.m4s"));
        assert!(!p.contains("seg_0.m4s") && !p.contains("seg_2.m4s"));
        assert!(p.contains("#EXT-X-MEDIA-SEQUENCE:3"));
        assert!(!p.contains("#EXT-X-ENDLIST"));

        // Expired segment files are gone; referenced ones exist.
        assert!(!tmp.path().join("seg_0.m4s").exists());
        for i in 3..=5 {
            assert!(tmp.path().join(format!("seg_{i}.m4s")).exists());
        }
        // No stray tmp file.
        assert!(!tmp.path().join(format!("{PLAYLIST_NAME}.tmp")).exists());

        h.finish().unwrap();
        let p = playlist(tmp.path());
        assert!(p.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn playlist_only_references_closed_segments() {
        db::testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let mut h = HlsSegmenter::new(
            HlsOptions {
                dir: tmp.path().to_owned(),
                target_duration_secs: 2,
                window: 4,
            },
            &test_video_params(),
            None,
        )
        .unwrap();

        // One open segment, nothing closed: no playlist entries yet.
        feed(&mut h, 0..2);
        assert!(!tmp.path().join(PLAYLIST_NAME).exists());

        // Crossing the boundary closes segment 0.
        feed(&mut h, 2..3);
        let p = playlist(tmp.path());
        assert!(p.contains("seg_0.m4s"));
        assert!(!p.contains("seg_1.m4s"));
        assert!(p.contains("#EXTINF:2.000"));
    }
}
