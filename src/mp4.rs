// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Fragmented `.mp4` muxing.
//!
//! Recordings and HLS media segments share one writer: an init segment
//! (`ftyp` + `moov` with `mvex`) followed by one `moof`+`mdat` pair per
//! keyframe-led fragment. Fragmented form means every prefix of a
//! crash-interrupted file stays decodable, which is exactly what a recorder
//! wants.
//!
//! See ISO/IEC 14496-12:2015 for the box definitions.

use std::io::Write;

use base::{err, Error};
use bytes::{BufMut, BytesMut};

use crate::stream::{AudioParams, VideoParams};

/// Writes a complete box: size placeholder, fourcc, body, then the size
/// patched over the placeholder.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = $buf.len();
        $buf.put_u32(0); // placeholder
        $buf.extend_from_slice($fourcc);
        $b;
        let len = $buf.len() - pos_start;
        $buf[pos_start..pos_start + 4].copy_from_slice(&(len as u32).to_be_bytes());
    }};
}

mod frag_flags {
    /// Ensure the 6 MSB reserved bits are set to 1 as some players expect.
    #[inline]
    pub const fn with_reserved(bits: u32) -> u32 {
        (bits & 0x03FF_FFFF) | 0xFC00_0000
    }

    // Non-sync (inter-frame): sample_is_non_sync_sample = 1.
    // RAP/keyframe (IDR): sample_depends_on = 2, does not depend on others.
    pub const NON_SYNC: u32 = with_reserved(0x0001_0000);
    pub const RAP: u32 = with_reserved(0x0200_0000);
}

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

fn mvhd(buf: &mut BytesMut, next_track_id: u32) {
    write_box!(buf, b"mvhd", {
        buf.put_u32(1 << 24); // version=1, flags=0
        buf.put_u64(0); // creation_time
        buf.put_u64(0); // modification_time
        buf.put_u32(crate::stream::TIME_UNITS_PER_SEC as u32); // timescale
        buf.put_u64(0); // duration: open-ended
        buf.put_u32(0x00010000); // rate
        buf.put_u16(0x0100); // volume
        buf.put_u16(0); // reserved
        buf.put_u64(0); // reserved
        for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
            buf.put_u32(*v); // matrix
        }
        for _ in 0..6 {
            buf.put_u32(0); // pre_defined
        }
        buf.put_u32(next_track_id);
    });
}

fn tkhd(buf: &mut BytesMut, track_id: u32, width: u32, height: u32, audio: bool) {
    write_box!(buf, b"tkhd", {
        buf.put_u32((1 << 24) | 3); // version=1, flags=enabled|in_movie
        buf.put_u64(0); // creation_time
        buf.put_u64(0); // modification_time
        buf.put_u32(track_id);
        buf.put_u32(0); // reserved
        buf.put_u64(0); // duration
        buf.put_u64(0); // reserved
        buf.put_u16(0); // layer
        buf.put_u16(0); // alternate_group
        buf.put_u16(if audio { 0x0100 } else { 0 }); // volume
        buf.put_u16(0); // reserved
        for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
            buf.put_u32(*v); // matrix
        }
        buf.put_u32(width << 16);
        buf.put_u32(height << 16);
    });
}

fn mdhd(buf: &mut BytesMut, timescale: u32) {
    write_box!(buf, b"mdhd", {
        buf.put_u32(1 << 24); // version=1
        buf.put_u64(0); // creation_time
        buf.put_u64(0); // modification_time
        buf.put_u32(timescale);
        buf.put_u64(0); // duration
        buf.put_u16(0x55c4); // language=und
        buf.put_u16(0); // pre_defined
    });
}

fn hdlr(buf: &mut BytesMut, handler: &[u8; 4], name: &[u8]) {
    write_box!(buf, b"hdlr", {
        buf.put_u32(0); // version, flags
        buf.put_u32(0); // pre_defined
        buf.extend_from_slice(handler);
        for _ in 0..3 {
            buf.put_u32(0); // reserved
        }
        buf.extend_from_slice(name);
        buf.put_u8(0); // null-terminated string
    });
}

fn empty_stbl(buf: &mut BytesMut, sample_entry: &[u8]) {
    write_box!(buf, b"stbl", {
        write_box!(buf, b"stsd", {
            buf.put_u32(0); // version, flags
            buf.put_u32(1); // entry_count
            buf.extend_from_slice(sample_entry);
        });
        write_box!(buf, b"stts", {
            buf.put_u64(0); // version, flags, entry_count
        });
        write_box!(buf, b"stsc", {
            buf.put_u64(0);
        });
        write_box!(buf, b"stsz", {
            buf.put_u32(0); // version, flags
            buf.put_u32(0); // sample_size
            buf.put_u32(0); // sample_count
        });
        write_box!(buf, b"stco", {
            buf.put_u64(0);
        });
    });
}

fn minf(buf: &mut BytesMut, sample_entry: &[u8], audio: bool) {
    write_box!(buf, b"minf", {
        if audio {
            write_box!(buf, b"smhd", {
                buf.put_u32(0); // version, flags
                buf.put_u32(0); // balance, reserved
            });
        } else {
            write_box!(buf, b"vmhd", {
                buf.put_u32(1); // version=0, flags=1
                buf.put_u64(0); // graphics_mode, opcolor
            });
        }
        write_box!(buf, b"dinf", {
            write_box!(buf, b"dref", {
                buf.put_u32(0); // version, flags
                buf.put_u32(1); // entry_count
                write_box!(buf, b"url ", {
                    buf.put_u32(1); // version=0, flags=self-contained
                });
            });
        });
        empty_stbl(buf, sample_entry);
    });
}

fn trex(buf: &mut BytesMut, track_id: u32) {
    write_box!(buf, b"trex", {
        buf.put_u32(0); // version, flags
        buf.put_u32(track_id);
        buf.put_u32(1); // default_sample_description_index
        buf.put_u32(0); // default_sample_duration (use trun)
        buf.put_u32(0); // default_sample_size (use trun)
        buf.put_u32(frag_flags::NON_SYNC); // default_sample_flags
    });
}

/// Writes the init segment (`ftyp` + `moov`) for the given tracks; every
/// fragment written by a [`FragmentBuilder`] with the same track layout can
/// follow it. Returns the number of bytes written.
pub fn write_init_segment<W: Write>(
    w: &mut W,
    video: &VideoParams,
    audio: Option<&AudioParams>,
) -> Result<u64, Error> {
    let mut buf = BytesMut::with_capacity(
        1024 + video.sample_entry.len() + audio.map_or(0, |a| a.sample_entry.len()),
    );
    write_box!(&mut buf, b"ftyp", {
        buf.extend_from_slice(b"isom"); // major_brand
        buf.extend_from_slice(&0x0000_0200u32.to_be_bytes()); // minor_version
        buf.extend_from_slice(b"isom"); // compat[0]
        buf.extend_from_slice(b"iso6"); // compat[1]
        buf.extend_from_slice(b"avc1"); // compat[2]
        buf.extend_from_slice(b"mp41"); // compat[3]
    });
    write_box!(&mut buf, b"moov", {
        let next_track_id = if audio.is_some() {
            AUDIO_TRACK_ID + 1
        } else {
            VIDEO_TRACK_ID + 1
        };
        mvhd(&mut buf, next_track_id);
        write_box!(&mut buf, b"trak", {
            tkhd(
                &mut buf,
                VIDEO_TRACK_ID,
                u32::from(video.width),
                u32::from(video.height),
                false,
            );
            write_box!(&mut buf, b"mdia", {
                mdhd(&mut buf, crate::stream::TIME_UNITS_PER_SEC as u32);
                hdlr(&mut buf, b"vide", b"Video Handler");
                minf(&mut buf, &video.sample_entry, false);
            });
        });
        if let Some(a) = audio {
            write_box!(&mut buf, b"trak", {
                tkhd(&mut buf, AUDIO_TRACK_ID, 0, 0, true);
                write_box!(&mut buf, b"mdia", {
                    mdhd(&mut buf, a.clock_rate);
                    hdlr(&mut buf, b"soun", b"Sound Handler");
                    minf(&mut buf, &a.sample_entry, true);
                });
            });
        }
        write_box!(&mut buf, b"mvex", {
            trex(&mut buf, VIDEO_TRACK_ID);
            if audio.is_some() {
                trex(&mut buf, AUDIO_TRACK_ID);
            }
        });
    });
    w.write_all(&buf)?;
    Ok(buf.len() as u64)
}

#[derive(Default)]
struct TrakState {
    /// Concatenated sample payloads for the pending fragment.
    data: Vec<u8>,

    /// Per-sample (duration, size) for the pending fragment, in the order
    /// they will land in `trun`.
    samples: Vec<(u32, u32)>,

    /// Timestamp of the most recent sample, in track clock units.
    last_ts: Option<i64>,

    /// Decode time of the start of the pending fragment (`tfdt`).
    fragment_start: u64,

    /// Total decode time written across all flushed fragments.
    total_elapsed: u64,

    first_sample_is_rap: bool,
    default_duration: u32,
}

impl TrakState {
    fn add_sample(&mut self, data: &[u8], ts: i64, is_rap: bool) -> Result<(), Error> {
        // The first sample in the track gets the nominal duration; later
        // samples carry the delta from their predecessor. Strict players
        // reject a zero first-sample duration.
        let duration = match self.last_ts {
            None => self.default_duration.max(1),
            Some(last) => u32::try_from((ts - last).max(0))
                .map_err(|e| err!(OutOfRange, msg("sample duration overflow"), source(e)))?,
        };
        self.last_ts = Some(ts);
        if self.samples.is_empty() {
            self.first_sample_is_rap = is_rap;
        }
        let size = u32::try_from(data.len())
            .map_err(|e| err!(OutOfRange, msg("sample too large"), source(e)))?;
        self.samples.push((duration, size));
        self.data.extend_from_slice(data);
        self.total_elapsed += u64::from(duration);
        Ok(())
    }

    /// Writes `tfdt` + `trun`; returns the moof-relative byte position of
    /// the `trun` data_offset to patch.
    fn write_fragment(&self, buf: &mut BytesMut) -> usize {
        write_box!(buf, b"tfdt", {
            buf.put_u32(1 << 24); // version=1, flags=0
            buf.put_u64(self.fragment_start);
        });

        const TRUN_DATA_OFFSET: u32 = 0x000001;
        const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
        const TRUN_SAMPLE_DURATION: u32 = 0x000100;
        const TRUN_SAMPLE_SIZE: u32 = 0x000200;

        let data_offset_pos;
        write_box!(buf, b"trun", {
            buf.put_u32(
                TRUN_DATA_OFFSET | TRUN_FIRST_SAMPLE_FLAGS | TRUN_SAMPLE_DURATION
                    | TRUN_SAMPLE_SIZE,
            );
            buf.put_u32(self.samples.len() as u32);
            data_offset_pos = buf.len();
            buf.put_i32(0); // data_offset placeholder
            buf.put_u32(if self.first_sample_is_rap {
                frag_flags::RAP
            } else {
                frag_flags::NON_SYNC
            });
            for (dur, sz) in &self.samples {
                buf.put_u32(*dur);
                buf.put_u32(*sz);
            }
        });
        data_offset_pos
    }

    fn clear(&mut self) {
        self.data.clear();
        self.samples.clear();
        self.fragment_start = self.total_elapsed;
        self.first_sample_is_rap = false;
    }
}

/// Accumulates samples and emits `moof`+`mdat` pairs.
///
/// One builder per output file for self-contained recordings (timestamps
/// restart at zero); one long-lived builder for HLS so decode times stay
/// continuous across media segments.
pub struct FragmentBuilder {
    seq_no: u32,
    video: TrakState,
    audio: Option<TrakState>,
}

impl FragmentBuilder {
    /// `video_frame_ticks` is the nominal frame duration in 90 kHz units;
    /// `audio_default_ticks` likewise in the audio clock, when an audio
    /// track exists.
    pub fn new(video_frame_ticks: u32, audio_default_ticks: Option<u32>) -> Self {
        FragmentBuilder {
            seq_no: 1,
            video: TrakState {
                default_duration: video_frame_ticks,
                ..Default::default()
            },
            audio: audio_default_ticks.map(|d| TrakState {
                default_duration: d,
                ..Default::default()
            }),
        }
    }

    pub fn add_video(&mut self, data: &[u8], pts: i64, is_key: bool) -> Result<(), Error> {
        self.video.add_sample(data, pts, is_key)
    }

    pub fn add_audio(&mut self, data: &[u8], pts: i64) -> Result<(), Error> {
        match &mut self.audio {
            Some(a) => a.add_sample(data, pts, false),
            // Audio packets with no audio track are the caller's bug; drop
            // loudly in debug builds only.
            None => {
                debug_assert!(false, "audio sample without an audio track");
                Ok(())
            }
        }
    }

    pub fn has_samples(&self) -> bool {
        !self.video.samples.is_empty()
            || self.audio.as_ref().is_some_and(|a| !a.samples.is_empty())
    }

    /// Duration of video flushed so far plus pending, in 90 kHz units.
    pub fn video_elapsed_90k(&self) -> u64 {
        self.video.total_elapsed
    }

    /// Timestamp of the most recent video sample, if any.
    pub fn last_video_pts(&self) -> Option<i64> {
        self.video.last_ts
    }

    /// Writes the pending fragment as `moof`+`mdat` and clears it. A no-op
    /// returning 0 bytes when nothing is pending.
    pub fn flush<W: Write>(&mut self, w: &mut W) -> Result<u64, Error> {
        if !self.has_samples() {
            return Ok(0);
        }
        let mut moof = BytesMut::with_capacity(
            512 + 8 * (self.video.samples.len()
                + self.audio.as_ref().map_or(0, |a| a.samples.len())),
        );
        let mut video_offset_pos = None;
        let mut audio_offset_pos = None;
        write_box!(&mut moof, b"moof", {
            write_box!(&mut moof, b"mfhd", {
                moof.put_u32(0); // version, flags
                moof.put_u32(self.seq_no);
            });
            if !self.video.samples.is_empty() {
                write_box!(&mut moof, b"traf", {
                    write_box!(&mut moof, b"tfhd", {
                        moof.put_u32(0x020000); // default-base-is-moof
                        moof.put_u32(VIDEO_TRACK_ID);
                    });
                    video_offset_pos = Some(self.video.write_fragment(&mut moof));
                });
            }
            if let Some(a) = &self.audio {
                if !a.samples.is_empty() {
                    write_box!(&mut moof, b"traf", {
                        write_box!(&mut moof, b"tfhd", {
                            moof.put_u32(0x020000);
                            moof.put_u32(AUDIO_TRACK_ID);
                        });
                        audio_offset_pos = Some(a.write_fragment(&mut moof));
                    });
                }
            }
        });

        // Patch trun data offsets: video payload starts right after the
        // mdat header; audio follows the video bytes.
        let base = moof.len() as i32 + 8;
        if let Some(pos) = video_offset_pos {
            moof[pos..pos + 4].copy_from_slice(&base.to_be_bytes());
        }
        if let Some(pos) = audio_offset_pos {
            let off = base + self.video.data.len() as i32;
            moof[pos..pos + 4].copy_from_slice(&off.to_be_bytes());
        }

        let audio_len = self.audio.as_ref().map_or(0, |a| a.data.len());
        let mdat_size = u32::try_from(8 + self.video.data.len() + audio_len)
            .map_err(|e| err!(OutOfRange, msg("fragment too large"), source(e)))?;
        w.write_all(&moof)?;
        w.write_all(&mdat_size.to_be_bytes())?;
        w.write_all(b"mdat")?;
        w.write_all(&self.video.data)?;
        if let Some(a) = &self.audio {
            w.write_all(&a.data)?;
        }
        let written = moof.len() as u64 + u64::from(mdat_size);

        self.seq_no = self.seq_no.wrapping_add(1);
        self.video.clear();
        if let Some(a) = &mut self.audio {
            a.clear();
        }
        Ok(written)
    }
}
