// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! PTS/DTS continuity repair, applied before every packet write.
//!
//! UDP sources in particular arrive with missing or discontinuous
//! timestamps; this keeps the sequence monotone non-decreasing so the muxer
//! never sees a negative sample duration.

use tracing::debug;

use crate::stream::{Packet, TIME_UNITS_PER_SEC};

/// Nominal duration of one frame in 90 kHz units at the default 30 fps.
pub const DEFAULT_FRAME_DURATION: i64 = 3000;

/// Discontinuities are logged on the 1st, 11th, 21st, … occurrence.
const DISCONTINUITY_LOG_INTERVAL: u64 = 10;

/// Discontinuity when the delta from the expected timestamp exceeds this
/// many frame durations.
const DISCONTINUITY_FRAMES: i64 = 10;

/// Beyond this many frame durations the timestamp is forced back onto the
/// expected sequence (UDP only).
const FORCE_FRAMES: i64 = 100;

/// Per-track timestamp repair state.
pub struct TimestampTracker {
    label: String,
    is_udp: bool,
    frame_duration: i64,
    last_pts: Option<i64>,
    last_dts: Option<i64>,
    expected_next_pts: Option<i64>,
    discontinuity_count: u64,
}

impl TimestampTracker {
    /// `fps` is the average frame rate if known; the frame duration is
    /// `timescale / fps`, defaulting to 3000 at 1/90000.
    pub fn new(label: String, is_udp: bool, fps: Option<u32>) -> Self {
        let frame_duration = match fps {
            Some(fps) if fps > 0 => TIME_UNITS_PER_SEC / i64::from(fps),
            _ => DEFAULT_FRAME_DURATION,
        };
        TimestampTracker {
            label,
            is_udp,
            frame_duration,
            last_pts: None,
            last_dts: None,
            expected_next_pts: None,
            discontinuity_count: 0,
        }
    }

    pub fn discontinuity_count(&self) -> u64 {
        self.discontinuity_count
    }

    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    /// Repairs `pkt` in place; afterwards `pkt.pts` and `pkt.dts` are always
    /// `Some` and monotone non-decreasing with respect to earlier packets.
    pub fn repair(&mut self, pkt: &mut Packet) {
        // Fill in missing stamps from whichever side is present.
        let mut pts = match (pkt.pts, pkt.dts) {
            (Some(p), _) => p,
            (None, Some(d)) => {
                debug!("{}: missing pts; using dts {d}", self.label);
                d
            }
            (None, None) => match self.last_pts {
                Some(last) => {
                    debug!("{}: missing pts and dts; extrapolating", self.label);
                    last + self.frame_duration
                }
                None => 1,
            },
        };
        let mut dts = match (pkt.dts, pkt.pts) {
            (Some(d), _) => d,
            (None, _) => pts,
        };

        if let Some(expected) = self.expected_next_pts {
            let delta = (pts - expected).abs();
            if delta > DISCONTINUITY_FRAMES * self.frame_duration {
                self.discontinuity_count += 1;
                if self.discontinuity_count % DISCONTINUITY_LOG_INTERVAL == 1 {
                    debug!(
                        "{}: timestamp discontinuity #{}: pts {pts}, expected {expected}",
                        self.label, self.discontinuity_count
                    );
                }
                if self.is_udp && delta > FORCE_FRAMES * self.frame_duration {
                    pts = expected;
                    dts = expected;
                }
            }
        }

        // Monotonicity within the stream: on a negative delta, stamp the
        // packet one frame after its predecessor.
        if let Some(last) = self.last_pts {
            if pts < last {
                debug!("{}: pts {pts} < previous {last}; repairing", self.label);
                pts = last + self.frame_duration;
            }
        }
        if let Some(last) = self.last_dts {
            if dts < last {
                dts = last + self.frame_duration;
            }
        }

        pkt.pts = Some(pts);
        pkt.dts = Some(dts);
        self.last_pts = Some(pts);
        self.last_dts = Some(dts);
        self.expected_next_pts = Some(pts + self.frame_duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::video_packet;

    fn repair_sequence(
        t: &mut TimestampTracker,
        input: &[Option<i64>],
    ) -> Vec<i64> {
        input
            .iter()
            .map(|&pts| {
                let mut pkt = video_packet(0, false);
                pkt.pts = pts;
                pkt.dts = pts;
                t.repair(&mut pkt);
                pkt.pts.unwrap()
            })
            .collect()
    }

    #[test]
    fn udp_missing_pts_interpolated() {
        // Feed PTS 0, 3000, 6000, MISSING, 12000 at 1/90000, 30 fps: the gap
        // is filled with 9000 and no discontinuity is counted.
        let mut t = TimestampTracker::new("test".into(), true, Some(30));
        let out = repair_sequence(
            &mut t,
            &[Some(0), Some(3000), Some(6000), None, Some(12000)],
        );
        assert_eq!(out, &[0, 3000, 6000, 9000, 12000]);
        assert_eq!(t.discontinuity_count(), 0);
    }

    #[test]
    fn both_missing_at_start() {
        let mut t = TimestampTracker::new("test".into(), false, None);
        let out = repair_sequence(&mut t, &[None, None]);
        assert_eq!(out, &[1, 1 + DEFAULT_FRAME_DURATION]);
    }

    #[test]
    fn missing_pts_takes_dts() {
        let mut t = TimestampTracker::new("test".into(), false, Some(30));
        let mut pkt = video_packet(0, false);
        pkt.pts = None;
        pkt.dts = Some(4500);
        t.repair(&mut pkt);
        assert_eq!(pkt.pts, Some(4500));
        assert_eq!(pkt.dts, Some(4500));
    }

    #[test]
    fn negative_delta_clamped() {
        let mut t = TimestampTracker::new("test".into(), false, Some(30));
        let out = repair_sequence(&mut t, &[Some(9000), Some(6000), Some(15000)]);
        assert_eq!(out, &[9000, 12000, 15000]);
    }

    #[test]
    fn big_jump_counted_and_forced_on_udp() {
        let mut t = TimestampTracker::new("test".into(), true, Some(30));
        // 101 frames past the expected next timestamp: counted and forced
        // back onto the expected sequence.
        let jump = 3000 + 101 * 3000;
        let out = repair_sequence(&mut t, &[Some(0), Some(jump)]);
        assert_eq!(out, &[0, 3000]);
        assert_eq!(t.discontinuity_count(), 1);
    }

    #[test]
    fn big_jump_not_forced_on_tcp() {
        let mut t = TimestampTracker::new("test".into(), false, Some(30));
        let jump = 3000 + 101 * 3000;
        let out = repair_sequence(&mut t, &[Some(0), Some(jump)]);
        assert_eq!(out, &[0, jump]);
        assert_eq!(t.discontinuity_count(), 1);
    }

    #[test]
    fn moderate_jump_counted_but_kept() {
        let mut t = TimestampTracker::new("test".into(), true, Some(30));
        // 11 frames: a discontinuity, but within the forcing threshold.
        let jump = 3000 + 11 * 3000;
        let out = repair_sequence(&mut t, &[Some(0), Some(jump)]);
        assert_eq!(out, &[0, jump]);
        assert_eq!(t.discontinuity_count(), 1);
    }
}
