// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Grid-based frame differencing with an adaptive background model.
//!
//! Per frame: grayscale, box blur, per-cell count of pixels differing from
//! both the previous frame and the background beyond the noise and
//! sensitivity thresholds. A cell triggers on score > 0.01; motion is
//! declared when enough cells trigger. The background adapts slowly, and
//! more slowly still while motion is in progress so a lingering subject
//! doesn't get absorbed.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

/// Cell score above which a cell counts as moving.
const CELL_TRIGGER_SCORE: f64 = 0.01;

/// Background adaptation rate without / with active motion.
const BG_ALPHA_IDLE: f32 = 0.05;
const BG_ALPHA_MOTION: f32 = 0.01;

/// Bound on the frame-history ring.
const MAX_HISTORY: usize = 10;

/// An 8-bit grayscale frame (Rec. 601 luminance).
#[derive(Clone)]
pub struct GrayFrame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayFrame {
    /// Converts packed RGB using Rec. 601 weights.
    pub fn from_rgb(width: usize, height: usize, rgb: &[u8]) -> Self {
        debug_assert_eq!(rgb.len(), width * height * 3);
        let data = rgb
            .chunks_exact(3)
            .map(|p| {
                let y = 0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2]);
                y as u8
            })
            .collect();
        GrayFrame {
            width,
            height,
            data,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    /// The frame is divided into `grid_size × grid_size` cells.
    pub grid_size: u32,

    /// 0..1; higher demands a larger pixel delta.
    pub sensitivity: f64,

    /// Fraction of cells that must trigger, 0..1.
    pub min_motion_area: f64,

    /// Per-pixel delta below this is noise.
    pub noise_threshold: u8,

    pub blur_radius: u32,

    /// Minimum spacing between consecutive positive detections.
    pub cooldown: Duration,

    /// Frames retained in the history ring, 1..=10.
    pub history_len: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            grid_size: 8,
            sensitivity: 0.25,
            min_motion_area: 0.05,
            noise_threshold: 15,
            blur_radius: 2,
            cooldown: Duration::from_secs(3),
            history_len: 2,
        }
    }
}

impl DetectorConfig {
    /// Clamps out-of-range values to defaults, logging what changed.
    pub fn sanitized(mut self) -> Self {
        let d = DetectorConfig::default();
        if self.grid_size == 0 || self.grid_size > 32 {
            warn!(
                "detection grid size {} out of range; using {}",
                self.grid_size, d.grid_size
            );
            self.grid_size = d.grid_size;
        }
        if !(0.0..=1.0).contains(&self.sensitivity) {
            warn!(
                "detection sensitivity {} out of range; using {}",
                self.sensitivity, d.sensitivity
            );
            self.sensitivity = d.sensitivity;
        }
        if !(0.0..=1.0).contains(&self.min_motion_area) {
            warn!(
                "min motion area {} out of range; using {}",
                self.min_motion_area, d.min_motion_area
            );
            self.min_motion_area = d.min_motion_area;
        }
        if self.blur_radius > 10 {
            warn!("blur radius {} out of range; using {}", self.blur_radius, d.blur_radius);
            self.blur_radius = d.blur_radius;
        }
        if self.history_len == 0 || self.history_len > MAX_HISTORY {
            self.history_len = d.history_len;
        }
        self
    }
}

/// The verdict for one frame.
#[derive(Clone, Debug, Default)]
pub struct MotionResult {
    /// Motion detected and outside the cooldown window.
    pub detected: bool,

    /// Motion present but within the cooldown of a previous detection.
    pub suppressed: bool,

    /// Highest cell score.
    pub score: f64,

    /// Fraction of cells that triggered.
    pub area: f64,

    /// Region of motion as (x, y, width, height); currently the full frame
    /// whenever motion is present.
    pub region: Option<(usize, usize, usize, usize)>,
}

/// Per-stream detection state.
pub struct MotionDetector {
    cfg: DetectorConfig,
    dims: Option<(usize, usize)>,
    prev: Option<Vec<u8>>,
    background: Vec<f32>,
    history: VecDeque<Vec<u8>>,
    last_positive: Option<Duration>,
}

impl MotionDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        MotionDetector {
            cfg: cfg.sanitized(),
            dims: None,
            prev: None,
            background: Vec::new(),
            history: VecDeque::new(),
            last_positive: None,
        }
    }

    fn reset(&mut self, width: usize, height: usize) {
        self.dims = Some((width, height));
        self.prev = None;
        self.background.clear();
        self.history.clear();
    }

    /// Runs detection on one frame. `now` is monotonic, used only for the
    /// cooldown.
    pub fn process(&mut self, frame: &GrayFrame, now: Duration) -> MotionResult {
        if frame.data.len() != frame.width * frame.height || frame.width == 0 || frame.height == 0 {
            warn!("dropping malformed frame ({}x{})", frame.width, frame.height);
            return MotionResult::default();
        }
        if self.dims != Some((frame.width, frame.height)) {
            self.reset(frame.width, frame.height);
        }
        let cur = box_blur(frame, self.cfg.blur_radius as usize);

        let Some(prev) = self.prev.take() else {
            self.background = cur.iter().map(|&p| f32::from(p)).collect();
            self.push_history(cur.clone());
            self.prev = Some(cur);
            return MotionResult::default();
        };

        let g = self.cfg.grid_size as usize;
        let cell_w = (frame.width / g).max(1);
        let cell_h = (frame.height / g).max(1);
        let pixel_threshold =
            f64::from(self.cfg.noise_threshold).max(self.cfg.sensitivity * 255.0);

        let mut cells_triggered = 0usize;
        let mut max_cell_score = 0.0f64;
        for cy in 0..g {
            for cx in 0..g {
                let x0 = cx * cell_w;
                let y0 = cy * cell_h;
                let x1 = if cx == g - 1 { frame.width } else { x0 + cell_w };
                let y1 = if cy == g - 1 { frame.height } else { y0 + cell_h };
                if x0 >= frame.width || y0 >= frame.height {
                    continue;
                }
                let mut sum = 0u64;
                for y in y0..y1 {
                    let row = y * frame.width;
                    for x in x0..x1 {
                        let i = row + x;
                        let c = f32::from(cur[i]);
                        let dp = (c - f32::from(prev[i])).abs();
                        let db = (c - self.background[i]).abs();
                        let d = dp.max(db) as f64;
                        if d > pixel_threshold {
                            sum += d as u64;
                        }
                    }
                }
                let pixels = ((x1 - x0) * (y1 - y0)) as f64;
                let score = sum as f64 / (pixels * 255.0);
                if score > CELL_TRIGGER_SCORE {
                    cells_triggered += 1;
                }
                max_cell_score = max_cell_score.max(score);
            }
        }

        let area = cells_triggered as f64 / (g * g) as f64;
        let motion = area >= self.cfg.min_motion_area && max_cell_score > CELL_TRIGGER_SCORE;

        // Slower adaptation during activity, so a lingering subject doesn't
        // melt into the background.
        let alpha = if motion { BG_ALPHA_MOTION } else { BG_ALPHA_IDLE };
        for (bg, &c) in self.background.iter_mut().zip(cur.iter()) {
            *bg = (1.0 - alpha) * *bg + alpha * f32::from(c);
        }

        let mut result = MotionResult {
            detected: false,
            suppressed: false,
            score: max_cell_score,
            area,
            region: motion.then_some((0, 0, frame.width, frame.height)),
        };
        if motion {
            let in_cooldown = self
                .last_positive
                .is_some_and(|last| now.saturating_sub(last) < self.cfg.cooldown);
            if in_cooldown {
                result.suppressed = true;
            } else {
                result.detected = true;
                self.last_positive = Some(now);
            }
        }

        self.push_history(cur.clone());
        self.prev = Some(cur);
        result
    }

    fn push_history(&mut self, frame: Vec<u8>) {
        self.history.push_back(frame);
        while self.history.len() > self.cfg.history_len {
            self.history.pop_front();
        }
    }
}

/// Separable box blur; radius 0 is a copy.
fn box_blur(frame: &GrayFrame, radius: usize) -> Vec<u8> {
    if radius == 0 {
        return frame.data.clone();
    }
    let (w, h) = (frame.width, frame.height);
    let mut tmp = vec![0u8; w * h];
    // Horizontal pass.
    for y in 0..h {
        let row = &frame.data[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(radius);
            let hi = (x + radius + 1).min(w);
            let sum: u32 = row[lo..hi].iter().map(|&p| u32::from(p)).sum();
            tmp[y * w + x] = (sum / (hi - lo) as u32) as u8;
        }
    }
    // Vertical pass.
    let mut out = vec![0u8; w * h];
    for x in 0..w {
        for y in 0..h {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius + 1).min(h);
            let sum: u32 = (lo..hi).map(|yy| u32::from(tmp[yy * w + x])).sum();
            out[y * w + x] = (sum / (hi - lo) as u32) as u8;
        }
    }
    out
}
