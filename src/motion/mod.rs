// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Motion detection and motion-triggered recording.
//!
//! A per-stream detection thread polls decoded frames, runs the grid
//! detector, and feeds begin/end events through a bounded queue to the
//! motion event recorder, which ties them to the pre-roll ring buffer.

pub mod detect;
pub mod queue;
pub mod recorder;

pub use detect::{DetectorConfig, GrayFrame, MotionDetector, MotionResult};
pub use queue::{MotionEvent, MotionEventQueue, MAX_MOTION_EVENT_QUEUE};
pub use recorder::{MotionEventRecorder, MotionRecorderOptions, MotionRecorderState};

use std::time::Duration;

use base::clock::Clocks;
use base::Error;
use tracing::{debug, info, warn};

/// Supplies decoded grayscale frames to the detector.
///
/// The shipped implementation polls the camera's snapshot endpoint; the
/// pipeline itself never decodes H.264.
pub trait FrameSource: Send {
    fn fetch(&mut self) -> Result<GrayFrame, Error>;
}

/// Snapshot-over-HTTP frame source.
pub struct SnapshotSource {
    url: String,
    http: reqwest::blocking::Client,
}

impl SnapshotSource {
    pub fn new(url: String) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| err_http(e))?;
        Ok(SnapshotSource { url, http })
    }
}

fn err_http(e: reqwest::Error) -> Error {
    base::err!(Unavailable, msg("snapshot request failed"), source(e))
}

impl FrameSource for SnapshotSource {
    fn fetch(&mut self) -> Result<GrayFrame, Error> {
        let bytes = self
            .http
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(err_http)?;
        let img = image::load_from_memory(&bytes)
            .map_err(|e| base::err!(InvalidArgument, msg("undecodable snapshot"), source(e)))?;
        let luma = img.to_luma8();
        Ok(GrayFrame {
            width: luma.width() as usize,
            height: luma.height() as usize,
            data: luma.into_raw(),
        })
    }
}

/// Polls frames at `interval`, runs the detector, and pushes begin/end edges
/// into `queue` until shutdown.
pub fn run_detection_loop<C: Clocks + Clone>(
    clocks: C,
    stream_name: &str,
    mut source: Box<dyn FrameSource>,
    mut detector: MotionDetector,
    queue: std::sync::Arc<MotionEventQueue>,
    interval: Duration,
    shutdown: base::shutdown::Receiver,
) {
    let mut active = false;
    info!("{stream_name}: motion detection running");
    loop {
        if shutdown.check().is_err() {
            break;
        }
        match source.fetch() {
            Ok(frame) => {
                let now = clocks.monotonic();
                let r = detector.process(&frame, now);
                let raw_active = r.detected || r.suppressed;
                if raw_active != active {
                    active = raw_active;
                    let ev = MotionEvent {
                        timestamp: clocks.realtime().as_second(),
                        active,
                        confidence: r.score,
                    };
                    debug!(
                        "{stream_name}: motion {} (score {:.3}, area {:.3})",
                        if active { "begin" } else { "end" },
                        r.score,
                        r.area
                    );
                    queue.push(ev);
                }
            }
            Err(e) => warn!("{stream_name}: snapshot fetch failed: {}", e.chain()),
        }
        if shutdown.wait_for(interval).is_err() {
            break;
        }
    }
    info!("{stream_name}: motion detection stopped");
}
