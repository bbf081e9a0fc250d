// SPDX-License-Identifier: GPL-3.0-only

use std::time::{Duration, Instant};

use tracing::{debug, info};

pub const ADAPTATION_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_ADAPTATION_FACTOR: f64 = 0.1;
pub const DEFAULT_TARGET_FPS: f64 = 30.0;
pub const HIGH_PERFORMANCE_TARGET_FPS: f64 = 60.0;
pub const MAX_TARGET_FPS: f64 = 60.0;
pub const MIN_TARGET_FPS: f64 = 1.0;

const BACKOFF_DROP_RATE: f64 = 0.10;
const RAMP_DROP_RATE: f64 = 0.02;
const RAMP_FPS_RATIO: f64 = 0.95;
const THROTTLE_RATIO: f64 = 1.2;
const MIN_POLL_TIMEOUT_MS: f64 = 1.0;
const MAX_POLL_TIMEOUT_MS: f64 = 33.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adaptation {
    Decreased { from: f64, to: f64 },
    Increased { from: f64, to: f64 },
    Unchanged,
}

/// Computes the next target for one observation window.
///
/// Backs off multiplicatively above 10% drops, ramps up at half the rate below 2% drops
/// when the measured rate keeps up with the target, and holds in between.
pub fn next_target(target_fps: f64, measured_fps: f64, drop_rate: f64, factor: f64) -> f64 {
    if drop_rate > BACKOFF_DROP_RATE {
        (target_fps * (1.0 - factor)).max(MIN_TARGET_FPS)
    } else if drop_rate < RAMP_DROP_RATE && measured_fps >= RAMP_FPS_RATIO * target_fps {
        (target_fps * (1.0 + factor / 2.0)).min(MAX_TARGET_FPS)
    } else {
        target_fps
    }
}

#[derive(Debug, Clone)]
pub struct PacingController {
    target_fps: f64,
    measured_fps: f64,
    adaptation_factor: f64,

    rendered: u64,
    dropped: u64,
    sampled_rendered: u64,
    sampled_dropped: u64,
    last_adaptation: Instant,
}

impl PacingController {
    pub fn new(target_fps: f64, now: Instant) -> Self {
        PacingController {
            target_fps: target_fps.clamp(MIN_TARGET_FPS, MAX_TARGET_FPS),
            measured_fps: 0.0,
            adaptation_factor: DEFAULT_ADAPTATION_FACTOR,
            rendered: 0,
            dropped: 0,
            sampled_rendered: 0,
            sampled_dropped: 0,
            last_adaptation: now,
        }
    }

    pub fn with_adaptation_factor(mut self, factor: f64) -> Self {
        self.adaptation_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    pub fn measured_fps(&self) -> f64 {
        self.measured_fps
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn frame_rendered(&mut self) {
        self.rendered += 1;
    }

    pub fn frame_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Samples the counters and adapts the target, at most once per [`ADAPTATION_INTERVAL`].
    pub fn maybe_adapt(&mut self, now: Instant) -> Option<Adaptation> {
        let elapsed = now.saturating_duration_since(self.last_adaptation);
        if elapsed < ADAPTATION_INTERVAL {
            return None;
        }

        let new_frames = self.rendered - self.sampled_rendered;
        let new_drops = self.dropped - self.sampled_dropped;
        self.sampled_rendered = self.rendered;
        self.sampled_dropped = self.dropped;
        self.last_adaptation = now;

        let elapsed = elapsed.as_secs_f64();
        self.measured_fps = new_frames as f64 / elapsed;
        let drop_rate = match (new_frames, new_drops) {
            (0, 0) => return Some(Adaptation::Unchanged),
            // every frame of the window was dropped
            (0, _) => 1.0,
            _ => new_drops as f64 / (self.measured_fps * elapsed),
        };
        let from = self.target_fps;
        let to = next_target(from, self.measured_fps, drop_rate, self.adaptation_factor);
        self.target_fps = to;

        let adaptation = if to < from {
            info!(
                from,
                to,
                drop_rate,
                measured = self.measured_fps,
                "Lowering target frame rate."
            );
            Adaptation::Decreased { from, to }
        } else if to > from {
            debug!(from, to, measured = self.measured_fps, "Raising target frame rate.");
            Adaptation::Increased { from, to }
        } else {
            Adaptation::Unchanged
        };
        Some(adaptation)
    }

    /// Recommended number of frames the decoder should buffer ahead.
    pub fn queue_depth(&self) -> usize {
        if self.target_fps >= 45.0 {
            2
        } else if self.target_fps >= 30.0 {
            3
        } else {
            4
        }
    }

    /// Wait timeout for the event loop.
    pub fn poll_timeout(&self) -> Duration {
        let ms = (0.5 * 1000.0 / self.target_fps).clamp(MIN_POLL_TIMEOUT_MS, MAX_POLL_TIMEOUT_MS);
        Duration::from_micros((ms * 1000.0).round() as u64)
    }

    /// Whether the next decode request should be skipped to let the display catch up.
    pub fn should_throttle(&self) -> bool {
        self.measured_fps > THROTTLE_RATIO * self.target_fps
    }
}
