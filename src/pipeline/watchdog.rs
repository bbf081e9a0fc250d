// SPDX-License-Identifier: GPL-3.0-only

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

pub const STARTUP_TIMEOUT: Duration = Duration::from_millis(1500);
pub const STALL_THRESHOLD: Duration = Duration::from_secs(3);
pub const LOOP_STALL_THRESHOLD: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Attempts from which on a recovery also asks the decoder to reset itself.
const DECODER_RESET_ATTEMPT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Idle,
    /// Render now, whether or not the decoder signalled a frame.
    ForceRender,
    Recover { attempt: u32, reset_decoder: bool },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    startup_deadline: Option<Instant>,
    first_submission: Option<Instant>,
    last_progress: Option<Instant>,

    looping: bool,
    loop_grace: bool,
    attempts: u32,
    max_attempts: u32,
    recoveries: u64,
}

impl Watchdog {
    pub fn new(now: Instant, looping: bool, max_attempts: u32) -> Self {
        Watchdog {
            startup_deadline: Some(now + STARTUP_TIMEOUT),
            first_submission: None,
            last_progress: None,
            looping,
            loop_grace: false,
            attempts: 0,
            max_attempts,
            recoveries: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Total recovery actions taken over the watchdog's lifetime.
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    pub fn stall_threshold(&self) -> Duration {
        if self.looping && self.loop_grace {
            LOOP_STALL_THRESHOLD
        } else {
            STALL_THRESHOLD
        }
    }

    pub fn frame_submitted(&mut self, now: Instant) {
        if self.first_submission.is_none() {
            self.first_submission = Some(now);
            self.last_progress = Some(now);
        }
        self.startup_deadline = None;
    }

    /// A new decoded frame completed presentation.
    pub fn frame_completed(&mut self, now: Instant) {
        if self.attempts > 0 {
            info!(attempts = self.attempts, "Playback recovered.");
        }
        self.attempts = 0;
        self.loop_grace = false;
        self.last_progress = Some(now);
    }

    /// Playback jumped back to the start of the stream.
    ///
    /// Only the recovery bookkeeping is reset, frame counters elsewhere stay untouched.
    pub fn loop_restarted(&mut self, now: Instant) {
        self.attempts = 0;
        self.loop_grace = true;
        if self.first_submission.is_some() {
            self.last_progress = Some(now);
        }
    }

    /// Playback was halted on purpose, the time spent halted is not a stall.
    pub fn resumed(&mut self, now: Instant) {
        if self.last_progress.is_some() {
            self.last_progress = Some(now);
        }
    }

    pub fn check(&mut self, now: Instant) -> WatchdogAction {
        if let Some(deadline) = self.startup_deadline {
            if now >= deadline {
                warn!("No frame submitted since startup, forcing a render.");
                self.startup_deadline = Some(now + STARTUP_TIMEOUT);
                return WatchdogAction::ForceRender;
            }
            return WatchdogAction::Idle;
        }

        let Some(last_progress) = self.last_progress else {
            return WatchdogAction::Idle;
        };
        let stalled_for = now.saturating_duration_since(last_progress);
        if stalled_for <= self.stall_threshold() {
            return WatchdogAction::Idle;
        }

        self.attempts += 1;
        // the next attempt needs another full threshold without progress
        self.last_progress = Some(now);
        if self.attempts > self.max_attempts {
            error!(attempts = self.max_attempts, "Playback stalled, recovery exhausted.");
            return WatchdogAction::Exhausted {
                attempts: self.max_attempts,
            };
        }

        self.recoveries += 1;
        let reset_decoder = self.attempts >= DECODER_RESET_ATTEMPT;
        warn!(
            attempt = self.attempts,
            max = self.max_attempts,
            ?stalled_for,
            reset_decoder,
            "Playback stalled, attempting recovery."
        );
        WatchdogAction::Recover {
            attempt: self.attempts,
            reset_decoder,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forces_render_when_nothing_was_submitted() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(start, false, 3);
        assert_eq!(watchdog.check(start + Duration::from_millis(1000)), WatchdogAction::Idle);
        assert_eq!(
            watchdog.check(start + Duration::from_millis(1500)),
            WatchdogAction::ForceRender
        );
        // re-armed
        assert_eq!(watchdog.check(start + Duration::from_millis(1600)), WatchdogAction::Idle);
        assert_eq!(
            watchdog.check(start + Duration::from_millis(3000)),
            WatchdogAction::ForceRender
        );

        watchdog.frame_submitted(start + Duration::from_millis(3100));
        assert_eq!(watchdog.check(start + Duration::from_millis(4700)), WatchdogAction::Idle);
    }

    #[test]
    fn escalates_until_exhausted() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(start, false, 2);
        watchdog.frame_submitted(start);

        let mut now = start + Duration::from_millis(3001);
        assert_eq!(
            watchdog.check(now),
            WatchdogAction::Recover {
                attempt: 1,
                reset_decoder: false
            }
        );
        now += Duration::from_millis(3001);
        assert_eq!(
            watchdog.check(now),
            WatchdogAction::Recover {
                attempt: 2,
                reset_decoder: true
            }
        );
        now += Duration::from_millis(3001);
        assert_eq!(watchdog.check(now), WatchdogAction::Exhausted { attempts: 2 });
        assert_eq!(watchdog.recoveries(), 2);
    }

    #[test]
    fn progress_resets_stall_counter() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(start, false, 3);
        watchdog.frame_submitted(start);
        assert!(matches!(
            watchdog.check(start + Duration::from_secs(4)),
            WatchdogAction::Recover { attempt: 1, .. }
        ));
        watchdog.frame_completed(start + Duration::from_secs(5));
        assert_eq!(watchdog.attempts(), 0);
        assert_eq!(watchdog.check(start + Duration::from_secs(7)), WatchdogAction::Idle);
    }

    #[test]
    fn loop_restart_extends_threshold_until_progress() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(start, true, 3);
        watchdog.frame_submitted(start);
        assert_eq!(watchdog.stall_threshold(), STALL_THRESHOLD);

        watchdog.loop_restarted(start + Duration::from_secs(1));
        assert_eq!(watchdog.stall_threshold(), LOOP_STALL_THRESHOLD);
        assert_eq!(watchdog.check(start + Duration::from_secs(5)), WatchdogAction::Idle);

        watchdog.frame_completed(start + Duration::from_secs(5));
        assert_eq!(watchdog.stall_threshold(), STALL_THRESHOLD);
    }

    #[test]
    fn loop_threshold_requires_looping() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(start, false, 3);
        watchdog.frame_submitted(start);
        watchdog.loop_restarted(start);
        assert_eq!(watchdog.stall_threshold(), STALL_THRESHOLD);
    }
}
