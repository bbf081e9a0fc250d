// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::VecDeque,
    fmt, io, mem,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace, warn};

use super::swapchain::SwapBuffer;

pub const COMPLETION_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive flip submission failures tolerated before giving up.
pub const MAX_FLIP_FAILURES: u32 = 3;

/// How the completion of a modeset is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// A completion event will arrive on the display fd.
    Event,
    /// The commit was synchronous, the buffer is on screen once the call returns.
    Immediate,
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("permission denied: {0}")]
    Permission(#[source] io::Error),
    #[error("device busy: {0}")]
    Busy(#[source] io::Error),
    #[error(transparent)]
    Other(io::Error),
}

impl From<io::Error> for CommitError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => CommitError::Permission(err),
            Some(libc::EBUSY) => CommitError::Busy(err),
            _ => CommitError::Other(err),
        }
    }
}

/// The kernel display side of presentation.
pub trait Scanout {
    type Framebuffer: Copy + fmt::Debug + PartialEq;

    fn supports_atomic(&self) -> bool;
    fn commit_modeset(&mut self, framebuffer: Self::Framebuffer)
        -> Result<CompletionMode, CommitError>;
    /// Queues a non-blocking flip whose completion arrives as an event.
    fn commit_flip(&mut self, framebuffer: Self::Framebuffer) -> Result<(), CommitError>;
    /// Waits up to `timeout` for completion events to become readable.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
    /// Consumes pending events, returning the number of completed flips or modesets.
    fn read_completions(&mut self) -> io::Result<usize>;
    /// Puts back whatever was on screen before we took over.
    fn restore(&mut self) -> Result<(), CommitError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PresentationError {
    #[error("initial modeset failed: {0}")]
    Modeset(#[source] CommitError),
    #[error("page flip failed {attempts} times in a row: {source}")]
    Flip {
        attempts: u32,
        #[source]
        source: CommitError,
    },
    #[error("failed to read display events: {0}")]
    Events(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentState {
    Uninitialized,
    FirstModeset,
    Steady,
    ScanoutDisabled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// In flight or queued behind the frame in flight.
    Queued,
    /// On screen already.
    Presented,
    /// The kernel rejected the flip, the frame was dropped.
    Dropped,
    /// Scanout is disabled, the buffer was handed back right away.
    Disabled,
}

/// Messages produced by the engine for the owner of the swap chain.
#[derive(Debug, PartialEq, Eq)]
pub enum PresentEvent {
    Presented {
        seq: Option<u64>,
        latency: Duration,
    },
    /// The display no longer reads from this buffer.
    Release(SwapBuffer),
}

#[derive(Debug)]
struct PendingPresentation<F> {
    buffer: SwapBuffer,
    framebuffer: F,
    seq: Option<u64>,
    submitted: Instant,
    flipped: bool,
}

#[derive(Debug)]
struct OnScreen {
    buffer: SwapBuffer,
}

pub struct PresentationEngine<D: Scanout> {
    display: D,
    state: PresentState,
    cap: usize,
    completion_timeout: Duration,

    pending: VecDeque<PendingPresentation<D::Framebuffer>>,
    modeset: Option<(Option<u64>, Instant)>,
    front: Option<OnScreen>,
    first_frame: Option<OnScreen>,

    consecutive_failures: u32,
    /// A commit we stopped waiting for is still outstanding at the kernel.
    stray_completion: bool,
    fatal: Option<PresentationError>,
    events: VecDeque<PresentEvent>,
}

impl<D: Scanout> fmt::Debug for PresentationEngine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationEngine")
            .field("state", &self.state)
            .field("cap", &self.cap)
            .field("pending", &self.pending.len())
            .field("consecutive_failures", &self.consecutive_failures)
            .field("stray_completion", &self.stray_completion)
            .finish_non_exhaustive()
    }
}

impl<D: Scanout> PresentationEngine<D> {
    pub fn new(display: D, triple_buffering: bool) -> Self {
        PresentationEngine {
            display,
            state: PresentState::Uninitialized,
            cap: if triple_buffering { 2 } else { 1 },
            completion_timeout: COMPLETION_TIMEOUT,
            pending: VecDeque::new(),
            modeset: None,
            front: None,
            first_frame: None,
            consecutive_failures: 0,
            stray_completion: false,
            fatal: None,
            events: VecDeque::new(),
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Swap chain size needed to never run dry: the buffer on screen, the presentations
    /// in flight, and the one being drawn.
    pub fn required_ring_size(triple_buffering: bool) -> usize {
        if triple_buffering {
            4
        } else {
            3
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn state(&self) -> PresentState {
        self.state
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Presentations submitted but not completed yet.
    pub fn in_flight(&self) -> usize {
        self.pending.len() + usize::from(self.modeset.is_some())
    }

    pub fn events(&mut self) -> std::collections::vec_deque::Drain<'_, PresentEvent> {
        self.events.drain(..)
    }

    /// Blocks until a presentation may be submitted without exceeding the cap.
    ///
    /// If no completion arrives within the timeout the oldest presentation is retired
    /// anyway, which at worst shows a glitch instead of stalling forever.
    pub fn wait_for_capacity(&mut self) -> Result<(), PresentationError> {
        if self.state == PresentState::ScanoutDisabled {
            return Ok(());
        }
        let deadline = Instant::now() + self.completion_timeout;
        while self.in_flight() >= self.cap {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() && self.display.wait_readable(remaining)? {
                self.dispatch()?;
                continue;
            }
            warn!(
                in_flight = self.in_flight(),
                timeout = ?self.completion_timeout,
                "No page flip completion in time, forcing progress."
            );
            self.force_progress(Instant::now());
        }
        Ok(())
    }

    /// Makes room without a completion event.
    ///
    /// A commit that was given up on still completes at the kernel eventually, that
    /// completion is swallowed once and nothing new is committed until it arrived.
    fn force_progress(&mut self, now: Instant) {
        if self.stray_completion {
            // it never came, the kernel has forgotten about it
            self.stray_completion = false;
            self.flip_next();
            return;
        }
        let committed = self.modeset.is_some() || self.pending.front().is_some_and(|p| p.flipped);
        if committed {
            self.stray_completion = true;
            self.complete_one(now);
        } else {
            self.flip_next();
        }
    }

    /// Submits `buffer` for display. Buffers that come back are reported through
    /// [`PresentationEngine::events`].
    pub fn submit(
        &mut self,
        buffer: SwapBuffer,
        framebuffer: D::Framebuffer,
        seq: Option<u64>,
    ) -> Result<SubmitOutcome, PresentationError> {
        profiling::scope!("PresentationEngine::submit");
        if let Some(err) = self.fatal.take() {
            self.events.push_back(PresentEvent::Release(buffer));
            return Err(err);
        }

        match self.state {
            PresentState::ScanoutDisabled => {
                self.events.push_back(PresentEvent::Presented {
                    seq,
                    latency: Duration::ZERO,
                });
                self.events.push_back(PresentEvent::Release(buffer));
                Ok(SubmitOutcome::Disabled)
            }
            PresentState::Uninitialized => self.first_modeset(buffer, framebuffer, seq),
            PresentState::FirstModeset | PresentState::Steady => {
                self.wait_for_capacity()?;
                self.queue_flip(buffer, framebuffer, seq)
            }
        }
    }

    fn first_modeset(
        &mut self,
        buffer: SwapBuffer,
        framebuffer: D::Framebuffer,
        seq: Option<u64>,
    ) -> Result<SubmitOutcome, PresentationError> {
        let now = Instant::now();
        match self.display.commit_modeset(framebuffer) {
            Ok(CompletionMode::Immediate) => {
                info!(atomic = false, "Initial modeset done.");
                self.state = PresentState::Steady;
                self.first_frame = Some(OnScreen { buffer });
                self.events.push_back(PresentEvent::Presented {
                    seq,
                    latency: now.elapsed(),
                });
                Ok(SubmitOutcome::Presented)
            }
            Ok(CompletionMode::Event) => {
                info!(atomic = true, "Initial modeset submitted.");
                self.state = PresentState::FirstModeset;
                self.first_frame = Some(OnScreen { buffer });
                self.modeset = Some((seq, now));
                Ok(SubmitOutcome::Queued)
            }
            Err(CommitError::Permission(err)) => {
                warn!(
                    ?err,
                    "No permission to modeset, continuing with scanout disabled."
                );
                self.state = PresentState::ScanoutDisabled;
                self.events.push_back(PresentEvent::Presented {
                    seq,
                    latency: Duration::ZERO,
                });
                self.events.push_back(PresentEvent::Release(buffer));
                Ok(SubmitOutcome::Disabled)
            }
            Err(err) => {
                error!(?err, "Initial modeset failed.");
                self.events.push_back(PresentEvent::Release(buffer));
                Err(PresentationError::Modeset(err))
            }
        }
    }

    fn queue_flip(
        &mut self,
        buffer: SwapBuffer,
        framebuffer: D::Framebuffer,
        seq: Option<u64>,
    ) -> Result<SubmitOutcome, PresentationError> {
        let mut presentation = PendingPresentation {
            buffer,
            framebuffer,
            seq,
            submitted: Instant::now(),
            flipped: false,
        };

        // only one commit can be outstanding at the kernel, later ones wait in line
        if self.pending.is_empty() && self.modeset.is_none() && !self.stray_completion {
            if let Err(err) = self.display.commit_flip(framebuffer) {
                self.flip_failed(presentation.buffer, err)?;
                return Ok(SubmitOutcome::Dropped);
            }
            presentation.flipped = true;
        }
        trace!(?seq, flipped = presentation.flipped, "Queued presentation.");
        self.pending.push_back(presentation);
        Ok(SubmitOutcome::Queued)
    }

    fn flip_failed(&mut self, buffer: SwapBuffer, err: CommitError) -> Result<(), PresentationError> {
        self.consecutive_failures += 1;
        self.events.push_back(PresentEvent::Release(buffer));
        if self.consecutive_failures > MAX_FLIP_FAILURES {
            error!(?err, attempts = self.consecutive_failures, "Giving up on page flips.");
            return Err(PresentationError::Flip {
                attempts: self.consecutive_failures,
                source: err,
            });
        }
        warn!(?err, attempts = self.consecutive_failures, "Page flip failed, dropping frame.");
        Ok(())
    }

    /// Handles readability of the display fd.
    pub fn dispatch(&mut self) -> Result<usize, PresentationError> {
        profiling::scope!("PresentationEngine::dispatch");
        let completions = self.display.read_completions()?;
        let now = Instant::now();
        for _ in 0..completions {
            if self.stray_completion {
                debug!("Late completion of an abandoned commit.");
                self.stray_completion = false;
                self.flip_next();
                continue;
            }
            self.complete_one(now);
        }
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(completions),
        }
    }

    fn complete_one(&mut self, now: Instant) {
        if let Some((seq, submitted)) = self.modeset.take() {
            self.state = PresentState::Steady;
            debug!("Initial modeset completed.");
            self.events.push_back(PresentEvent::Presented {
                seq,
                latency: now.saturating_duration_since(submitted),
            });
            self.flip_next();
            return;
        }

        if !self.pending.front().is_some_and(|p| p.flipped) {
            debug!("Ignoring completion without a presentation in flight.");
            self.flip_next();
            return;
        }
        let Some(done) = self.pending.pop_front() else {
            return;
        };
        self.consecutive_failures = 0;

        // whatever was on screen before is free now
        let previous = mem::replace(&mut self.front, Some(OnScreen { buffer: done.buffer }));
        if let Some(previous) = previous.or_else(|| self.first_frame.take()) {
            self.events.push_back(PresentEvent::Release(previous.buffer));
        }
        self.events.push_back(PresentEvent::Presented {
            seq: done.seq,
            latency: now.saturating_duration_since(done.submitted),
        });

        self.flip_next();
    }

    fn flip_next(&mut self) {
        if self.stray_completion {
            return;
        }
        while let Some(next) = self.pending.front_mut() {
            if next.flipped {
                return;
            }
            match self.display.commit_flip(next.framebuffer) {
                Ok(()) => {
                    next.flipped = true;
                    next.submitted = Instant::now();
                    return;
                }
                Err(err) => {
                    let Some(failed) = self.pending.pop_front() else {
                        return;
                    };
                    if let Err(err) = self.flip_failed(failed.buffer, err) {
                        self.fatal = Some(err);
                        return;
                    }
                }
            }
        }
    }

    /// Forgets about all presentations in flight, used when recovering from a stall.
    pub fn reset_in_flight(&mut self) {
        let dropped = self.in_flight();
        if self.modeset.take().is_some() {
            self.state = PresentState::Steady;
            self.stray_completion = true;
        }
        if self.pending.front().is_some_and(|p| p.flipped) {
            self.stray_completion = true;
        }
        for presentation in self.pending.drain(..) {
            self.events.push_back(PresentEvent::Release(presentation.buffer));
        }
        if dropped > 0 {
            warn!(dropped, "Reset in-flight presentations.");
        }
    }

    /// Gives back every buffer and restores the previous display configuration.
    pub fn shutdown(&mut self) {
        if self.state != PresentState::ScanoutDisabled && self.in_flight() > 0 {
            let deadline = Instant::now() + self.completion_timeout;
            while self.in_flight() > 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.display.wait_readable(remaining) {
                    Ok(true) if !remaining.is_zero() => {
                        if let Err(err) = self.dispatch() {
                            warn!(?err, "Error while draining presentations.");
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }

        self.reset_in_flight();
        for on_screen in [self.front.take(), self.first_frame.take()]
            .into_iter()
            .flatten()
        {
            self.events.push_back(PresentEvent::Release(on_screen.buffer));
        }

        if self.state != PresentState::Uninitialized && self.state != PresentState::ScanoutDisabled
        {
            if let Err(err) = self.display.restore() {
                warn!(?err, "Failed to restore previous display configuration.");
            }
        }
        self.stray_completion = false;
        self.state = PresentState::Uninitialized;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::headless::{Latency, MemorySurface, VirtualScanout},
        pipeline::swapchain::SwapChain,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    struct Harness {
        swapchain: SwapChain<MemorySurface>,
        presenter: PresentationEngine<VirtualScanout>,
        presented: Vec<Option<u64>>,
    }

    impl Harness {
        fn new(scanout: VirtualScanout, triple_buffering: bool) -> Self {
            let ring = PresentationEngine::<VirtualScanout>::required_ring_size(triple_buffering);
            Harness {
                swapchain: SwapChain::new(MemorySurface::new((4, 4), ring)),
                presenter: PresentationEngine::new(scanout, triple_buffering)
                    .with_completion_timeout(Duration::from_millis(5)),
                presented: Vec::new(),
            }
        }

        fn submit(&mut self, seq: u64) -> Result<SubmitOutcome, PresentationError> {
            let buffer = self.swapchain.acquire_writable_buffer().unwrap();
            let framebuffer = self.swapchain.resolve_kernel_object(&buffer).unwrap();
            self.swapchain.hand_to_display(&buffer);
            let outcome = self.presenter.submit(buffer, framebuffer, Some(seq));
            self.drain();
            outcome
        }

        fn dispatch(&mut self) {
            self.presenter.dispatch().unwrap();
            self.drain();
        }

        fn drain(&mut self) {
            for event in self.presenter.events().collect::<Vec<_>>() {
                match event {
                    PresentEvent::Release(buffer) => self.swapchain.release(buffer).unwrap(),
                    PresentEvent::Presented { seq, .. } => self.presented.push(seq),
                }
            }
        }
    }

    #[test]
    fn legacy_modeset_presents_immediately() {
        let mut harness = Harness::new(VirtualScanout::new(Latency::Manual), false);
        assert_eq!(harness.submit(0).unwrap(), SubmitOutcome::Presented);
        assert_eq!(harness.presenter.state(), PresentState::Steady);
        assert_eq!(harness.presented, vec![Some(0)]);
        assert_eq!(harness.presenter.in_flight(), 0);

        assert_eq!(harness.submit(1).unwrap(), SubmitOutcome::Queued);
        harness.presenter.display_mut().complete(1);
        harness.dispatch();
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);
        // only the buffer on screen is still held
        assert_eq!(harness.swapchain.checked_out(), 1);
    }

    #[test]
    fn flips_wait_for_the_atomic_modeset() {
        let mut harness = Harness::new(VirtualScanout::new(Latency::Manual).with_atomic(true), true);
        assert_eq!(harness.submit(0).unwrap(), SubmitOutcome::Queued);
        assert_eq!(harness.presenter.state(), PresentState::FirstModeset);
        assert_eq!(harness.submit(1).unwrap(), SubmitOutcome::Queued);
        assert_eq!(harness.presenter.display().outstanding(), 1);
        assert!(harness.presented.is_empty());

        harness.presenter.display_mut().complete(1);
        harness.dispatch();
        assert_eq!(harness.presenter.state(), PresentState::Steady);
        assert_eq!(harness.presented, vec![Some(0)]);
        // the queued flip went out once the modeset was done
        assert_eq!(harness.presenter.display().flips(), 1);

        harness.presenter.display_mut().complete(1);
        harness.dispatch();
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);
        assert_eq!(harness.swapchain.checked_out(), 1);
    }

    #[test]
    fn in_flight_never_exceeds_the_cap() {
        let mut rng = StdRng::seed_from_u64(0x5ca1ab1e);
        for triple_buffering in [false, true] {
            let mut harness = Harness::new(VirtualScanout::new(Latency::Manual), triple_buffering);
            let ring = harness.swapchain.ring_size();
            for seq in 0..500 {
                if rng.random_bool(0.5) {
                    let completions = rng.random_range(0..=2);
                    harness.presenter.display_mut().complete(completions);
                    harness.dispatch();
                }
                let outcome = harness.submit(seq).unwrap();
                assert_ne!(outcome, SubmitOutcome::Dropped);
                assert!(harness.presenter.in_flight() <= harness.presenter.cap());
                assert!(harness.presenter.display().outstanding() <= 1);
                assert!(harness.swapchain.checked_out() <= ring);
            }

            harness.presenter.shutdown();
            harness.drain();
            assert_eq!(harness.swapchain.checked_out(), 0);
            assert!(harness.presenter.display().restored());

            let shown: Vec<u64> = harness.presented.iter().flatten().copied().collect();
            assert!(shown.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn hung_display_forces_progress() {
        let mut harness = Harness::new(VirtualScanout::new(Latency::Never), false);
        harness.submit(0).unwrap();
        assert_eq!(harness.submit(1).unwrap(), SubmitOutcome::Queued);
        // the kernel still holds the previous flip, this one waits in line
        assert_eq!(harness.submit(2).unwrap(), SubmitOutcome::Queued);
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);
        assert_eq!(harness.presenter.display().flips(), 1);

        // and keeps waiting until the next forced step gives up on the old commit
        assert_eq!(harness.submit(3).unwrap(), SubmitOutcome::Dropped);
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);

        harness.presenter.shutdown();
        harness.drain();
        assert_eq!(harness.swapchain.checked_out(), 0);
    }

    #[test]
    fn late_completion_does_not_retire_the_next_flip() {
        let mut harness = Harness::new(VirtualScanout::new(Latency::Never), false);
        harness.submit(0).unwrap();
        harness.submit(1).unwrap();
        assert_eq!(harness.submit(2).unwrap(), SubmitOutcome::Queued);
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);

        // the flip of frame 1 completes after all
        harness.presenter.display_mut().set_latency(Latency::Manual);
        harness.presenter.display_mut().complete(1);
        harness.dispatch();
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);
        assert_eq!(harness.presenter.in_flight(), 1);
        assert_eq!(harness.presenter.display().flips(), 2);
        // frame 1 is still on screen, frame 2 in flight
        assert_eq!(harness.swapchain.checked_out(), 2);

        harness.presenter.display_mut().complete(1);
        harness.dispatch();
        assert_eq!(harness.presented, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(harness.swapchain.checked_out(), 1);
    }

    #[test]
    fn repeated_flip_failures_are_fatal() {
        let mut harness = Harness::new(VirtualScanout::new(Latency::Fixed(Duration::ZERO)), false);
        harness.submit(0).unwrap();
        harness.presenter.display_mut().fail_flips(10);
        for seq in 1..=MAX_FLIP_FAILURES as u64 {
            assert_eq!(harness.submit(seq).unwrap(), SubmitOutcome::Dropped);
        }
        let err = harness.submit(10).unwrap_err();
        assert!(matches!(err, PresentationError::Flip { attempts, .. } if attempts == MAX_FLIP_FAILURES + 1));
        assert_eq!(harness.swapchain.checked_out(), 1);
    }

    #[test]
    fn permission_errors_disable_scanout() {
        let mut harness =
            Harness::new(VirtualScanout::new(Latency::Manual).with_denied_modeset(), false);
        assert_eq!(harness.submit(0).unwrap(), SubmitOutcome::Disabled);
        assert_eq!(harness.presenter.state(), PresentState::ScanoutDisabled);
        assert_eq!(harness.submit(1).unwrap(), SubmitOutcome::Disabled);
        assert_eq!(harness.presented, vec![Some(0), Some(1)]);
        assert_eq!(harness.swapchain.checked_out(), 0);

        harness.presenter.shutdown();
        assert!(!harness.presenter.display().restored());
    }

    #[test]
    fn busy_errors_are_classified() {
        let err = CommitError::from(io::Error::from_raw_os_error(libc::EBUSY));
        assert!(matches!(err, CommitError::Busy(_)));
        let err = CommitError::from(io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, CommitError::Permission(_)));
        let err = CommitError::from(io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(err, CommitError::Other(_)));
    }
}
