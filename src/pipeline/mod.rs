// SPDX-License-Identifier: GPL-3.0-only

//! The frame lifecycle: decode, composite, present, recycle.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use cgmath::Point2;
use smallvec::SmallVec;
use smithay::backend::renderer::gles::GlesError;
use tracing::{debug, error, info, warn};

use crate::{
    decoder::{DecodedFrame, Decoder, DecoderError, DecoderLadder, WakeupFlag},
    keystone::{homography::quad_q_weights, Corner, Homography, KeystoneCommand, KeystoneState},
};

pub mod pacing;
pub mod present;
pub mod swapchain;
pub mod watchdog;

use self::{
    pacing::PacingController,
    present::{PresentEvent, PresentState, PresentationEngine, PresentationError, Scanout, SubmitOutcome},
    swapchain::{NativeSurface, SurfaceError, SwapChain},
    watchdog::{Watchdog, WatchdogAction},
};

/// Upper bound for the event loop wait, so the watchdogs keep running without I/O.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Event loop wait in continuous mode.
pub const CONTINUOUS_POLL_TIMEOUT: Duration = Duration::from_millis(1);
/// Frames later than this are skipped if a newer one is already decoded.
const MAX_LATENESS: Duration = Duration::from_millis(250);
const HISTORY: usize = 360;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Straight into the scanout buffer.
    Direct,
    /// Through the offscreen target and the perspective warp.
    Keystone,
    /// Sampling an external decoder buffer without copying it.
    ZeroCopy,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Overlay: u32 {
        const BORDER = 1;
        const MARKERS = 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WarpParams {
    /// Normalized destination corners, y pointing down.
    pub corners: [Point2<f64>; 4],
    pub homography: Homography,
    /// Projective weights for seamless quad rendering, absent for non-convex quads.
    pub q_weights: Option<[f64; 4]>,
}

#[derive(Debug, Clone)]
pub struct CompositePass {
    pub mode: RenderMode,
    pub warp: Option<WarpParams>,
    pub overlay: Overlay,
    pub border_width: u32,
    pub active_corner: Corner,
}

impl CompositePass {
    pub fn direct() -> Self {
        CompositePass {
            mode: RenderMode::Direct,
            warp: None,
            overlay: Overlay::empty(),
            border_width: 0,
            active_corner: Corner::TopLeft,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("buffer {0} has no backing storage")]
    MissingBuffer(usize),
    #[error("frame format is not supported by this compositor")]
    Unsupported,
    #[error("GL error 0x{0:x} while drawing")]
    Draw(u32),
    #[error(transparent)]
    Gl(#[from] GlesError),
}

/// Draws a frame into a swap chain buffer.
///
/// `frame` is `None` when there is nothing decoded yet, which clears the target.
pub trait Compositor<S: NativeSurface> {
    fn composite(
        &mut self,
        surface: &mut S,
        slot: usize,
        frame: Option<&DecodedFrame>,
        pass: &CompositePass,
    ) -> Result<(), CompositeError>;

    /// Whether the warp pass is usable, which is not the case after shader failures.
    fn warp_available(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub looping: bool,
    pub triple_buffering: bool,
    pub zero_copy: bool,
    pub target_fps: f64,
    pub max_recovery_attempts: u32,
    pub frame_limit: Option<u64>,
    /// Keep the loop spinning and never hold back decoding, instead of pacing the waits.
    pub continuous: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            looping: false,
            triple_buffering: false,
            zero_copy: false,
            target_fps: pacing::DEFAULT_TARGET_FPS,
            max_recovery_attempts: watchdog::DEFAULT_MAX_RECOVERY_ATTEMPTS,
            frame_limit: None,
            continuous: false,
        }
    }
}

/// Zero-copy presentation is only used while nothing needs to be drawn on top of the frame.
pub fn should_use_zero_copy(options: &PipelineOptions, keystone_enabled: bool) -> bool {
    options.zero_copy && !keystone_enabled
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Presentation(#[from] PresentationError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error("playback stalled, {attempts} recovery attempts failed")]
    StallExhausted { attempts: u32 },
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::StallExhausted { .. } => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfStream,
    FrameLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished(FinishReason),
}

#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    /// Decoded frames handed to the display.
    pub submitted: u64,
    /// Decoded frames that reached the screen.
    pub presented: u64,
    /// Repeated presentations of an already shown frame.
    pub redraws: u64,
    pub dropped: u64,
    pub loops: u64,
    pub recoveries: u64,
    pub total_latency: Duration,
}

impl PlaybackStats {
    pub fn average_latency(&self) -> Duration {
        match self.presented + self.redraws {
            0 => Duration::ZERO,
            n => self.total_latency / n as u32,
        }
    }
}

/// Maps presentation timestamps to wall clock time.
#[derive(Debug, Clone, Default)]
struct PlaybackClock {
    origin: Option<Instant>,
    paused_at: Option<Instant>,
}

impl PlaybackClock {
    fn position(&mut self, now: Instant, first_pts: Duration) -> Duration {
        let now = self.paused_at.unwrap_or(now);
        let origin = *self.origin.get_or_insert_with(|| now.checked_sub(first_pts).unwrap_or(now));
        now.saturating_duration_since(origin)
    }

    fn pause(&mut self, now: Instant) {
        self.paused_at.get_or_insert(now);
    }

    fn resume(&mut self, now: Instant) {
        if let (Some(paused_at), Some(origin)) = (self.paused_at.take(), self.origin.as_mut()) {
            *origin += now.saturating_duration_since(paused_at);
        }
    }

    /// Re-anchors on the next frame.
    fn reset(&mut self) {
        self.origin = None;
    }
}

pub struct Pipeline<S, D, C>
where
    S: NativeSurface,
    D: Scanout<Framebuffer = S::Framebuffer>,
    C: Compositor<S>,
{
    swapchain: SwapChain<S>,
    presenter: PresentationEngine<D>,
    compositor: C,
    decoders: DecoderLadder,
    keystone: KeystoneState,
    pacing: PacingController,
    watchdog: Watchdog,
    wakeup: WakeupFlag,
    options: PipelineOptions,

    clock: PlaybackClock,
    /// Decoded, but not due yet.
    upcoming: Option<DecodedFrame>,
    /// The frame currently on screen, kept for redraws.
    current: Option<DecodedFrame>,
    decoder_flip: Option<bool>,
    mode: Option<RenderMode>,
    redraw: bool,
    paused: bool,
    eof: bool,

    stats: PlaybackStats,
    history: VecDeque<u64>,
}

impl<S, D, C> Pipeline<S, D, C>
where
    S: NativeSurface,
    D: Scanout<Framebuffer = S::Framebuffer>,
    C: Compositor<S>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        swapchain: SwapChain<S>,
        presenter: PresentationEngine<D>,
        compositor: C,
        mut decoders: DecoderLadder,
        keystone: KeystoneState,
        wakeup: WakeupFlag,
        options: PipelineOptions,
        now: Instant,
    ) -> Result<Self, PipelineError> {
        if decoders.current().is_none() {
            decoders.start()?;
        }
        let pacing = PacingController::new(options.target_fps, now);
        if let Some(decoder) = decoders.current() {
            decoder.set_queue_depth(pacing.queue_depth());
        }
        let watchdog = Watchdog::new(now, options.looping, options.max_recovery_attempts);

        Ok(Pipeline {
            swapchain,
            presenter,
            compositor,
            decoders,
            keystone,
            pacing,
            watchdog,
            wakeup,
            options,
            clock: PlaybackClock::default(),
            upcoming: None,
            current: None,
            decoder_flip: None,
            mode: None,
            redraw: true,
            paused: false,
            eof: false,
            stats: PlaybackStats::default(),
            history: VecDeque::with_capacity(HISTORY),
        })
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    /// Sequence numbers of the most recently presented frames, oldest first.
    pub fn history(&self) -> impl Iterator<Item = u64> + '_ {
        self.history.iter().copied()
    }

    pub fn swapchain(&self) -> &SwapChain<S> {
        &self.swapchain
    }

    pub fn presenter(&self) -> &PresentationEngine<D> {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut PresentationEngine<D> {
        &mut self.presenter
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }

    pub fn decoders(&self) -> &DecoderLadder {
        &self.decoders
    }

    pub fn pacing(&self) -> &PacingController {
        &self.pacing
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn keystone(&self) -> &KeystoneState {
        &self.keystone
    }

    pub fn render_mode(&self) -> Option<RenderMode> {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn poll_timeout(&self) -> Duration {
        if self.options.continuous {
            return CONTINUOUS_POLL_TIMEOUT;
        }
        self.pacing.poll_timeout().min(MAX_POLL_TIMEOUT)
    }

    pub fn apply_keystone(&mut self, command: KeystoneCommand) {
        if self.keystone.apply(command) {
            self.redraw = true;
        }
    }

    pub fn set_keystone(&mut self, keystone: KeystoneState) {
        self.keystone = keystone;
        self.redraw = true;
    }

    pub fn toggle_pause(&mut self, now: Instant) {
        self.paused = !self.paused;
        if self.paused {
            self.clock.pause(now);
        } else {
            self.clock.resume(now);
            self.watchdog.resumed(now);
        }
        info!(paused = self.paused, "Playback toggled.");
    }

    /// Runs one iteration of the frame loop.
    pub fn tick(&mut self, now: Instant) -> Result<Flow, PipelineError> {
        profiling::scope!("Pipeline::tick");
        let mut force = false;
        let action = match self.paused {
            true => WatchdogAction::Idle,
            false => self.watchdog.check(now),
        };
        match action {
            WatchdogAction::Idle => {}
            WatchdogAction::ForceRender => force = true,
            WatchdogAction::Recover {
                attempt,
                reset_decoder,
            } => {
                self.stats.recoveries += 1;
                self.presenter.reset_in_flight();
                self.process_present_events(now);
                self.clock.reset();
                if reset_decoder {
                    self.return_upcoming();
                    if let Some(decoder) = self.decoders.current() {
                        if let Err(err) = decoder.reset() {
                            warn!(?err, attempt, "Decoder reset failed.");
                        }
                    }
                }
                force = true;
            }
            WatchdogAction::Exhausted { attempts } => {
                return Err(PipelineError::StallExhausted { attempts });
            }
        }

        if self.pacing.maybe_adapt(now).is_some() {
            let depth = self.pacing.queue_depth();
            if let Some(decoder) = self.decoders.current() {
                decoder.set_queue_depth(depth);
            }
        }

        // the flag only wakes us up, the decoder is polled either way
        self.wakeup.take();

        if let Some(limit) = self.options.frame_limit {
            if self.stats.submitted >= limit {
                return Ok(Flow::Finished(FinishReason::FrameLimit));
            }
        }

        if self.paused {
            if self.redraw || force {
                self.render(None, now)?;
            }
            return Ok(Flow::Continue);
        }

        // delay decoding while the display still works on the previous frame
        if !force
            && !self.options.continuous
            && self.pacing.should_throttle()
            && self.upcoming.is_none()
            && self.presenter.in_flight() > 0
        {
            return Ok(Flow::Continue);
        }

        match self.next_due_frame(now)? {
            Some(frame) => self.render(Some(frame), now)?,
            None if force || self.redraw => self.render(None, now)?,
            None => {}
        }

        if self.eof && self.upcoming.is_none() {
            return Ok(Flow::Finished(FinishReason::EndOfStream));
        }
        Ok(Flow::Continue)
    }

    /// Handles readability of the display, delivering page flip completions.
    pub fn on_display_readable(&mut self, now: Instant) -> Result<(), PipelineError> {
        let result = self.presenter.dispatch();
        self.process_present_events(now);
        result?;
        Ok(())
    }

    fn next_due_frame(&mut self, now: Instant) -> Result<Option<DecodedFrame>, PipelineError> {
        let mut frame = match self.upcoming.take() {
            Some(frame) => frame,
            None => match self.poll_decoder(now)? {
                Some(frame) => frame,
                None => return Ok(None),
            },
        };

        loop {
            let position = self.clock.position(now, frame.pts);
            if frame.pts > position {
                self.upcoming = Some(frame);
                return Ok(None);
            }
            if position - frame.pts <= MAX_LATENESS {
                return Ok(Some(frame));
            }
            // late, skip it if there is something newer
            let Some(next) = self.poll_decoder(now)? else {
                return Ok(Some(frame));
            };
            debug!(seq = frame.seq, "Skipping late frame.");
            self.stats.dropped += 1;
            self.pacing.frame_dropped();
            self.return_frame(frame);
            frame = next;
        }
    }

    fn poll_decoder(&mut self, now: Instant) -> Result<Option<DecodedFrame>, PipelineError> {
        let Some(decoder) = self.decoders.current() else {
            return Err(DecoderError::Exhausted.into());
        };
        if let Some(frame) = decoder.try_get_next_frame() {
            self.decoders.frame_received();
            self.eof = false;
            return Ok(Some(frame));
        }

        if decoder.is_fatal_error() {
            self.fall_back("decoder reported a fatal error")?;
            return Ok(None);
        }
        if decoder.is_eof() {
            if self.options.looping {
                info!(loops = self.stats.loops + 1, "End of stream, restarting.");
                decoder.rewind()?;
                self.stats.loops += 1;
                self.clock.reset();
                self.watchdog.loop_restarted(now);
            } else if !self.eof {
                info!("End of stream.");
                self.eof = true;
            }
            return Ok(None);
        }
        if self.decoders.frame_not_ready() {
            self.fall_back("decoder stopped producing frames")?;
        }
        Ok(None)
    }

    fn fall_back(&mut self, reason: &str) -> Result<(), PipelineError> {
        // frames borrowed from the old decoder go back before it is dropped
        self.return_upcoming();
        if let Some(frame) = self.current.take() {
            self.return_frame(frame);
        }
        self.decoders.fall_back(reason)?;
        self.decoder_flip = None;
        self.clock.reset();
        self.redraw = true;
        let depth = self.pacing.queue_depth();
        if let Some(decoder) = self.decoders.current() {
            decoder.set_queue_depth(depth);
        }
        Ok(())
    }

    fn return_upcoming(&mut self) {
        if let Some(frame) = self.upcoming.take() {
            self.return_frame(frame);
        }
    }

    fn return_frame(&mut self, frame: DecodedFrame) {
        if let Some(decoder) = self.decoders.current() {
            decoder.return_frame(frame);
        }
    }

    fn select_mode(&self) -> RenderMode {
        if self.keystone.enabled() && self.compositor.warp_available() {
            RenderMode::Keystone
        } else if should_use_zero_copy(&self.options, self.keystone.enabled())
            && self.current.as_ref().is_some_and(DecodedFrame::is_external)
        {
            RenderMode::ZeroCopy
        } else {
            RenderMode::Direct
        }
    }

    fn composite_pass(&mut self, mode: RenderMode) -> CompositePass {
        let mut pass = CompositePass {
            mode,
            warp: None,
            overlay: Overlay::empty(),
            border_width: self.keystone.border_width(),
            active_corner: self.keystone.active_corner(),
        };
        if mode == RenderMode::Keystone {
            let corners = *self.keystone.corners();
            pass.warp = Some(WarpParams {
                corners,
                homography: *self.keystone.transform(),
                q_weights: quad_q_weights(&corners),
            });
            pass.overlay.set(Overlay::BORDER, self.keystone.border_visible());
            pass.overlay.set(Overlay::MARKERS, self.keystone.markers_visible());
        }
        pass
    }

    /// Keeps the decoder's row order in line with what the render path samples natively:
    /// the offscreen path wants frames upright, the direct path wants them flipped.
    fn sync_decoder_orientation(&mut self, mode: RenderMode) {
        let flip = mode == RenderMode::Direct;
        if self.decoder_flip == Some(flip) {
            return;
        }
        if let Some(decoder) = self.decoders.current() {
            decoder.set_flip_y(flip);
            self.decoder_flip = Some(flip);
        }
    }

    fn render(&mut self, frame: Option<DecodedFrame>, now: Instant) -> Result<(), PipelineError> {
        profiling::scope!("Pipeline::render");
        let seq = frame.as_ref().map(|frame| frame.seq);
        if let Some(frame) = frame {
            if let Some(previous) = self.current.replace(frame) {
                self.return_frame(previous);
            }
        }
        self.redraw = false;

        let mode = self.select_mode();
        if self.mode != Some(mode) {
            info!(?mode, "Render mode changed.");
            self.mode = Some(mode);
        }
        self.sync_decoder_orientation(mode);

        let waited = self.presenter.wait_for_capacity();
        self.process_present_events(now);
        waited?;

        let buffer = self.swapchain.acquire_writable_buffer()?;
        let pass = self.composite_pass(mode);
        if let Err(err) = self.compositor.composite(
            self.swapchain.surface_mut(),
            buffer.slot(),
            self.current.as_ref(),
            &pass,
        ) {
            warn!(?err, ?mode, "Compositing failed, dropping frame.");
            self.drop_frame(buffer);
            return Ok(());
        }

        let framebuffer = match self.swapchain.resolve_kernel_object(&buffer) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                warn!(?err, "Dropping frame.");
                self.drop_frame(buffer);
                return Ok(());
            }
        };

        self.swapchain.hand_to_display(&buffer);
        let outcome = self.presenter.submit(buffer, framebuffer, seq);
        // clears and redraws are not playback progress
        if seq.is_some() {
            self.watchdog.frame_submitted(now);
            self.stats.submitted += 1;
        }
        if let Ok(SubmitOutcome::Dropped) = outcome {
            self.stats.dropped += 1;
            self.pacing.frame_dropped();
        }
        self.process_present_events(now);
        outcome?;
        Ok(())
    }

    fn drop_frame(&mut self, buffer: swapchain::SwapBuffer) {
        self.stats.dropped += 1;
        self.pacing.frame_dropped();
        if let Err(err) = self.swapchain.release(buffer) {
            error!(?err, "Failed to release dropped buffer.");
        }
    }

    fn process_present_events(&mut self, now: Instant) {
        let events: SmallVec<[PresentEvent; 4]> = self.presenter.events().collect();
        for event in events {
            match event {
                PresentEvent::Release(buffer) => {
                    if let Err(err) = self.swapchain.release(buffer) {
                        error!(?err, "Display returned a buffer twice.");
                    }
                }
                PresentEvent::Presented { seq, latency } => {
                    self.stats.total_latency += latency;
                    match seq {
                        Some(seq) => {
                            self.stats.presented += 1;
                            if self.history.len() == HISTORY {
                                self.history.pop_front();
                            }
                            self.history.push_back(seq);
                            self.pacing.frame_rendered();
                            self.watchdog.frame_completed(now);
                        }
                        None => self.stats.redraws += 1,
                    }
                }
            }
        }
    }

    /// Stops playback, returning every buffer and restoring the display.
    pub fn shutdown(&mut self) {
        self.presenter.shutdown();
        self.process_present_events(Instant::now());
        self.return_upcoming();
        if let Some(frame) = self.current.take() {
            self.return_frame(frame);
        }

        let leaked = self.swapchain.checked_out();
        if leaked > 0 {
            error!(leaked, "Buffers still checked out at shutdown.");
        }
        self.swapchain.destroy_all();

        info!(
            presented = self.stats.presented,
            redraws = self.stats.redraws,
            dropped = self.stats.dropped,
            loops = self.stats.loops,
            recoveries = self.stats.recoveries,
            average_latency = ?self.stats.average_latency(),
            target_fps = self.pacing.target_fps(),
            measured_fps = self.pacing.measured_fps(),
            "Playback finished."
        );
    }

    pub fn scanout_disabled(&self) -> bool {
        self.presenter.state() == PresentState::ScanoutDisabled
    }
}

/// Object safe view of a [`Pipeline`], independent of the backend it runs on.
pub trait Player {
    fn tick(&mut self, now: Instant) -> Result<Flow, PipelineError>;
    fn on_display_readable(&mut self, now: Instant) -> Result<(), PipelineError>;
    fn poll_timeout(&self) -> Duration;
    fn keystone(&self) -> &KeystoneState;
    fn apply_keystone(&mut self, command: KeystoneCommand);
    fn set_keystone(&mut self, keystone: KeystoneState);
    fn toggle_pause(&mut self, now: Instant);
    fn stats(&self) -> &PlaybackStats;
    fn shutdown(&mut self);
}

impl<S, D, C> Player for Pipeline<S, D, C>
where
    S: NativeSurface,
    D: Scanout<Framebuffer = S::Framebuffer>,
    C: Compositor<S>,
{
    fn tick(&mut self, now: Instant) -> Result<Flow, PipelineError> {
        Pipeline::tick(self, now)
    }

    fn on_display_readable(&mut self, now: Instant) -> Result<(), PipelineError> {
        Pipeline::on_display_readable(self, now)
    }

    fn poll_timeout(&self) -> Duration {
        Pipeline::poll_timeout(self)
    }

    fn keystone(&self) -> &KeystoneState {
        Pipeline::keystone(self)
    }

    fn apply_keystone(&mut self, command: KeystoneCommand) {
        Pipeline::apply_keystone(self, command)
    }

    fn set_keystone(&mut self, keystone: KeystoneState) {
        Pipeline::set_keystone(self, keystone)
    }

    fn toggle_pause(&mut self, now: Instant) {
        Pipeline::toggle_pause(self, now)
    }

    fn stats(&self) -> &PlaybackStats {
        Pipeline::stats(self)
    }

    fn shutdown(&mut self) {
        Pipeline::shutdown(self)
    }
}

#[cfg(test)]
mod test {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        backend::headless::{Latency, MemorySurface, SoftwareCompositor, VirtualScanout},
        decoder::{FramePayload, OpenDecoder},
        keystone::Direction,
    };

    const FRAME: Duration = Duration::from_nanos(16_666_667);

    type TestPipeline = Pipeline<MemorySurface, VirtualScanout, SoftwareCompositor>;

    #[derive(Clone, Default)]
    struct Probe {
        outstanding: Rc<Cell<usize>>,
        stalled: Rc<Cell<bool>>,
        flips: Rc<RefCell<Vec<bool>>>,
    }

    /// Produces `frames` solid frames at 60 fps, as fast as it is asked to.
    struct ScriptedDecoder {
        frames: u64,
        next: u64,
        fatal_after: Option<u64>,
        depth: usize,
        flip: bool,
        probe: Probe,
    }

    impl Decoder for ScriptedDecoder {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn try_get_next_frame(&mut self) -> Option<DecodedFrame> {
            if self.probe.stalled.get() || self.is_eof() || self.is_fatal_error() {
                return None;
            }
            if self.probe.outstanding.get() >= self.depth + 2 {
                return None;
            }
            let seq = self.next;
            self.next += 1;
            self.probe.outstanding.set(self.probe.outstanding.get() + 1);
            Some(DecodedFrame {
                seq,
                pts: FRAME * seq as u32,
                width: 4,
                height: 3,
                flipped: self.flip,
                payload: FramePayload::Pixels(vec![0xFF00_0000 | seq as u32; 12]),
            })
        }

        fn return_frame(&mut self, _frame: DecodedFrame) {
            self.probe.outstanding.set(self.probe.outstanding.get() - 1);
        }

        fn is_eof(&self) -> bool {
            self.next >= self.frames
        }

        fn is_fatal_error(&self) -> bool {
            self.fatal_after.is_some_and(|after| self.next >= after)
        }

        fn rewind(&mut self) -> Result<(), DecoderError> {
            self.next = 0;
            Ok(())
        }

        fn reset(&mut self) -> Result<(), DecoderError> {
            Ok(())
        }

        fn set_queue_depth(&mut self, depth: usize) {
            self.depth = depth;
        }

        fn set_flip_y(&mut self, flip: bool) {
            self.flip = flip;
            self.probe.flips.borrow_mut().push(flip);
        }
    }

    fn scripted(name: &str, frames: u64, fatal_after: Option<u64>, probe: &Probe) -> (String, OpenDecoder) {
        let probe = probe.clone();
        let open: OpenDecoder = Box::new(move || {
            Ok(Box::new(ScriptedDecoder {
                frames,
                next: 0,
                fatal_after,
                depth: 3,
                flip: false,
                probe: probe.clone(),
            }) as Box<dyn Decoder>)
        });
        (name.to_string(), open)
    }

    fn build(
        backends: Vec<(String, OpenDecoder)>,
        scanout: VirtualScanout,
        options: PipelineOptions,
        start: Instant,
    ) -> TestPipeline {
        let ring = PresentationEngine::<VirtualScanout>::required_ring_size(options.triple_buffering);
        let presenter = PresentationEngine::new(scanout, options.triple_buffering)
            .with_completion_timeout(Duration::from_millis(5));
        Pipeline::new(
            SwapChain::new(MemorySurface::new((8, 6), ring)),
            presenter,
            SoftwareCompositor::new(),
            DecoderLadder::new(backends),
            KeystoneState::default(),
            WakeupFlag::default(),
            options,
            start,
        )
        .unwrap()
    }

    fn immediate() -> VirtualScanout {
        VirtualScanout::new(Latency::Fixed(Duration::ZERO))
    }

    /// Ticks `count` times, `step` apart, stopping early when playback finishes.
    fn run(
        pipeline: &mut TestPipeline,
        now: &mut Instant,
        count: usize,
        step: Duration,
    ) -> Option<FinishReason> {
        for _ in 0..count {
            *now += step;
            let flow = pipeline.tick(*now).unwrap();
            pipeline.on_display_readable(*now).unwrap();
            assert!(pipeline.swapchain().checked_out() <= pipeline.swapchain().ring_size());
            if let Flow::Finished(reason) = flow {
                return Some(reason);
            }
        }
        None
    }

    fn assert_clean(pipeline: &TestPipeline, probe: &Probe) {
        assert_eq!(probe.outstanding.get(), 0);
        assert_eq!(pipeline.swapchain().checked_out(), 0);
        assert_eq!(pipeline.swapchain().surface().live_framebuffers(), 0);
    }

    #[test]
    fn plays_every_frame_in_order() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("scripted", 300, None, &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );

        assert_eq!(
            run(&mut pipeline, &mut now, 400, FRAME),
            Some(FinishReason::EndOfStream)
        );
        pipeline.shutdown();

        assert_eq!(pipeline.stats().presented, 300);
        assert_eq!(pipeline.stats().dropped, 0);
        assert!(pipeline.history().eq(0..300));
        assert!(pipeline.presenter().display().restored());
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn plays_on_without_modeset_permission() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("scripted", 30, None, &probe)],
            immediate().with_denied_modeset(),
            PipelineOptions::default(),
            now,
        );

        let mut finished = None;
        for _ in 0..60 {
            now += FRAME;
            if let Flow::Finished(reason) = pipeline.tick(now).unwrap() {
                finished = Some(reason);
                break;
            }
            // every buffer comes straight back
            assert_eq!(pipeline.swapchain().checked_out(), 0);
        }
        assert_eq!(finished, Some(FinishReason::EndOfStream));
        assert!(pipeline.scanout_disabled());
        assert_eq!(pipeline.stats().presented, 30);

        pipeline.shutdown();
        assert!(!pipeline.presenter().display().restored());
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn recovers_once_from_a_stall() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("scripted", 10_000, None, &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );

        assert_eq!(run(&mut pipeline, &mut now, 60, FRAME), None);
        let before = pipeline.stats().presented;

        probe.stalled.set(true);
        assert_eq!(run(&mut pipeline, &mut now, 70, Duration::from_millis(50)), None);
        assert_eq!(pipeline.stats().recoveries, 1);
        assert_eq!(pipeline.watchdog().attempts(), 1);
        assert!(pipeline.stats().redraws >= 1);

        probe.stalled.set(false);
        assert_eq!(run(&mut pipeline, &mut now, 30, FRAME), None);
        assert_eq!(pipeline.watchdog().attempts(), 0);
        assert_eq!(pipeline.stats().recoveries, 1);
        assert!(pipeline.stats().presented > before);

        pipeline.shutdown();
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn silent_decoder_at_startup_is_not_a_stall() {
        let probe = Probe::default();
        probe.stalled.set(true);
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("scripted", 10_000, None, &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );

        assert_eq!(run(&mut pipeline, &mut now, 70, Duration::from_millis(50)), None);
        assert_eq!(pipeline.stats().recoveries, 0);
        assert_eq!(pipeline.watchdog().attempts(), 0);
        assert_eq!(pipeline.stats().submitted, 0);
        // the initial clear plus the forced renders at 1.5s and 3s
        assert!(pipeline.stats().redraws >= 3);

        probe.stalled.set(false);
        assert_eq!(run(&mut pipeline, &mut now, 30, FRAME), None);
        assert!(pipeline.stats().presented > 0);
        assert_eq!(pipeline.stats().recoveries, 0);

        pipeline.shutdown();
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn gives_up_when_the_stall_persists() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("scripted", 10_000, None, &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );
        run(&mut pipeline, &mut now, 10, FRAME);

        probe.stalled.set(true);
        let mut error = None;
        for _ in 0..400 {
            now += Duration::from_millis(50);
            if let Err(err) = pipeline.tick(now) {
                error = Some(err);
                break;
            }
        }
        let error = error.unwrap();
        assert!(matches!(error, PipelineError::StallExhausted { attempts: 3 }));
        assert_eq!(error.exit_code(), 2);

        pipeline.shutdown();
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn loops_at_end_of_stream() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let options = PipelineOptions {
            looping: true,
            ..Default::default()
        };
        let mut pipeline = build(vec![scripted("scripted", 10, None, &probe)], immediate(), options, now);

        assert_eq!(run(&mut pipeline, &mut now, 45, FRAME), None);
        assert!(pipeline.stats().loops >= 3);
        assert!(pipeline.stats().presented >= 40);
        assert!(pipeline.history().filter(|&seq| seq == 0).count() >= 4);

        pipeline.shutdown();
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn stops_at_the_frame_limit() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let options = PipelineOptions {
            frame_limit: Some(5),
            ..Default::default()
        };
        let mut pipeline = build(vec![scripted("scripted", 100, None, &probe)], immediate(), options, now);

        assert_eq!(
            run(&mut pipeline, &mut now, 20, FRAME),
            Some(FinishReason::FrameLimit)
        );
        pipeline.shutdown();
        assert_eq!(pipeline.stats().presented, 5);
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn keystone_switches_decoder_orientation() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("scripted", 100, None, &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );

        run(&mut pipeline, &mut now, 3, FRAME);
        assert_eq!(pipeline.render_mode(), Some(RenderMode::Direct));
        assert_eq!(*probe.flips.borrow(), vec![true]);

        pipeline.apply_keystone(KeystoneCommand::Toggle);
        run(&mut pipeline, &mut now, 3, FRAME);
        assert_eq!(pipeline.render_mode(), Some(RenderMode::Keystone));
        assert_eq!(*probe.flips.borrow(), vec![true, false]);

        pipeline.shutdown();
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn falls_back_after_a_fatal_decoder_error() {
        let flaky = Probe::default();
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![
                scripted("flaky", 100, Some(5), &flaky),
                scripted("scripted", 100, None, &probe),
            ],
            immediate(),
            PipelineOptions::default(),
            now,
        );

        assert_eq!(run(&mut pipeline, &mut now, 20, FRAME), None);
        assert_eq!(pipeline.decoders().current_name(), Some("scripted"));
        assert_eq!(flaky.outstanding.get(), 0);
        assert!(pipeline.stats().presented >= 15);

        pipeline.shutdown();
        assert_clean(&pipeline, &probe);
    }

    #[test]
    fn exhausted_decoders_are_fatal() {
        let probe = Probe::default();
        let mut now = Instant::now();
        let mut pipeline = build(
            vec![scripted("flaky", 100, Some(2), &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );

        let mut error = None;
        for _ in 0..10 {
            now += FRAME;
            if let Err(err) = pipeline.tick(now) {
                error = Some(err);
                break;
            }
        }
        let error = error.unwrap();
        assert!(matches!(error, PipelineError::Decoder(DecoderError::Exhausted)));
        assert_eq!(error.exit_code(), 1);
        assert_eq!(probe.outstanding.get(), 0);
    }

    #[test]
    fn buffer_accounting_survives_random_interaction() {
        let mut rng = StdRng::seed_from_u64(0xdec0de);
        for triple_buffering in [false, true] {
            let probe = Probe::default();
            let mut now = Instant::now();
            let options = PipelineOptions {
                looping: true,
                triple_buffering,
                ..Default::default()
            };
            let mut pipeline = build(
                vec![scripted("scripted", 50, None, &probe)],
                VirtualScanout::new(Latency::Manual),
                options,
                now,
            );

            for _ in 0..600 {
                now += FRAME;
                match rng.random_range(0..20) {
                    0 => pipeline.toggle_pause(now),
                    1 => pipeline.apply_keystone(KeystoneCommand::Toggle),
                    2 => pipeline.apply_keystone(KeystoneCommand::Select(
                        Corner::ALL[rng.random_range(0..4)],
                    )),
                    3 => pipeline.apply_keystone(KeystoneCommand::Move(Direction::Left)),
                    4 => pipeline.apply_keystone(KeystoneCommand::Move(Direction::Down)),
                    5 => pipeline.apply_keystone(KeystoneCommand::ToggleMarkers),
                    _ => {}
                }
                if rng.random_bool(0.7) {
                    pipeline.presenter_mut().display_mut().complete(1);
                }

                pipeline.tick(now).unwrap();
                pipeline.on_display_readable(now).unwrap();

                assert!(pipeline.presenter().in_flight() <= pipeline.presenter().cap());
                assert!(pipeline.swapchain().checked_out() <= pipeline.swapchain().ring_size());
                assert!(probe.outstanding.get() <= 2);
            }

            pipeline.shutdown();
            assert_clean(&pipeline, &probe);
        }
    }

    #[test]
    fn continuous_mode_polls_without_pacing() {
        let probe = Probe::default();
        let now = Instant::now();
        let paced = build(
            vec![scripted("scripted", 10, None, &probe)],
            immediate(),
            PipelineOptions::default(),
            now,
        );
        assert_eq!(paced.poll_timeout(), paced.pacing().poll_timeout());

        let probe = Probe::default();
        let options = PipelineOptions {
            continuous: true,
            ..Default::default()
        };
        let continuous = build(vec![scripted("scripted", 10, None, &probe)], immediate(), options, now);
        assert_eq!(continuous.poll_timeout(), CONTINUOUS_POLL_TIMEOUT);
    }

    #[test]
    fn zero_copy_yields_to_keystone() {
        let options = PipelineOptions {
            zero_copy: true,
            ..Default::default()
        };
        assert!(should_use_zero_copy(&options, false));
        assert!(!should_use_zero_copy(&options, true));
        assert!(!should_use_zero_copy(&PipelineOptions::default(), false));
    }

    #[test]
    fn paused_clock_does_not_advance() {
        let start = Instant::now();
        let mut clock = PlaybackClock::default();
        assert_eq!(clock.position(start, Duration::ZERO), Duration::ZERO);
        clock.pause(start + Duration::from_secs(1));
        clock.resume(start + Duration::from_secs(3));
        assert_eq!(
            clock.position(start + Duration::from_secs(4), Duration::ZERO),
            Duration::from_secs(2)
        );
    }
}
