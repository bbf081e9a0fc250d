// SPDX-License-Identifier: GPL-3.0-only

//! Display backend without any hardware: buffers in system memory, a simulated
//! vblank and a software compositor. Used for `--headless` and the pipeline tests.

use std::{
    cell::Cell,
    collections::VecDeque,
    io,
    rc::Rc,
    time::{Duration, Instant},
};

use cgmath::Point2;
use tracing::{debug, info};

use crate::{
    decoder::DecodedFrame,
    keystone::{Corner, Homography},
    pipeline::{
        present::{CommitError, CompletionMode, Scanout},
        swapchain::{BufferInfo, CachedFramebuffer, NativeSurface, SurfaceError},
        CompositeError, CompositePass, Compositor, Overlay, RenderMode,
    },
};

pub const DEFAULT_SIZE: (u32, u32) = (1280, 720);
pub const DEFAULT_REFRESH: Duration = Duration::from_nanos(16_666_667);

pub const BLACK: u32 = 0xFF00_0000;
pub const BORDER_COLOR: u32 = 0xFFFF_FFFF;
pub const MARKER_COLOR: u32 = 0xFF00_FF00;
pub const ACTIVE_MARKER_COLOR: u32 = 0xFFFF_0000;
pub const MARKER_SIZE: u32 = 12;

/// A ring of XRGB8888 buffers in system memory.
#[derive(Debug)]
pub struct MemorySurface {
    size: (u32, u32),
    slots: Vec<Option<Vec<u32>>>,
    next_framebuffer: u32,
    live_framebuffers: Rc<Cell<usize>>,
    registration_failures: u32,
}

impl MemorySurface {
    pub fn new(size: (u32, u32), ring_size: usize) -> Self {
        MemorySurface {
            size,
            slots: (0..ring_size).map(|_| None).collect(),
            next_framebuffer: 1,
            live_framebuffers: Rc::new(Cell::new(0)),
            registration_failures: 0,
        }
    }

    /// Makes the next `count` framebuffer registrations fail.
    pub fn fail_registrations(&mut self, count: u32) {
        self.registration_failures = count;
    }

    pub fn live_framebuffers(&self) -> usize {
        self.live_framebuffers.get()
    }

    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn pixels(&self, slot: usize) -> Option<&[u32]> {
        self.slots.get(slot)?.as_deref()
    }

    pub fn pixels_mut(&mut self, slot: usize) -> Option<&mut [u32]> {
        self.slots.get_mut(slot)?.as_deref_mut()
    }
}

impl NativeSurface for MemorySurface {
    type Framebuffer = u32;

    fn ring_size(&self) -> usize {
        self.slots.len()
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn allocate(&mut self, slot: usize) -> Result<BufferInfo, SurfaceError> {
        let (width, height) = self.size;
        let storage = self.slots.get_mut(slot).ok_or_else(|| SurfaceError::Allocation {
            slot,
            reason: "slot out of range".into(),
        })?;
        storage.get_or_insert_with(|| vec![BLACK; width as usize * height as usize]);
        Ok(BufferInfo {
            width,
            height,
            pitch: width * 4,
        })
    }

    fn register_framebuffer(&mut self, slot: usize) -> io::Result<CachedFramebuffer<u32>> {
        if self.registration_failures > 0 {
            self.registration_failures -= 1;
            return Err(io::Error::other(format!("framebuffer for buffer {slot} rejected")));
        }
        let id = self.next_framebuffer;
        self.next_framebuffer += 1;
        let live = self.live_framebuffers.clone();
        live.set(live.get() + 1);
        Ok(CachedFramebuffer::new(id, move |_| live.set(live.get() - 1)))
    }

    fn destroy(&mut self, slot: usize) {
        if let Some(storage) = self.slots.get_mut(slot) {
            *storage = None;
        }
    }
}

/// When simulated flips complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    /// A fixed time after submission, like a display refreshing at a fixed rate.
    Fixed(Duration),
    /// When released with [`VirtualScanout::complete`], or when somebody waits for it.
    Manual,
    /// Never, like a hung display driver.
    Never,
}

#[derive(Debug)]
struct InFlight {
    framebuffer: u32,
    submitted: Instant,
}

/// Simulated CRTC. Like the kernel it accepts only one outstanding commit at a time.
#[derive(Debug)]
pub struct VirtualScanout {
    latency: Latency,
    atomic: bool,
    deny_modeset: bool,
    flip_failures: u32,

    in_flight: VecDeque<InFlight>,
    released: usize,
    on_screen: Option<u32>,

    modesets: u32,
    flips: u64,
    completions: u64,
    restored: bool,
}

impl VirtualScanout {
    pub fn new(latency: Latency) -> Self {
        VirtualScanout {
            latency,
            atomic: false,
            deny_modeset: false,
            flip_failures: 0,
            in_flight: VecDeque::new(),
            released: 0,
            on_screen: None,
            modesets: 0,
            flips: 0,
            completions: 0,
            restored: false,
        }
    }

    /// Signals modeset completion with an event, like an atomic commit.
    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Rejects the initial modeset with a permission error, like a non-master client.
    pub fn with_denied_modeset(mut self) -> Self {
        self.deny_modeset = true;
        self
    }

    pub fn set_latency(&mut self, latency: Latency) {
        self.latency = latency;
        self.released = 0;
    }

    /// Makes the next `count` flips fail.
    pub fn fail_flips(&mut self, count: u32) {
        self.flip_failures = count;
    }

    /// Lets `count` outstanding commits complete, for [`Latency::Manual`].
    pub fn complete(&mut self, count: usize) {
        self.released = (self.released + count).min(self.in_flight.len());
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn on_screen(&self) -> Option<u32> {
        self.on_screen
    }

    pub fn modesets(&self) -> u32 {
        self.modesets
    }

    pub fn flips(&self) -> u64 {
        self.flips
    }

    pub fn completions(&self) -> u64 {
        self.completions
    }

    pub fn restored(&self) -> bool {
        self.restored
    }

    fn matured(&self, now: Instant) -> usize {
        match self.latency {
            Latency::Fixed(latency) => self
                .in_flight
                .iter()
                .take_while(|commit| commit.submitted + latency <= now)
                .count(),
            Latency::Manual => self.released,
            Latency::Never => 0,
        }
    }
}

impl Scanout for VirtualScanout {
    type Framebuffer = u32;

    fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn commit_modeset(&mut self, framebuffer: u32) -> Result<CompletionMode, CommitError> {
        if self.deny_modeset {
            return Err(CommitError::Permission(io::Error::from_raw_os_error(
                libc::EACCES,
            )));
        }
        self.modesets += 1;
        if self.atomic {
            self.in_flight.push_back(InFlight {
                framebuffer,
                submitted: Instant::now(),
            });
            Ok(CompletionMode::Event)
        } else {
            self.on_screen = Some(framebuffer);
            Ok(CompletionMode::Immediate)
        }
    }

    fn commit_flip(&mut self, framebuffer: u32) -> Result<(), CommitError> {
        if self.flip_failures > 0 {
            self.flip_failures -= 1;
            return Err(CommitError::Other(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        if !self.in_flight.is_empty() {
            return Err(CommitError::Busy(io::Error::from_raw_os_error(libc::EBUSY)));
        }
        self.flips += 1;
        self.in_flight.push_back(InFlight {
            framebuffer,
            submitted: Instant::now(),
        });
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let now = Instant::now();
        if self.matured(now) > 0 {
            return Ok(true);
        }
        match self.latency {
            Latency::Fixed(latency) => {
                let Some(oldest) = self.in_flight.front() else {
                    return Ok(false);
                };
                let ready_at = oldest.submitted + latency;
                let wait = ready_at.saturating_duration_since(now);
                std::thread::sleep(wait.min(timeout));
                Ok(wait <= timeout)
            }
            Latency::Manual => {
                // waiting is what lets the next vblank happen
                if self.in_flight.is_empty() {
                    return Ok(false);
                }
                self.released += 1;
                Ok(true)
            }
            Latency::Never => Ok(false),
        }
    }

    fn read_completions(&mut self) -> io::Result<usize> {
        let count = self.matured(Instant::now());
        for commit in self.in_flight.drain(..count) {
            self.on_screen = Some(commit.framebuffer);
        }
        if self.latency == Latency::Manual {
            self.released -= count;
        }
        self.completions += count as u64;
        Ok(count)
    }

    fn restore(&mut self) -> Result<(), CommitError> {
        debug!(flips = self.flips, "Restoring virtual display.");
        self.in_flight.clear();
        self.released = 0;
        self.on_screen = None;
        self.restored = true;
        Ok(())
    }
}

/// CPU rendition of the GL compositor, with nearest neighbour sampling.
#[derive(Debug, Default)]
pub struct SoftwareCompositor {
    offscreen: Vec<u32>,
}

impl SoftwareCompositor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compositor<MemorySurface> for SoftwareCompositor {
    fn composite(
        &mut self,
        surface: &mut MemorySurface,
        slot: usize,
        frame: Option<&DecodedFrame>,
        pass: &CompositePass,
    ) -> Result<(), CompositeError> {
        profiling::scope!("SoftwareCompositor::composite");
        let (width, height) = surface.size();
        let target = surface
            .pixels_mut(slot)
            .ok_or(CompositeError::MissingBuffer(slot))?;

        let Some(frame) = frame else {
            target.fill(BLACK);
            return Ok(());
        };

        match (pass.mode, &pass.warp) {
            (RenderMode::Keystone, Some(warp)) => {
                self.offscreen.resize(target.len(), BLACK);
                draw_scaled(frame, &mut self.offscreen, width, height)?;
                warp_into(&warp.homography, &self.offscreen, target, width, height);
            }
            (RenderMode::ZeroCopy, _) if frame.is_external() => {
                return Err(CompositeError::Unsupported)
            }
            _ => draw_scaled(frame, target, width, height)?,
        }

        if pass.mode == RenderMode::Keystone {
            if let Some(warp) = &pass.warp {
                if pass.overlay.contains(Overlay::BORDER) {
                    draw_border(target, width, height, &warp.corners, pass.border_width);
                }
                if pass.overlay.contains(Overlay::MARKERS) {
                    draw_markers(target, width, height, &warp.corners, pass.active_corner);
                }
            }
        }
        Ok(())
    }

    fn warp_available(&self) -> bool {
        true
    }
}

/// Scales `frame` upright into `target`.
fn draw_scaled(
    frame: &DecodedFrame,
    target: &mut [u32],
    width: u32,
    height: u32,
) -> Result<(), CompositeError> {
    let pixels = frame.pixels().ok_or(CompositeError::Unsupported)?;
    let (fw, fh) = (frame.width as usize, frame.height as usize);
    if fw == 0 || fh == 0 || pixels.len() < fw * fh {
        target.fill(BLACK);
        return Ok(());
    }

    for y in 0..height as usize {
        let row = (y * fh) / height as usize;
        let row = if frame.flipped { fh - 1 - row } else { row };
        let src = &pixels[row * fw..(row + 1) * fw];
        let dst = &mut target[y * width as usize..(y + 1) * width as usize];
        for (x, pixel) in dst.iter_mut().enumerate() {
            *pixel = src[(x * fw) / width as usize];
        }
    }
    Ok(())
}

/// Maps every target pixel back through the inverse homography.
fn warp_into(homography: &Homography, source: &[u32], target: &mut [u32], width: u32, height: u32) {
    let (w, h) = (width as f64, height as f64);
    for y in 0..height as usize {
        for x in 0..width as usize {
            let point = Point2::new((x as f64 + 0.5) / w, (y as f64 + 0.5) / h);
            let pixel = homography
                .apply_inverse(point)
                .filter(|src| (0.0..1.0).contains(&src.x) && (0.0..1.0).contains(&src.y))
                .map(|src| {
                    let sx = ((src.x * w) as usize).min(width as usize - 1);
                    let sy = ((src.y * h) as usize).min(height as usize - 1);
                    source[sy * width as usize + sx]
                })
                .unwrap_or(BLACK);
            target[y * width as usize + x] = pixel;
        }
    }
}

fn to_pixels(corner: Point2<f64>, width: u32, height: u32) -> (f64, f64) {
    (corner.x * width as f64, corner.y * height as f64)
}

fn stamp(target: &mut [u32], width: u32, height: u32, center: (f64, f64), size: u32, color: u32) {
    let half = size as f64 / 2.0;
    let x0 = (center.0 - half).round().max(0.0) as i64;
    let y0 = (center.1 - half).round().max(0.0) as i64;
    let x1 = ((center.0 + half).round() as i64).min(width as i64);
    let y1 = ((center.1 + half).round() as i64).min(height as i64);
    for y in y0..y1 {
        for x in x0..x1 {
            target[y as usize * width as usize + x as usize] = color;
        }
    }
}

fn draw_border(
    target: &mut [u32],
    width: u32,
    height: u32,
    corners: &[Point2<f64>; 4],
    border_width: u32,
) {
    let [tl, tr, bl, br] = corners.map(|corner| to_pixels(corner, width, height));
    for (from, to) in [(tl, tr), (tr, br), (br, bl), (bl, tl)] {
        let length = (to.0 - from.0).hypot(to.1 - from.1);
        let steps = length.ceil().max(1.0) as usize;
        for step in 0..=steps {
            let t = step as f64 / steps as f64;
            let point = (from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t);
            stamp(target, width, height, point, border_width.max(1), BORDER_COLOR);
        }
    }
}

fn draw_markers(
    target: &mut [u32],
    width: u32,
    height: u32,
    corners: &[Point2<f64>; 4],
    active: Corner,
) {
    for corner in Corner::ALL {
        let color = if corner == active {
            ACTIVE_MARKER_COLOR
        } else {
            MARKER_COLOR
        };
        let center = to_pixels(corners[corner.index()], width, height);
        stamp(target, width, height, center, MARKER_SIZE, color);
    }
}

/// Everything the headless backend needs to run a pipeline.
pub fn create(
    size: (u32, u32),
    ring_size: usize,
    refresh: Duration,
) -> (MemorySurface, VirtualScanout, SoftwareCompositor) {
    info!(width = size.0, height = size.1, ?refresh, "Using headless display.");
    (
        MemorySurface::new(size, ring_size),
        VirtualScanout::new(Latency::Fixed(refresh)),
        SoftwareCompositor::new(),
    )
}
