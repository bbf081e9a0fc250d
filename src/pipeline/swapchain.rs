// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use tracing::{debug, trace, warn};

/// Dimensions of one natively allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// The windowing side of the swap chain: a fixed ring of display importable buffers.
pub trait NativeSurface {
    type Framebuffer: Copy + fmt::Debug + PartialEq + 'static;

    fn ring_size(&self) -> usize;
    fn size(&self) -> (u32, u32);
    /// Makes sure native memory backs `slot`, allocating it if necessary.
    fn allocate(&mut self, slot: usize) -> Result<BufferInfo, SurfaceError>;
    /// Registers `slot` with the display subsystem.
    fn register_framebuffer(
        &mut self,
        slot: usize,
    ) -> io::Result<CachedFramebuffer<Self::Framebuffer>>;
    /// Frees the native memory of `slot`.
    fn destroy(&mut self, slot: usize);
}

/// A kernel framebuffer registration that is torn down when dropped.
pub struct CachedFramebuffer<F> {
    id: F,
    destructor: Option<Box<dyn FnOnce()>>,
}

impl<F: Copy + 'static> CachedFramebuffer<F> {
    pub fn new(id: F, destructor: impl FnOnce(F) + 'static) -> Self {
        CachedFramebuffer {
            id,
            destructor: Some(Box::new(move || destructor(id))),
        }
    }

    pub fn id(&self) -> F {
        self.id
    }
}

impl<F> Drop for CachedFramebuffer<F> {
    fn drop(&mut self) {
        if let Some(destructor) = self.destructor.take() {
            destructor();
        }
    }
}

impl<F: fmt::Debug> fmt::Debug for CachedFramebuffer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFramebuffer")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("all {ring} buffers are checked out")]
    Exhausted { ring: usize },
    #[error("failed to allocate buffer {slot}: {reason}")]
    Allocation { slot: usize, reason: String },
    #[error("buffer {slot} is not checked out")]
    NotCheckedOut { slot: usize },
}

#[derive(Debug, thiserror::Error)]
#[error("failed to register framebuffer for buffer {slot}: {source}")]
pub struct DisplayRegistrationError {
    pub slot: usize,
    #[source]
    pub source: io::Error,
}

/// A checked out swap chain buffer.
///
/// Deliberately neither `Clone` nor `Copy`: handing it back through [`SwapChain::release`]
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct SwapBuffer {
    slot: usize,
    generation: u64,
}

impl SwapBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Free,
    GpuWrite,
    Display,
}

struct Slot<F> {
    info: Option<BufferInfo>,
    ownership: Ownership,
    framebuffer: Option<CachedFramebuffer<F>>,
    generation: u64,
}

pub struct SwapChain<S: NativeSurface> {
    surface: S,
    slots: Vec<Slot<S::Framebuffer>>,
    next: usize,
}

impl<S: NativeSurface> fmt::Debug for SwapChain<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapChain")
            .field("ring", &self.slots.len())
            .field("checked_out", &self.checked_out())
            .finish_non_exhaustive()
    }
}

impl<S: NativeSurface> SwapChain<S> {
    pub fn new(surface: S) -> Self {
        let slots = (0..surface.ring_size())
            .map(|_| Slot {
                info: None,
                ownership: Ownership::Free,
                framebuffer: None,
                generation: 0,
            })
            .collect();
        SwapChain {
            surface,
            slots,
            next: 0,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    /// Buffers acquired but not yet released.
    pub fn checked_out(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.ownership != Ownership::Free)
            .count()
    }

    pub fn ownership(&self, buffer: &SwapBuffer) -> Ownership {
        self.slots[buffer.slot].ownership
    }

    pub fn buffer_info(&self, buffer: &SwapBuffer) -> Option<BufferInfo> {
        self.slots[buffer.slot].info
    }

    /// Checks out the next free buffer for rendering.
    ///
    /// Running out of buffers means one was never released, which is reported instead of
    /// waited on.
    pub fn acquire_writable_buffer(&mut self) -> Result<SwapBuffer, SurfaceError> {
        let ring = self.slots.len();
        let slot = (0..ring)
            .map(|offset| (self.next + offset) % ring)
            .find(|slot| self.slots[*slot].ownership == Ownership::Free)
            .ok_or(SurfaceError::Exhausted { ring })?;

        if self.slots[slot].info.is_none() {
            let info = self.surface.allocate(slot)?;
            trace!(slot, ?info, "Allocated swap buffer.");
            self.slots[slot].info = Some(info);
        }

        let entry = &mut self.slots[slot];
        entry.ownership = Ownership::GpuWrite;
        self.next = (slot + 1) % ring;
        Ok(SwapBuffer {
            slot,
            generation: entry.generation,
        })
    }

    /// Returns the kernel framebuffer of `buffer`, registering it on first use.
    pub fn resolve_kernel_object(
        &mut self,
        buffer: &SwapBuffer,
    ) -> Result<S::Framebuffer, DisplayRegistrationError> {
        let slot = buffer.slot;
        if let Some(framebuffer) = self.slots[slot].framebuffer.as_ref() {
            return Ok(framebuffer.id());
        }

        let framebuffer = self
            .surface
            .register_framebuffer(slot)
            .map_err(|source| DisplayRegistrationError { slot, source })?;
        let id = framebuffer.id();
        debug!(slot, ?id, "Registered framebuffer.");
        self.slots[slot].framebuffer = Some(framebuffer);
        Ok(id)
    }

    /// Marks `buffer` as owned by the display until it is released.
    pub fn hand_to_display(&mut self, buffer: &SwapBuffer) {
        if self.is_current(buffer) {
            self.slots[buffer.slot].ownership = Ownership::Display;
        }
    }

    /// Returns `buffer` to the free pool.
    pub fn release(&mut self, buffer: SwapBuffer) -> Result<(), SurfaceError> {
        let slot = buffer.slot;
        if !self.is_current(&buffer) || self.slots[slot].ownership == Ownership::Free {
            return Err(SurfaceError::NotCheckedOut { slot });
        }
        self.slots[slot].ownership = Ownership::Free;
        trace!(slot, "Released swap buffer.");
        Ok(())
    }

    fn is_current(&self, buffer: &SwapBuffer) -> bool {
        self.slots
            .get(buffer.slot)
            .is_some_and(|slot| slot.generation == buffer.generation)
    }

    /// Destroys all native buffers, deregistering their framebuffers first.
    pub fn destroy_all(&mut self) {
        let checked_out = self.checked_out();
        if checked_out > 0 {
            warn!(checked_out, "Destroying swap chain with buffers still checked out.");
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            // drops the cached registration before the memory behind it
            slot.framebuffer.take();
            if slot.info.take().is_some() {
                self.surface.destroy(index);
            }
            slot.ownership = Ownership::Free;
            slot.generation += 1;
        }
    }
}

impl<S: NativeSurface> Drop for SwapChain<S> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    /// Records native operations so ordering can be asserted.
    #[derive(Default)]
    pub struct FakeSurface {
        pub ring: usize,
        pub log: Rc<RefCell<Vec<String>>>,
        pub fail_registration: bool,
        next_id: u32,
    }

    impl FakeSurface {
        pub fn new(ring: usize) -> Self {
            FakeSurface {
                ring,
                ..Default::default()
            }
        }
    }

    impl NativeSurface for FakeSurface {
        type Framebuffer = u32;

        fn ring_size(&self) -> usize {
            self.ring
        }

        fn size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn allocate(&mut self, slot: usize) -> Result<BufferInfo, SurfaceError> {
            self.log.borrow_mut().push(format!("alloc {slot}"));
            Ok(BufferInfo {
                width: 4,
                height: 4,
                pitch: 16,
            })
        }

        fn register_framebuffer(&mut self, slot: usize) -> io::Result<CachedFramebuffer<u32>> {
            if self.fail_registration {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            self.next_id += 1;
            self.log.borrow_mut().push(format!("addfb {slot}"));
            let log = self.log.clone();
            Ok(CachedFramebuffer::new(self.next_id, move |id| {
                log.borrow_mut().push(format!("rmfb {id}"))
            }))
        }

        fn destroy(&mut self, slot: usize) {
            self.log.borrow_mut().push(format!("destroy {slot}"));
        }
    }

    #[test]
    fn framebuffers_are_cached_per_buffer() {
        let surface = FakeSurface::new(2);
        let log = surface.log.clone();
        let mut chain = SwapChain::new(surface);

        let buffer = chain.acquire_writable_buffer().unwrap();
        let first = chain.resolve_kernel_object(&buffer).unwrap();
        assert_eq!(chain.resolve_kernel_object(&buffer).unwrap(), first);
        chain.release(buffer).unwrap();

        let other = chain.acquire_writable_buffer().unwrap();
        assert_ne!(chain.resolve_kernel_object(&other).unwrap(), first);
        chain.release(other).unwrap();

        let again = chain.acquire_writable_buffer().unwrap();
        assert_eq!(again.slot(), 0);
        assert_eq!(chain.resolve_kernel_object(&again).unwrap(), first);
        chain.release(again).unwrap();

        let addfb = log.borrow().iter().filter(|l| l.starts_with("addfb")).count();
        assert_eq!(addfb, 2);
    }

    #[test]
    fn exhaustion_is_surfaced() {
        let mut chain = SwapChain::new(FakeSurface::new(2));
        let _a = chain.acquire_writable_buffer().unwrap();
        let _b = chain.acquire_writable_buffer().unwrap();
        assert!(matches!(
            chain.acquire_writable_buffer(),
            Err(SurfaceError::Exhausted { ring: 2 })
        ));
    }

    #[test]
    fn registration_failure_leaves_buffer_releasable() {
        let mut surface = FakeSurface::new(2);
        surface.fail_registration = true;
        let mut chain = SwapChain::new(surface);
        let buffer = chain.acquire_writable_buffer().unwrap();
        assert!(chain.resolve_kernel_object(&buffer).is_err());
        chain.release(buffer).unwrap();
        assert_eq!(chain.checked_out(), 0);
    }

    #[test]
    fn stale_buffers_are_rejected() {
        let mut chain = SwapChain::new(FakeSurface::new(2));
        let buffer = chain.acquire_writable_buffer().unwrap();
        let forged = SwapBuffer {
            slot: buffer.slot(),
            generation: 0,
        };
        chain.release(buffer).unwrap();
        assert!(matches!(
            chain.release(forged),
            Err(SurfaceError::NotCheckedOut { slot: 0 })
        ));
    }

    #[test]
    fn destruction_deregisters_before_freeing() {
        let surface = FakeSurface::new(2);
        let log = surface.log.clone();
        {
            let mut chain = SwapChain::new(surface);
            let buffer = chain.acquire_writable_buffer().unwrap();
            chain.resolve_kernel_object(&buffer).unwrap();
            chain.release(buffer).unwrap();
        }
        let log = log.borrow();
        let rmfb = log.iter().position(|l| l == "rmfb 1").unwrap();
        let destroy = log.iter().position(|l| l == "destroy 0").unwrap();
        assert!(rmfb < destroy);
    }
}
