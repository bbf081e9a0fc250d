// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use smithay::{
    backend::{
        allocator::{
            dmabuf::{AsDmabuf, Dmabuf},
            gbm::{GbmAllocator, GbmBuffer, GbmBufferFlags, GbmDevice},
            Allocator, Fourcc, Modifier,
        },
        drm::DrmDeviceFd,
    },
    reexports::{
        drm::{
            buffer::Buffer as DrmBuffer,
            control::{
                atomic::AtomicModeReq, connector, crtc, framebuffer, plane, property,
                AtomicCommitFlags, Device as ControlDevice, Event, Mode, PageFlipFlags,
            },
        },
    },
};
use rustix::event::{PollFd, PollFlags};
use std::{io, time::Duration};
use tracing::{debug, info, trace, warn};

use super::drm_helpers::{get_prop, primary_plane, OutputSelection};
use crate::{
    backend::render::DmabufSurface,
    pipeline::{
        present::{CommitError, CompletionMode, Scanout},
        swapchain::{BufferInfo, CachedFramebuffer, NativeSurface, SurfaceError},
    },
};

/// A ring of GBM scanout buffers, rendered to through their dmabufs.
pub struct GbmSurface {
    allocator: GbmAllocator<DrmDeviceFd>,
    fd: DrmDeviceFd,
    size: (u32, u32),
    buffers: Vec<Option<(GbmBuffer, Dmabuf)>>,
}

impl std::fmt::Debug for GbmSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbmSurface")
            .field("size", &self.size)
            .field(
                "allocated",
                &self.buffers.iter().filter(|b| b.is_some()).count(),
            )
            .finish_non_exhaustive()
    }
}

impl GbmSurface {
    pub fn new(
        gbm: GbmDevice<DrmDeviceFd>,
        fd: DrmDeviceFd,
        size: (u32, u32),
        ring_size: usize,
    ) -> Self {
        GbmSurface {
            allocator: GbmAllocator::new(gbm, GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT),
            fd,
            size,
            buffers: (0..ring_size).map(|_| None).collect(),
        }
    }
}

impl NativeSurface for GbmSurface {
    type Framebuffer = framebuffer::Handle;

    fn ring_size(&self) -> usize {
        self.buffers.len()
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn allocate(&mut self, slot: usize) -> Result<BufferInfo, SurfaceError> {
        let allocation_error = |reason: String| SurfaceError::Allocation { slot, reason };
        let entry = self
            .buffers
            .get_mut(slot)
            .ok_or_else(|| allocation_error("no such slot".into()))?;

        if entry.is_none() {
            let buffer = self
                .allocator
                .create_buffer(
                    self.size.0,
                    self.size.1,
                    Fourcc::Xrgb8888,
                    &[Modifier::Invalid],
                )
                .map_err(|err| allocation_error(err.to_string()))?;
            let dmabuf = buffer
                .export()
                .map_err(|err| allocation_error(err.to_string()))?;
            debug!(slot, size = ?self.size, "Allocated scanout buffer.");
            *entry = Some((buffer, dmabuf));
        }

        let Some((buffer, _)) = entry.as_ref() else {
            return Err(allocation_error("allocation vanished".into()));
        };
        let (width, height) = DrmBuffer::size(&**buffer);
        Ok(BufferInfo {
            width,
            height,
            pitch: DrmBuffer::pitch(&**buffer),
        })
    }

    fn register_framebuffer(
        &mut self,
        slot: usize,
    ) -> io::Result<CachedFramebuffer<framebuffer::Handle>> {
        let Some(Some((buffer, _))) = self.buffers.get(slot) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("buffer {} is not allocated", slot),
            ));
        };
        let handle = self.fd.add_framebuffer(&**buffer, 24, 32)?;
        trace!(slot, ?handle, "Registered framebuffer.");

        let fd = self.fd.clone();
        Ok(CachedFramebuffer::new(handle, move |handle| {
            if let Err(err) = fd.destroy_framebuffer(handle) {
                warn!(?err, ?handle, "Failed to destroy framebuffer.");
            }
        }))
    }

    fn destroy(&mut self, slot: usize) {
        if let Some(entry) = self.buffers.get_mut(slot) {
            if entry.take().is_some() {
                debug!(slot, "Freed scanout buffer.");
            }
        }
    }
}

impl DmabufSurface for GbmSurface {
    fn dmabuf(&self, slot: usize) -> Option<Dmabuf> {
        self.buffers
            .get(slot)
            .and_then(Option::as_ref)
            .map(|(_, dmabuf)| dmabuf.clone())
    }
}

#[derive(Debug, Clone, Copy)]
struct AtomicProps {
    plane: plane::Handle,
    conn_crtc_id: property::Handle,
    crtc_active: property::Handle,
    crtc_mode_id: property::Handle,
    plane_fb_id: property::Handle,
    plane_crtc_id: property::Handle,
    plane_src: [property::Handle; 4],
    plane_crtc: [property::Handle; 4],
}

impl AtomicProps {
    fn lookup(fd: &DrmDeviceFd, output: &OutputSelection) -> Result<AtomicProps> {
        let plane = primary_plane(fd, output.crtc)?;
        Ok(AtomicProps {
            plane,
            conn_crtc_id: get_prop(fd, output.connector, "CRTC_ID")?,
            crtc_active: get_prop(fd, output.crtc, "ACTIVE")?,
            crtc_mode_id: get_prop(fd, output.crtc, "MODE_ID")?,
            plane_fb_id: get_prop(fd, plane, "FB_ID")?,
            plane_crtc_id: get_prop(fd, plane, "CRTC_ID")?,
            plane_src: [
                get_prop(fd, plane, "SRC_X")?,
                get_prop(fd, plane, "SRC_Y")?,
                get_prop(fd, plane, "SRC_W")?,
                get_prop(fd, plane, "SRC_H")?,
            ],
            plane_crtc: [
                get_prop(fd, plane, "CRTC_X")?,
                get_prop(fd, plane, "CRTC_Y")?,
                get_prop(fd, plane, "CRTC_W")?,
                get_prop(fd, plane, "CRTC_H")?,
            ],
        })
    }
}

/// The CRTC playback is scanned out on.
pub struct DisplayTarget {
    fd: DrmDeviceFd,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    atomic: Option<AtomicProps>,
    vsync: bool,
    saved: Option<crtc::Info>,
}

impl std::fmt::Debug for DisplayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayTarget")
            .field("connector", &self.connector)
            .field("crtc", &self.crtc)
            .field("mode", &self.mode)
            .field("atomic", &self.atomic.is_some())
            .field("vsync", &self.vsync)
            .finish_non_exhaustive()
    }
}

impl DisplayTarget {
    /// Remembers the current CRTC state, so it can be put back on shutdown.
    ///
    /// Atomic commits are only used if `atomic` is set and every needed property exists.
    pub fn new(
        fd: DrmDeviceFd,
        output: &OutputSelection,
        atomic: bool,
        vsync: bool,
    ) -> DisplayTarget {
        let atomic = atomic
            .then(|| match AtomicProps::lookup(&fd, output) {
                Ok(props) => Some(props),
                Err(err) => {
                    warn!(?err, "Missing atomic properties, using legacy commits.");
                    None
                }
            })
            .flatten();
        let saved = match fd.get_crtc(output.crtc) {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(?err, crtc = ?output.crtc, "Failed to read current crtc state.");
                None
            }
        };
        info!(
            output = %output.name,
            atomic = atomic.is_some(),
            vsync,
            "Using display."
        );

        DisplayTarget {
            fd,
            connector: output.connector,
            crtc: output.crtc,
            mode: output.mode,
            atomic,
            vsync,
            saved,
        }
    }

    fn atomic_flags(&self) -> AtomicCommitFlags {
        let mut flags = AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK;
        if !self.vsync {
            flags |= AtomicCommitFlags::PAGE_FLIP_ASYNC;
        }
        flags
    }

    fn plane_request(&self, props: &AtomicProps, framebuffer: framebuffer::Handle) -> AtomicModeReq {
        let (w, h) = self.mode.size();
        let (w, h) = (w as u64, h as u64);

        let mut req = AtomicModeReq::new();
        req.add_property(
            props.plane,
            props.plane_fb_id,
            property::Value::Framebuffer(Some(framebuffer)),
        );
        req.add_property(
            props.plane,
            props.plane_crtc_id,
            property::Value::CRTC(Some(self.crtc)),
        );
        // source rectangle is in 16.16 fixed point
        for (prop, value) in props.plane_src.iter().zip([0, 0, w << 16, h << 16]) {
            req.add_property(props.plane, *prop, property::Value::UnsignedRange(value));
        }
        req.add_property(props.plane, props.plane_crtc[0], property::Value::SignedRange(0));
        req.add_property(props.plane, props.plane_crtc[1], property::Value::SignedRange(0));
        req.add_property(props.plane, props.plane_crtc[2], property::Value::UnsignedRange(w));
        req.add_property(props.plane, props.plane_crtc[3], property::Value::UnsignedRange(h));
        req
    }
}

impl Scanout for DisplayTarget {
    type Framebuffer = framebuffer::Handle;

    fn supports_atomic(&self) -> bool {
        self.atomic.is_some()
    }

    fn commit_modeset(
        &mut self,
        framebuffer: framebuffer::Handle,
    ) -> Result<CompletionMode, CommitError> {
        match self.atomic {
            Some(props) => {
                let blob = self.fd.create_property_blob(&self.mode)?;
                let mut req = self.plane_request(&props, framebuffer);
                req.add_property(
                    self.connector,
                    props.conn_crtc_id,
                    property::Value::CRTC(Some(self.crtc)),
                );
                req.add_property(self.crtc, props.crtc_mode_id, blob);
                req.add_property(self.crtc, props.crtc_active, property::Value::Boolean(true));
                self.fd.atomic_commit(
                    AtomicCommitFlags::ALLOW_MODESET
                        | AtomicCommitFlags::PAGE_FLIP_EVENT
                        | AtomicCommitFlags::NONBLOCK,
                    req,
                )?;
                Ok(CompletionMode::Event)
            }
            None => {
                self.fd.set_crtc(
                    self.crtc,
                    Some(framebuffer),
                    (0, 0),
                    &[self.connector],
                    Some(self.mode),
                )?;
                Ok(CompletionMode::Immediate)
            }
        }
    }

    fn commit_flip(&mut self, framebuffer: framebuffer::Handle) -> Result<(), CommitError> {
        profiling::scope!("DisplayTarget::commit_flip");
        match self.atomic {
            Some(props) => {
                let req = self.plane_request(&props, framebuffer);
                self.fd.atomic_commit(self.atomic_flags(), req)?;
            }
            None => {
                let mut flags = PageFlipFlags::EVENT;
                if !self.vsync {
                    flags |= PageFlipFlags::ASYNC;
                }
                self.fd.page_flip(self.crtc, framebuffer, flags, None)?;
            }
        }
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        match rustix::event::poll(&mut fds, poll_timeout_ms(timeout)) {
            Ok(ready) => Ok(ready > 0),
            Err(rustix::io::Errno::INTR) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn read_completions(&mut self) -> io::Result<usize> {
        let events = match self.fd.receive_events() {
            Ok(events) => events,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut completions = 0;
        for event in events {
            match event {
                Event::PageFlip(event) if event.crtc == self.crtc => completions += 1,
                Event::PageFlip(event) => trace!(crtc = ?event.crtc, "Flip on foreign crtc."),
                _ => {}
            }
        }
        Ok(completions)
    }

    fn restore(&mut self) -> Result<(), CommitError> {
        match self.saved.as_ref() {
            Some(saved) if saved.mode().is_some() => {
                self.fd.set_crtc(
                    self.crtc,
                    saved.framebuffer(),
                    saved.position(),
                    &[self.connector],
                    saved.mode(),
                )?;
                info!("Restored previous display mode.");
            }
            _ => {
                self.fd.set_crtc(self.crtc, None, (0, 0), &[], None)?;
                debug!("Disabled crtc.");
            }
        }
        Ok(())
    }
}

/// Milliseconds to pass to poll, rounded up so short waits do not turn into busy loops.
fn poll_timeout_ms(timeout: Duration) -> i32 {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    i32::try_from(ms).unwrap_or(i32::MAX)
}

pub fn output_surface(
    gbm: GbmDevice<DrmDeviceFd>,
    fd: DrmDeviceFd,
    output: &OutputSelection,
    ring_size: usize,
) -> Result<GbmSurface> {
    let size = output.size();
    if size.0 == 0 || size.1 == 0 {
        anyhow::bail!("Mode {:?} of {} has no area", output.mode, output.name);
    }
    let mut surface = GbmSurface::new(gbm, fd, size, ring_size);
    // allocating one buffer up front catches unusable devices before playback starts
    surface
        .allocate(0)
        .with_context(|| format!("Failed to allocate scanout buffers for {}", output.name))?;
    Ok(surface)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn poll_timeouts_round_up() {
        assert_eq!(poll_timeout_ms(Duration::ZERO), 0);
        assert_eq!(poll_timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(poll_timeout_ms(Duration::from_millis(16)), 16);
        assert_eq!(poll_timeout_ms(Duration::from_micros(16_001)), 17);
        assert_eq!(poll_timeout_ms(Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
