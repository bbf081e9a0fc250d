// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use smithay::{
    backend::{
        allocator::gbm::GbmDevice,
        drm::DrmDeviceFd,
        egl::{context::ContextPriority, EGLContext, EGLDevice, EGLDisplay},
    },
    reexports::drm::{ClientCapability, Device as _},
    utils::DeviceFd,
};
use rustix::fs::{self, Mode, OFlags};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub const DRI_DIRECTORY: &str = "/dev/dri";

#[derive(Debug)]
pub struct EGLInternals {
    pub display: EGLDisplay,
    pub device: EGLDevice,
    pub context: EGLContext,
}

pub struct Device {
    pub path: PathBuf,
    pub fd: DrmDeviceFd,
    pub gbm: GbmDevice<DrmDeviceFd>,
    master: bool,
    supports_atomic: bool,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("master", &self.master)
            .field("supports_atomic", &self.supports_atomic)
            .finish()
    }
}

impl Device {
    /// Opens a primary node, taking DRM master if nobody else holds it.
    ///
    /// `atomic` asks for the atomic API, which is only enabled if the driver supports it.
    pub fn open(path: &Path, atomic: bool) -> Result<Device> {
        let owned = fs::open(
            path,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .with_context(|| {
            format!(
                "Failed to optain file descriptor for drm device: {}",
                path.display()
            )
        })?;
        let fd = DrmDeviceFd::new(DeviceFd::from(owned));

        let master = match fd.acquire_master_lock() {
            Ok(()) => true,
            Err(err) => {
                // without master every modeset fails, playback continues without scanout
                warn!(?err, path = %path.display(), "Failed to become DRM master.");
                false
            }
        };

        if let Err(err) = fd.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!(?err, "Universal planes are not supported.");
        }
        let supports_atomic =
            atomic && fd.set_client_capability(ClientCapability::Atomic, true).is_ok();
        if atomic && !supports_atomic {
            warn!("Atomic modesetting requested, but not supported by the driver.");
        }

        let gbm = GbmDevice::new(fd.clone())
            .with_context(|| format!("Failed to initialize GBM device for {}", path.display()))?;

        info!(
            path = %path.display(),
            master,
            atomic = supports_atomic,
            "Opened drm device."
        );
        Ok(Device {
            path: path.to_path_buf(),
            fd,
            gbm,
            master,
            supports_atomic,
        })
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn supports_atomic(&self) -> bool {
        self.supports_atomic
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.master {
            if let Err(err) = self.fd.release_master_lock() {
                warn!(?err, "Failed to release DRM master.");
            }
        }
    }
}

/// Primary nodes, `card0` first.
pub fn card_nodes() -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(DRI_DIRECTORY) else {
        return Vec::new();
    };
    let mut cards: Vec<(u32, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let index = name.to_str()?.strip_prefix("card")?.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    cards.sort();
    cards.into_iter().map(|(_, path)| path).collect()
}

impl Device {
    /// Creates the EGL display and a high priority context on top of the GBM device.
    pub fn init_egl(&self) -> Result<EGLInternals> {
        let path = self.path.display();

        let display = unsafe { EGLDisplay::new(self.gbm.clone()) }
            .with_context(|| format!("Failed to create EGLDisplay for {}", path))?;
        let device = EGLDevice::device_for_display(&display)
            .with_context(|| format!("Unable to find matching egl device for {}", path))?;
        let context = EGLContext::new_with_priority(&display, ContextPriority::High)
            .with_context(|| format!("Failed to create EGLContext for {:?} ({})", device, path))?;

        Ok(EGLInternals {
            display,
            device,
            context,
        })
    }
}
