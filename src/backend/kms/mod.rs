// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use smithay::backend::{drm::DrmDeviceFd, renderer::gles::GlesRenderer};
use std::{path::Path, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    backend::render::GlesCompositor,
    config::Config,
    pipeline::{present::PresentationEngine, Pipeline},
};

pub mod device;
pub mod drm_helpers;
pub mod surface;

use device::Device;
use drm_helpers::{select_output, OutputSelection};
use surface::{DisplayTarget, GbmSurface};

pub type KmsPipeline = Pipeline<GbmSurface, DisplayTarget, GlesCompositor>;

/// Everything needed to drive one display through DRM.
pub struct KmsBackend {
    pub surface: GbmSurface,
    pub display: DisplayTarget,
    pub compositor: GlesCompositor,
    pub output: OutputSelection,
    /// Becomes readable when page flip events arrive.
    pub events: DrmDeviceFd,
    pub device: Device,
}

impl KmsBackend {
    pub fn size(&self) -> (u32, u32) {
        self.output.size()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.output.refresh_interval()
    }
}

fn open_with_output(path: &Path, atomic: bool) -> Result<(Device, OutputSelection)> {
    let device = Device::open(path, atomic)?;
    let output = select_output(&device.fd)
        .with_context(|| format!("Failed to find an output on {}", path.display()))?;
    Ok((device, output))
}

fn find_device(config: &Config) -> Result<(Device, OutputSelection)> {
    if let Some(path) = config.device.as_deref() {
        return open_with_output(path, config.atomic);
    }

    for path in device::card_nodes() {
        match open_with_output(&path, config.atomic) {
            Ok(found) => return Ok(found),
            Err(err) => debug!(?err, path = %path.display(), "Skipping drm device."),
        }
    }
    anyhow::bail!("No drm device with a connected display found")
}

pub fn init_backend(config: &Config) -> Result<KmsBackend> {
    let (device, output) = find_device(config)?;
    if !device.is_master() {
        warn!("Not DRM master, frames will be rendered but not shown.");
    }

    let egl = device.init_egl()?;
    debug!(device = ?egl.device, "Initialized EGL.");
    let renderer =
        unsafe { GlesRenderer::new(egl.context) }.with_context(|| "Failed to create renderer")?;
    let compositor = GlesCompositor::new(renderer);

    let ring_size = PresentationEngine::<DisplayTarget>::required_ring_size(config.pipeline.triple_buffering);
    let surface = surface::output_surface(device.gbm.clone(), device.fd.clone(), &output, ring_size)?;
    let display = DisplayTarget::new(
        device.fd.clone(),
        &output,
        device.supports_atomic(),
        config.vsync,
    );

    info!(
        output = %output.name,
        size = ?output.size(),
        refresh = ?output.refresh_interval(),
        ring_size,
        "Initialized kms backend."
    );
    Ok(KmsBackend {
        surface,
        display,
        compositor,
        events: device.fd.clone(),
        output,
        device,
    })
}
