// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use smithay::backend::drm::DrmDeviceFd;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{
    config::{BackendChoice, Config},
    decoder::{DecoderLadder, WakeupFlag},
    keystone::KeystoneState,
    pipeline::{present::PresentationEngine, swapchain::SwapChain, Pipeline},
    state::BackendData,
};

pub mod headless;
pub mod kms;
pub mod render;

pub type HeadlessPipeline =
    Pipeline<headless::MemorySurface, headless::VirtualScanout, headless::SoftwareCompositor>;

/// Where completion events of the display come from.
#[derive(Debug)]
pub enum DisplayEvents {
    /// The drm fd turns readable on page flip events.
    Drm(DrmDeviceFd),
    /// Completions are polled once per refresh interval.
    Vblank(Duration),
}

pub fn init_backend_auto(
    config: &Config,
    keystone: KeystoneState,
    wakeup: WakeupFlag,
) -> Result<(BackendData, DisplayEvents)> {
    match config.backend {
        BackendChoice::Kms => init_kms(config, keystone, wakeup),
        BackendChoice::Headless => init_headless(config, keystone, wakeup),
        BackendChoice::Auto => match kms::init_backend(config) {
            Ok(backend) => kms_pipeline(config, backend, keystone, wakeup),
            Err(err) => {
                warn!(?err, "Initializing KMS backend failed.");
                info!("Falling back to headless backend.");
                init_headless(config, keystone, wakeup)
            }
        },
    }
}

fn init_kms(
    config: &Config,
    keystone: KeystoneState,
    wakeup: WakeupFlag,
) -> Result<(BackendData, DisplayEvents)> {
    let backend = kms::init_backend(config)?;
    kms_pipeline(config, backend, keystone, wakeup)
}

fn kms_pipeline(
    config: &Config,
    backend: kms::KmsBackend,
    keystone: KeystoneState,
    wakeup: WakeupFlag,
) -> Result<(BackendData, DisplayEvents)> {
    let decoders = DecoderLadder::from_kinds(
        &config.decoder_ladder(),
        config.input.clone(),
        backend.size(),
        &wakeup,
    );
    let presenter = PresentationEngine::new(backend.display, config.pipeline.triple_buffering);
    let pipeline = Pipeline::new(
        SwapChain::new(backend.surface),
        presenter,
        backend.compositor,
        decoders,
        keystone,
        wakeup,
        config.pipeline.clone(),
        Instant::now(),
    )
    .with_context(|| "Failed to start playback")?;

    Ok((
        BackendData::Kms {
            pipeline: Box::new(pipeline),
            device: backend.device,
        },
        DisplayEvents::Drm(backend.events),
    ))
}

fn init_headless(
    config: &Config,
    keystone: KeystoneState,
    wakeup: WakeupFlag,
) -> Result<(BackendData, DisplayEvents)> {
    let triple_buffering = config.pipeline.triple_buffering;
    let ring_size =
        PresentationEngine::<headless::VirtualScanout>::required_ring_size(triple_buffering);
    let (surface, display, compositor) =
        headless::create(headless::DEFAULT_SIZE, ring_size, headless::DEFAULT_REFRESH);

    let decoders = DecoderLadder::from_kinds(
        &config.decoder_ladder(),
        config.input.clone(),
        headless::DEFAULT_SIZE,
        &wakeup,
    );
    let pipeline = Pipeline::new(
        SwapChain::new(surface),
        PresentationEngine::new(display, triple_buffering),
        compositor,
        decoders,
        keystone,
        wakeup,
        config.pipeline.clone(),
        Instant::now(),
    )
    .with_context(|| "Failed to start playback")?;

    Ok((
        BackendData::Headless(Box::new(pipeline)),
        DisplayEvents::Vblank(headless::DEFAULT_REFRESH),
    ))
}
