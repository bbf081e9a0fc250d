// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use std::{io::Stdin, path::PathBuf, time::Instant};
use tracing::{error, info, warn};
use warpplay_config::KeystoneConfig;

use crate::{
    backend::{kms, DisplayEvents, HeadlessPipeline},
    config::Config,
    decoder::WakeupFlag,
    input::{Action, RawTerminal},
    keystone::KeystoneState,
    pipeline::{FinishReason, Flow, PipelineError, Player},
};

pub enum BackendData {
    Kms {
        pipeline: Box<kms::KmsPipeline>,
        // released after the pipeline restored the display
        device: kms::device::Device,
    },
    Headless(Box<HeadlessPipeline>),
}

impl BackendData {
    pub fn player(&mut self) -> &mut dyn Player {
        match self {
            BackendData::Kms { pipeline, .. } => pipeline.as_mut(),
            BackendData::Headless(pipeline) => pipeline.as_mut(),
        }
    }

    pub fn player_ref(&self) -> &dyn Player {
        match self {
            BackendData::Kms { pipeline, .. } => pipeline.as_ref(),
            BackendData::Headless(pipeline) => pipeline.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendData::Kms { .. } => "kms",
            BackendData::Headless(_) => "headless",
        }
    }
}

/// Why the event loop stopped.
#[derive(Debug)]
pub enum Exit {
    Finished(FinishReason),
    Quit,
    Failed(PipelineError),
}

impl Exit {
    pub fn code(&self) -> i32 {
        match self {
            Exit::Finished(_) | Exit::Quit => 0,
            Exit::Failed(err) => err.exit_code(),
        }
    }
}

pub struct State {
    pub backend: BackendData,
    pub terminal: Option<RawTerminal<Stdin>>,
    pub keystone_path: Option<PathBuf>,
    pub exit: Option<Exit>,
}

impl State {
    pub fn new(config: &Config, wakeup: WakeupFlag) -> Result<(State, DisplayEvents)> {
        let keystone_path = config.keystone_config_path();
        let keystone = match keystone_path.as_deref() {
            Some(path) => KeystoneState::from(&KeystoneConfig::load_or_default(path)),
            None => KeystoneState::default(),
        };
        let (backend, events) = crate::backend::init_backend_auto(config, keystone, wakeup)?;
        info!(backend = backend.name(), "Backend initialized.");

        Ok((
            State {
                backend,
                terminal: None,
                keystone_path,
                exit: None,
            },
            events,
        ))
    }

    pub fn should_stop(&self) -> bool {
        self.exit.is_some()
    }

    fn finish(&mut self, exit: Exit) {
        if self.exit.is_none() {
            self.exit = Some(exit);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        if self.should_stop() {
            return;
        }
        match self.backend.player().tick(now) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Finished(reason)) => {
                info!(?reason, "Reached end of playback.");
                self.finish(Exit::Finished(reason));
            }
            Err(err) => {
                error!(?err, "Playback failed.");
                self.finish(Exit::Failed(err));
            }
        }
    }

    pub fn display_readable(&mut self, now: Instant) {
        if self.should_stop() {
            return;
        }
        if let Err(err) = self.backend.player().on_display_readable(now) {
            error!(?err, "Presentation failed.");
            self.finish(Exit::Failed(err));
        }
    }

    pub fn terminal_readable(&mut self, now: Instant) {
        let Some(terminal) = self.terminal.as_ref() else {
            return;
        };
        match terminal.read_actions() {
            Ok(actions) => {
                for action in actions {
                    self.handle_action(action, now);
                }
            }
            Err(err) => {
                warn!(?err, "Failed to read from terminal, disabling keyboard control.");
                self.terminal = None;
            }
        }
    }

    pub fn handle_action(&mut self, action: Action, now: Instant) {
        match action {
            Action::Keystone(command) => self.backend.player().apply_keystone(command),
            Action::SaveKeystone => self.save_keystone(),
            Action::LoadKeystone => self.load_keystone(),
            Action::TogglePause => self.backend.player().toggle_pause(now),
            Action::Quit => {
                info!("Quit requested.");
                self.finish(Exit::Quit);
            }
        }
    }

    pub fn save_keystone(&mut self) {
        let Some(path) = self.keystone_path.as_deref() else {
            warn!("No config directory, cannot save keystone settings.");
            return;
        };
        let config = KeystoneConfig::from(self.backend.player_ref().keystone());
        match config.save(path) {
            Ok(()) => info!(?path, "Saved keystone settings."),
            Err(err) => warn!(?err, ?path, "Failed to save keystone settings."),
        }
    }

    pub fn load_keystone(&mut self) {
        let Some(path) = self.keystone_path.as_deref() else {
            warn!("No config directory, cannot load keystone settings.");
            return;
        };
        let config = KeystoneConfig::load_or_default(path);
        self.backend
            .player()
            .set_keystone(KeystoneState::from(&config));
        info!(?path, "Loaded keystone settings.");
    }

    /// Tears playback down, putting the display back the way we found it.
    pub fn shutdown(&mut self) {
        self.backend.player().shutdown();
        if let Some(exit) = self.exit.as_ref() {
            info!(?exit, code = exit.code(), "Shut down.");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::headless,
        decoder::DecoderLadder,
        keystone::{Corner, KeystoneCommand},
        pipeline::{
            present::PresentationEngine, swapchain::SwapChain, Pipeline, PipelineOptions,
        },
    };
    use std::time::Duration;

    fn headless_state(keystone_path: Option<PathBuf>) -> State {
        let (surface, display, compositor) =
            headless::create((32, 18), 3, Duration::ZERO);
        let wakeup = WakeupFlag::default();
        let decoders = DecoderLadder::from_kinds(
            &[crate::decoder::DecoderKind::Pattern],
            None,
            (32, 18),
            &wakeup,
        );
        let options = PipelineOptions {
            frame_limit: Some(3),
            ..Default::default()
        };
        let pipeline = Pipeline::new(
            SwapChain::new(surface),
            PresentationEngine::new(display, false),
            compositor,
            decoders,
            KeystoneState::default(),
            wakeup,
            options,
            Instant::now(),
        )
        .unwrap();
        State {
            backend: BackendData::Headless(Box::new(pipeline)),
            terminal: None,
            keystone_path,
            exit: None,
        }
    }

    #[test]
    fn keystone_settings_survive_save_and_load() {
        let dir = std::env::temp_dir().join(format!("warpplay-state-{}", std::process::id()));
        let path = dir.join("keystone.ron");
        let mut state = headless_state(Some(path.clone()));
        let now = Instant::now();

        state.handle_action(Action::Keystone(KeystoneCommand::Toggle), now);
        state.handle_action(
            Action::Keystone(KeystoneCommand::Select(Corner::TopRight)),
            now,
        );
        state.handle_action(Action::Keystone(KeystoneCommand::Reset), now);
        state.handle_action(Action::SaveKeystone, now);
        let saved = KeystoneConfig::from(state.backend.player_ref().keystone());

        state.handle_action(Action::Keystone(KeystoneCommand::Toggle), now);
        assert!(!state.backend.player_ref().keystone().enabled());
        state.handle_action(Action::LoadKeystone, now);
        assert!(state.backend.player_ref().keystone().enabled());
        assert_eq!(KeystoneConfig::from(state.backend.player_ref().keystone()), saved);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn quit_and_limits_map_to_exit_codes() {
        let mut state = headless_state(None);
        state.handle_action(Action::Quit, Instant::now());
        assert!(matches!(state.exit, Some(Exit::Quit)));
        assert_eq!(state.exit.as_ref().map(Exit::code), Some(0));

        let mut state = headless_state(None);
        let mut now = Instant::now();
        for _ in 0..200 {
            if state.should_stop() {
                break;
            }
            now += Duration::from_millis(40);
            state.tick(now);
            state.display_readable(now);
        }
        assert!(matches!(
            state.exit,
            Some(Exit::Finished(FinishReason::FrameLimit))
        ));
        state.shutdown();

        let stalled = Exit::Failed(PipelineError::StallExhausted { attempts: 3 });
        assert_eq!(stalled.code(), 2);
    }
}
