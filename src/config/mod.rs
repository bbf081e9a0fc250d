// SPDX-License-Identifier: GPL-3.0-only

//! Runtime configuration, assembled from the command line and the environment.

use clap_lex::RawArgs;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::{
    decoder::DecoderKind,
    pipeline::{pacing::HIGH_PERFORMANCE_TARGET_FPS, PipelineOptions},
    utils::env::parse_bool,
};

pub const DEFAULT_DECODERS: &str = "y4m,pattern";
pub const KEYSTONE_CONFIG_FILE: &str = "warpplay/keystone.ron";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// KMS, or headless if no display can be driven.
    #[default]
    Auto,
    Kms,
    Headless,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub input: Option<PathBuf>,
    pub backend: BackendChoice,
    pub device: Option<PathBuf>,
    pub keystone_config: Option<PathBuf>,
    pub vsync: bool,
    pub high_performance: bool,
    pub atomic: bool,
    pub decoders: Vec<DecoderKind>,
    pub pipeline: PipelineOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: None,
            backend: BackendChoice::Auto,
            device: None,
            keystone_config: None,
            vsync: true,
            high_performance: false,
            atomic: false,
            decoders: DecoderKind::parse_list(DEFAULT_DECODERS),
            pipeline: PipelineOptions::default(),
        }
    }
}

/// What the command line asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play(Config),
    Help,
    Version,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("Unknown option '{0}'")]
    UnknownOption(String),
    #[error("Option '{0}' needs a value")]
    MissingValue(&'static str),
    #[error("Invalid value '{value}' for '{option}'")]
    InvalidValue { option: &'static str, value: String },
    #[error("Unexpected argument '{0}', only one input file is supported")]
    UnexpectedArgument(String),
}

impl Config {
    /// Applies the `WARPPLAY_*` variables `lookup` knows about.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = lookup("WARPPLAY_BACKEND") {
            self.backend = match backend.trim().to_lowercase().as_str() {
                "kms" => BackendChoice::Kms,
                "headless" => BackendChoice::Headless,
                "auto" | "" => BackendChoice::Auto,
                other => {
                    warn!(backend = other, "Unknown backend, selecting automatically.");
                    BackendChoice::Auto
                }
            };
        }
        if let Some(atomic) = lookup("WARPPLAY_ATOMIC") {
            self.atomic = parse_bool(&atomic);
        }
        if let Some(zero_copy) = lookup("WARPPLAY_ZERO_COPY") {
            self.pipeline.zero_copy = parse_bool(&zero_copy);
        }
        if let Some(list) = lookup("WARPPLAY_DECODERS") {
            let decoders = DecoderKind::parse_list(&list);
            if decoders.is_empty() {
                warn!(list, "No usable decoder listed, using defaults.");
            } else {
                self.decoders = decoders;
            }
        }
        if let Some(attempts) = lookup("WARPPLAY_MAX_RECOVERY") {
            match attempts.trim().parse() {
                Ok(attempts) => self.pipeline.max_recovery_attempts = attempts,
                Err(err) => warn!(?err, attempts, "Ignoring invalid WARPPLAY_MAX_RECOVERY."),
            }
        }
    }

    /// Parses the command line, `args` including the binary name.
    ///
    /// Options given on the command line win over the environment.
    pub fn parse<I, T>(args: I, lookup: impl Fn(&str) -> Option<String>) -> Result<Command, ArgsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut config = Config::default();
        config.apply_env(lookup);

        let raw = RawArgs::new(args);
        let mut cursor = raw.cursor();
        raw.next(&mut cursor);

        while let Some(arg) = raw.next(&mut cursor) {
            if arg.is_escape() {
                for value in raw.remaining(&mut cursor) {
                    config.set_input(PathBuf::from(value))?;
                }
                break;
            }

            if let Some((long, value)) = arg.to_long() {
                let inline = value.map(|value| value.to_string_lossy().into_owned());
                let mut value = |option: &'static str| {
                    inline
                        .clone()
                        .or_else(|| {
                            raw.next_os(&mut cursor)
                                .map(|value| value.to_string_lossy().into_owned())
                        })
                        .ok_or(ArgsError::MissingValue(option))
                };
                match long {
                    Ok("help") => return Ok(Command::Help),
                    Ok("version") => return Ok(Command::Version),
                    Ok("loop") => config.pipeline.looping = true,
                    Ok("vsync") => config.vsync = true,
                    Ok("no-vsync") => config.vsync = false,
                    Ok("high-performance") => config.high_performance = true,
                    Ok("triple-buffer") => config.pipeline.triple_buffering = true,
                    Ok("headless") => config.backend = BackendChoice::Headless,
                    Ok("device") => config.device = Some(value("--device")?.into()),
                    Ok("keystone-config") => {
                        config.keystone_config = Some(value("--keystone-config")?.into())
                    }
                    Ok("frames") => {
                        let frames = value("--frames")?;
                        let limit = frames.parse().map_err(|_| ArgsError::InvalidValue {
                            option: "--frames",
                            value: frames,
                        })?;
                        config.pipeline.frame_limit = Some(limit);
                    }
                    Ok(other) => return Err(ArgsError::UnknownOption(format!("--{}", other))),
                    Err(other) => {
                        return Err(ArgsError::UnknownOption(
                            other.to_string_lossy().into_owned(),
                        ))
                    }
                }
            } else if let Some(mut shorts) = arg.to_short() {
                while let Some(short) = shorts.next_flag() {
                    match short {
                        Ok('h') => return Ok(Command::Help),
                        Ok('V') => return Ok(Command::Version),
                        Ok('l') => config.pipeline.looping = true,
                        Ok(other) => return Err(ArgsError::UnknownOption(format!("-{}", other))),
                        Err(other) => {
                            return Err(ArgsError::UnknownOption(
                                other.to_string_lossy().into_owned(),
                            ))
                        }
                    }
                }
            } else {
                config.set_input(PathBuf::from(arg.to_value_os()))?;
            }
        }

        if config.high_performance {
            config.vsync = false;
            config.pipeline.triple_buffering = true;
            config.pipeline.target_fps = HIGH_PERFORMANCE_TARGET_FPS;
            config.pipeline.continuous = true;
        }
        Ok(Command::Play(config))
    }

    fn set_input(&mut self, path: PathBuf) -> Result<(), ArgsError> {
        if self.input.is_some() {
            return Err(ArgsError::UnexpectedArgument(
                path.to_string_lossy().into_owned(),
            ));
        }
        self.input = Some(path);
        Ok(())
    }

    /// Where the keystone geometry is saved, `None` if no config directory is known.
    pub fn keystone_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.keystone_config.as_ref() {
            return Some(path.clone());
        }
        let xdg = xdg::BaseDirectories::new().ok()?;
        Some(xdg.get_config_home().join(KEYSTONE_CONFIG_FILE))
    }

    /// The decoder ladder, minus the decoders that need an input file when there is none.
    pub fn decoder_ladder(&self) -> Vec<DecoderKind> {
        let has_input = self.input.as_deref().is_some_and(Path::exists);
        let ladder: Vec<_> = self
            .decoders
            .iter()
            .copied()
            .filter(|kind| has_input || !kind.needs_input())
            .collect();
        if ladder.is_empty() {
            vec![DecoderKind::Pattern]
        } else {
            ladder
        }
    }
}
