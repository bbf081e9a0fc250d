// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{self, ErrorKind},
    path::Path,
};

use tracing::{debug, warn};

pub mod keystone;

pub use keystone::{CornerPosition, KeystoneConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] ron::Error),
}

impl KeystoneConfig {
    /// Reads the config at `path`, returning `Ok(None)` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<KeystoneConfig>, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(ron::from_str(&content)?))
    }

    /// Like [`KeystoneConfig::load`], but never fails.
    pub fn load_or_default(path: &Path) -> KeystoneConfig {
        match KeystoneConfig::load(path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(?path, "No keystone config found, using defaults.");
                KeystoneConfig::default()
            }
            Err(err) => {
                warn!(?err, ?path, "Failed to read keystone config, using defaults.");
                KeystoneConfig::default()
            }
        }
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        let mut content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        content.push('\n');
        Ok(content)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_ron()?)?;
        Ok(())
    }
}
