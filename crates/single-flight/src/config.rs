use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::lock::LockBackend;

/// An error loading a [`SelectorConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error("failed reading config file")]
    Io(#[from] io::Error),
    /// The file contains nothing but whitespace.
    #[error("config file empty")]
    Empty,
    /// The file is not valid YAML, or does not match the expected structure.
    #[error("failed to parse config YAML")]
    Parse(#[from] serde_yaml::Error),
    /// The config tries to disable the [`LockBackend::Thread`] fallback.
    #[error("the `thread` lock backend is the fallback and cannot be disabled")]
    FallbackDisabled,
}

/// Controls which lock backends a [`LockSelector`](crate::LockSelector) may choose.
///
/// ```yaml
/// disabled:
///   - tokio
///   - async-lock
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Backends that are skipped during selection, regardless of availability.
    pub disabled: BTreeSet<LockBackend>,
}

impl SelectorConfig {
    /// Loads the config from `path`, or returns the default config if no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_reader(fs::File::open(path)?),
            None => Ok(SelectorConfig::default()),
        }
    }

    /// Parses a YAML config from `reader`.
    pub fn from_reader(mut reader: impl io::Read) -> Result<Self, ConfigError> {
        let mut config = String::new();
        reader.read_to_string(&mut config)?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        let config: Self = serde_yaml::from_str(&config)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns `true` if `backend` must be skipped.
    pub fn is_disabled(&self, backend: LockBackend) -> bool {
        self.disabled.contains(&backend)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.is_disabled(LockBackend::Thread) {
            return Err(ConfigError::FallbackDisabled);
        }
        Ok(())
    }
}
