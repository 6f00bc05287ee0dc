use rand::prelude::IndexedRandom;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix that marks a file as an identity endpoint configuration.
const CONFIG_EXTENSION: &str = "ovpn";

/// Opaque descriptor of one network exit point: a single endpoint
/// configuration file on disk. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    path: PathBuf,
}

impl IdentityConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the configuration, used for logging and ordering.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("<non-utf8>")
    }
}

#[derive(Debug)]
pub enum ConfigStoreError {
    /// The configuration directory is missing or holds no endpoint files.
    NoConfigsAvailable { dir: PathBuf },
    Io { dir: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigStoreError::NoConfigsAvailable { dir } => {
                write!(
                    f,
                    "no identity endpoint configurations available in {}",
                    dir.display()
                )
            }
            ConfigStoreError::Io { dir, source } => {
                write!(
                    f,
                    "failed to enumerate identity configurations in {}: {source}",
                    dir.display()
                )
            }
        }
    }
}

impl std::error::Error for ConfigStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigStoreError::Io { source, .. } => Some(source),
            ConfigStoreError::NoConfigsAvailable { .. } => None,
        }
    }
}

/// Enumerates the identity endpoint configurations available on disk.
///
/// The directory is re-read on every call so a changed snapshot is picked up
/// without restarting; ordering is lexicographic by file name so
/// [`ConfigStore::pick_next`] is deterministic for a fixed snapshot.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns every endpoint configuration, sorted by file name.
    pub fn list(&self) -> Result<Vec<IdentityConfig>, ConfigStoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigStoreError::NoConfigsAvailable {
                    dir: self.dir.clone(),
                });
            }
            Err(err) => {
                return Err(ConfigStoreError::Io {
                    dir: self.dir.clone(),
                    source: err,
                });
            }
        };

        let mut configs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ConfigStoreError::Io {
                dir: self.dir.clone(),
                source: err,
            })?;
            let path = entry.path();
            let is_config = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(CONFIG_EXTENSION));
            if is_config && path.is_file() {
                configs.push(IdentityConfig { path });
            }
        }

        if configs.is_empty() {
            return Err(ConfigStoreError::NoConfigsAvailable {
                dir: self.dir.clone(),
            });
        }

        configs.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(configs)
    }

    pub fn pick_random(&self) -> Result<IdentityConfig, ConfigStoreError> {
        let configs = self.list()?;
        self.choose_from(&configs)
    }

    /// Returns the configuration immediately after `current` in the
    /// enumerated ordering, wrapping to the first. Falls back to a random
    /// pick when `current` is absent or no longer in the snapshot.
    pub fn pick_next(
        &self,
        current: Option<&IdentityConfig>,
    ) -> Result<IdentityConfig, ConfigStoreError> {
        let configs = self.list()?;

        if let Some(current) = current {
            if let Some(index) = configs.iter().position(|config| config == current) {
                let next = (index + 1) % configs.len();
                return Ok(configs[next].clone());
            }
        }

        self.choose_from(&configs)
    }

    fn choose_from(
        &self,
        configs: &[IdentityConfig],
    ) -> Result<IdentityConfig, ConfigStoreError> {
        configs
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| ConfigStoreError::NoConfigsAvailable {
                dir: self.dir.clone(),
            })
    }
}
