use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("Io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Blob of {len} bytes exceeds the maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },
}

impl PersistenceError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Durable home of the fusion engine's calibration state and static
/// configuration. Both are opaque byte blobs at this layer.
pub trait StateStore {
    /// Previously saved state. Empty when none exists or it can not be
    /// trusted, which means "start uncalibrated". Never fails.
    fn load_state(&mut self, max_len: usize) -> Vec<u8>;
    /// Replaces any prior snapshot entirely.
    fn save_state(&mut self, state: &[u8]) -> Result<(), PersistenceError>;
    fn load_config(&mut self, max_len: usize) -> Result<Vec<u8>, PersistenceError>;
}

#[derive(Debug, Clone, Default)]
pub enum ConfigSource {
    /// The engine runs with its built-in configuration
    #[default]
    None,
    /// Compiled into the binary
    Embedded(&'static [u8]),
    File(PathBuf),
}

/// Keeps the state in a single file. Saves go to a sibling temporary
/// file that is renamed over the previous state so a crash mid-write
/// never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    state_path: PathBuf,
    config: ConfigSource,
}

impl FileStore {
    pub fn new(state_path: impl Into<PathBuf>, config: ConfigSource) -> Self {
        Self {
            state_path: state_path.into(),
            config,
        }
    }

    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .state_path
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        name.push(".tmp");
        self.state_path.with_file_name(name)
    }

    fn try_load_state(&self, max_len: usize) -> Result<Vec<u8>, PersistenceError> {
        let path = &self.state_path;
        let state = match fs::read(path) {
            Ok(state) => state,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(path)(e)),
        };

        if state.len() > max_len {
            return Err(PersistenceError::TooLarge {
                len: state.len(),
                max: max_len,
            });
        }
        Ok(state)
    }

    fn write_atomic(&self, data: &[u8]) -> Result<(), PersistenceError> {
        if let Some(dir) = self.state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(PersistenceError::io(dir))?;
        }

        let temp = self.temp_path();
        let res = write_synced(&temp, data).and_then(|()| {
            fs::rename(&temp, &self.state_path).map_err(PersistenceError::io(&self.state_path))
        });
        if res.is_err() {
            if let Err(e) = fs::remove_file(&temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {e}", temp.display());
                }
            }
            return res;
        }

        // the rename is only durable once the directory entry is
        if let Some(dir) = self.state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::File::open(dir).and_then(|dir| dir.sync_all()) {
                debug!("could not sync {}: {e}", dir.display());
            }
        }
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let mut file = fs::File::create(path).map_err(PersistenceError::io(path))?;
    file.write_all(data).map_err(PersistenceError::io(path))?;
    file.sync_all().map_err(PersistenceError::io(path))
}

impl StateStore for FileStore {
    fn load_state(&mut self, max_len: usize) -> Vec<u8> {
        match self.try_load_state(max_len) {
            Ok(state) if state.is_empty() => {
                info!("no saved sensor state, starting uncalibrated");
                state
            }
            Ok(state) => {
                info!("loaded sensor state ({} bytes)", state.len());
                state
            }
            Err(err) => {
                warn!(
                    "Ignoring saved sensor state at {}, starting uncalibrated. \
                    Error: {err}",
                    self.state_path.display()
                );
                Vec::new()
            }
        }
    }

    fn save_state(&mut self, state: &[u8]) -> Result<(), PersistenceError> {
        self.write_atomic(state)?;
        debug!("saved sensor state ({} bytes)", state.len());
        Ok(())
    }

    fn load_config(&mut self, max_len: usize) -> Result<Vec<u8>, PersistenceError> {
        let config = match &self.config {
            ConfigSource::None => Vec::new(),
            ConfigSource::Embedded(bytes) => bytes.to_vec(),
            ConfigSource::File(path) => fs::read(path).map_err(PersistenceError::io(path))?,
        };

        if config.len() > max_len {
            return Err(PersistenceError::TooLarge {
                len: config.len(),
                max: max_len,
            });
        }
        Ok(config)
    }
}
