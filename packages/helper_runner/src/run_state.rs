use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted "was running" flag, used to tell whether the previous run
/// shut down cleanly.
pub trait RunStateStore: Send + Sync + 'static {
    fn load(&self) -> Result<bool, RunStateError>;

    fn store(&self, running: bool) -> Result<(), RunStateError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RunStateFile {
    running: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    path: PathBuf,
}

impl FileRunStateStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileRunStateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunStateStore for FileRunStateStore {
    fn load(&self) -> Result<bool, RunStateError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => return Err(RunStateError::Io(error)),
        };

        let state: RunStateFile = toml::from_str(&data).map_err(RunStateError::Parse)?;
        Ok(state.running)
    }

    fn store(&self, running: bool) -> Result<(), RunStateError> {
        let state = RunStateFile {
            running,
            updated_at: Utc::now(),
        };
        let data = toml::to_string(&state).map_err(RunStateError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(RunStateError::Io)?;
        }
        std::fs::write(&self.path, data).map_err(RunStateError::Io)
    }
}

#[derive(Debug)]
pub enum RunStateError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for RunStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStateError::Io(e) => write!(f, "run state IO error: {}", e),
            RunStateError::Parse(e) => write!(f, "failed to parse run state: {}", e),
            RunStateError::Serialize(e) => write!(f, "failed to serialize run state: {}", e),
        }
    }
}

impl std::error::Error for RunStateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunStateError::Io(e) => Some(e),
            RunStateError::Parse(e) => Some(e),
            RunStateError::Serialize(e) => Some(e),
        }
    }
}
