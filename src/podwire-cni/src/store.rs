//! Endpoint datastore
//!
//! Records are kept one JSON file per endpoint key in a state directory.
//! Every operation runs under an exclusive lock on the directory's lock file
//! and writes go through a temp file plus rename.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

use crate::endpoint::{EndpointKey, WorkloadEndpoint};
use crate::error::{CniError, CniErrorCode};

/// Lock file in the store directory
const LOCK_FILE: &str = ".lock";

/// Datastore outcomes the lifecycle manager branches on
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("endpoint does not exist")]
    NotFound,

    #[error("datastore unreachable: {0}")]
    Unreachable(String),

    #[error("endpoint was modified concurrently")]
    Conflict,

    #[error("stored endpoint is unreadable: {0}")]
    Invalid(String),
}

impl From<StoreError> for CniError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Conflict => CniErrorCode::DatastoreConflict,
            _ => CniErrorCode::DatastoreFailure,
        };
        CniError::new(code, &e.to_string())
    }
}

/// Where endpoint records live
pub trait EndpointStore {
    fn get(&self, key: &EndpointKey) -> Result<WorkloadEndpoint, StoreError>;

    /// Create or replace; returns the record as stored
    fn apply(&self, endpoint: WorkloadEndpoint) -> Result<WorkloadEndpoint, StoreError>;

    /// Delete only if the stored record still equals `expected`
    fn compare_and_delete(&self, expected: &WorkloadEndpoint) -> Result<(), StoreError>;
}

/// Endpoint records on the local filesystem
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, key: &EndpointKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }

    /// Execute a function while holding the store lock
    fn with_lock<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StoreError::Unreachable(format!("failed to create {}: {}", self.dir.display(), e))
        })?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))
            .map_err(|e| StoreError::Unreachable(format!("failed to open lock file: {}", e)))?;

        lock_file
            .lock_exclusive()
            .map_err(|e| StoreError::Unreachable(format!("failed to acquire lock: {}", e)))?;

        let result = f();

        lock_file
            .unlock()
            .map_err(|e| StoreError::Unreachable(format!("failed to release lock: {}", e)))?;

        result
    }

    fn load(&self, path: &Path) -> Result<WorkloadEndpoint, StoreError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => {
                return Err(StoreError::Unreachable(format!(
                    "failed to open {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            StoreError::Unreachable(format!("failed to read {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&contents)
            .map_err(|e| StoreError::Invalid(format!("{}: {}", path.display(), e)))
    }

    fn save(&self, path: &Path, endpoint: &WorkloadEndpoint) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(endpoint)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)
        };
        write().map_err(|e| {
            StoreError::Unreachable(format!("failed to write {}: {}", path.display(), e))
        })
    }
}

impl EndpointStore for FileStore {
    fn get(&self, key: &EndpointKey) -> Result<WorkloadEndpoint, StoreError> {
        let path = self.record_path(key);
        self.with_lock(|| self.load(&path))
    }

    fn apply(&self, mut endpoint: WorkloadEndpoint) -> Result<WorkloadEndpoint, StoreError> {
        let path = self.record_path(&endpoint.key());
        self.with_lock(|| {
            let previous = match self.load(&path) {
                Ok(current) => current.revision,
                Err(StoreError::NotFound) => 0,
                Err(e) => return Err(e),
            };
            endpoint.revision = previous + 1;
            self.save(&path, &endpoint)?;
            debug!(
                workload = %endpoint.metadata.workload,
                revision = endpoint.revision,
                "stored endpoint"
            );
            Ok(endpoint)
        })
    }

    fn compare_and_delete(&self, expected: &WorkloadEndpoint) -> Result<(), StoreError> {
        let path = self.record_path(&expected.key());
        self.with_lock(|| {
            let current = self.load(&path)?;
            if current != *expected {
                return Err(StoreError::Conflict);
            }
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
                Err(e) => Err(StoreError::Unreachable(format!(
                    "failed to remove {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
    }
}
