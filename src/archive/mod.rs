//! Task source archiving
//!
//! [`ApiArchiver`] packages a task root into a `.tar.gz`, uploads it through an
//! [`Uploader`] and remembers the upload id for the rest of the process.
//!
//! Concurrent calls for the same root share a single archive-and-upload: the
//! first caller does the work while the others park on its flight and receive
//! a copy of the result. A successful upload is cached, so a later call for
//! the same root returns the cached id with a size of zero. Failures are
//! handed to every waiter but never cached.

mod ignore;
mod tarball;
mod upload;

pub use ignore::{IgnoreError, IgnoreRules, DEFAULT_IGNORES};
pub use tarball::{write_archive, ArchiveFile, DigestWriter, TarError, TreeWriter};
pub use upload::{HttpUploader, UploadError, Uploader, CONTENT_LENGTH_RANGE_HEADER};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use taskpilot_api::{ApiClient, ApiError, CreateBuildUploadRequest};

use crate::cancel::CancelToken;
use crate::config::DEFAULT_IGNORE_FILE;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error("building archive: {0}")]
    Tar(#[from] TarError),

    #[error("creating upload: {0}")]
    CreateUpload(#[source] ApiError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("archiving cancelled")]
    Cancelled,

    /// The caller doing the work unwound before finishing
    #[error("archiving was interrupted")]
    Interrupted,

    /// A failure shared with every caller waiting on the same root
    #[error(transparent)]
    Shared(Arc<ArchiveError>),
}

/// An uploaded archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveUpload {
    pub upload_id: String,
    /// Compressed size, or 0 when a cached upload was reused
    pub size_bytes: u64,
}

/// Produces an uploaded artifact for a task root
pub trait Archiver: Send + Sync {
    fn archive(&self, cancel: &CancelToken, root: &Path) -> Result<ArchiveUpload, ArchiveError>;
}

type FlightResult = Result<ArchiveUpload, Arc<ArchiveError>>;

/// One in-progress archive-and-upload that other callers can wait on
#[derive(Default)]
struct Flight {
    result: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, result: FlightResult) {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> FlightResult {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Default)]
struct ArchiveState {
    /// Root -> upload id, successful uploads only
    uploaded: HashMap<PathBuf, String>,
    in_flight: HashMap<PathBuf, Arc<Flight>>,
}

/// Archiver backed by the API's upload endpoint
pub struct ApiArchiver {
    client: Arc<dyn ApiClient>,
    uploader: Arc<dyn Uploader>,
    ignore_file: String,
    state: Mutex<ArchiveState>,
}

impl ApiArchiver {
    pub fn new(client: Arc<dyn ApiClient>, uploader: Arc<dyn Uploader>) -> Self {
        Self {
            client,
            uploader,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            state: Mutex::new(ArchiveState::default()),
        }
    }

    /// Name of the per-root ignore file
    pub fn with_ignore_file(mut self, name: impl Into<String>) -> Self {
        self.ignore_file = name.into();
        self
    }

    fn state(&self) -> MutexGuard<'_, ArchiveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn archive_and_upload(
        &self,
        cancel: &CancelToken,
        root: &Path,
    ) -> Result<ArchiveUpload, ArchiveError> {
        cancel.check().map_err(|_| ArchiveError::Cancelled)?;
        let rules = IgnoreRules::for_root(root, &self.ignore_file)?;
        let archive = write_archive(root, &rules)?;
        tracing::info!(
            root = %root.display(),
            size_bytes = archive.size_bytes,
            entries = archive.entries,
            sha256 = %archive.sha256,
            "archived task root"
        );

        cancel.check().map_err(|_| ArchiveError::Cancelled)?;
        let upload = self
            .client
            .create_build_upload(&CreateBuildUploadRequest {
                size_bytes: archive.size_bytes,
            })
            .map_err(ArchiveError::CreateUpload)?;
        self.uploader
            .upload(&upload.write_only_url, archive.path(), archive.size_bytes)?;
        tracing::debug!(upload_id = %upload.upload.id, "uploaded archive");

        Ok(ArchiveUpload {
            upload_id: upload.upload.id,
            size_bytes: archive.size_bytes,
        })
    }
}

impl Archiver for ApiArchiver {
    fn archive(&self, cancel: &CancelToken, root: &Path) -> Result<ArchiveUpload, ArchiveError> {
        let key = root.to_path_buf();
        let guard = {
            let mut state = self.state();
            if let Some(upload_id) = state.uploaded.get(&key) {
                tracing::debug!(root = %root.display(), %upload_id, "reusing uploaded archive");
                return Ok(ArchiveUpload {
                    upload_id: upload_id.clone(),
                    size_bytes: 0,
                });
            }
            if let Some(flight) = state.in_flight.get(&key) {
                let flight = Arc::clone(flight);
                drop(state);
                return flight.wait().map_err(ArchiveError::Shared);
            }
            let flight = Arc::new(Flight::default());
            state.in_flight.insert(key.clone(), Arc::clone(&flight));
            FlightGuard {
                state: &self.state,
                key,
                flight,
                finished: false,
            }
        };

        let result = self.archive_and_upload(cancel, root).map_err(Arc::new);
        guard.finish(result).map_err(ArchiveError::Shared)
    }
}

/// Settles a claimed flight exactly once, also when the leader unwinds
struct FlightGuard<'a> {
    state: &'a Mutex<ArchiveState>,
    key: PathBuf,
    flight: Arc<Flight>,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, result: FlightResult) -> FlightResult {
        self.finished = true;
        self.settle(result)
    }

    fn settle(&self, result: FlightResult) -> FlightResult {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight.remove(&self.key);
            if let Ok(upload) = &result {
                state.uploaded.insert(self.key.clone(), upload.upload_id.clone());
            }
        }
        self.flight.complete(result.clone());
        result
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.settle(Err(Arc::new(ArchiveError::Interrupted)));
        }
    }
}
