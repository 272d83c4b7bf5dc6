//! Archive upload to a pre-signed URL

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Header bounding the accepted body size on the storage side
pub const CONTENT_LENGTH_RANGE_HEADER: &str = "X-Goog-Content-Length-Range";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("opening archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("uploading archive: storage returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("uploading archive: {0}")]
    Transport(String),
}

/// Transfers an archive to a write-only destination
pub trait Uploader: Send + Sync {
    fn upload(&self, url: &str, archive: &Path, size_bytes: u64) -> Result<(), UploadError>;
}

/// `PUT`s the archive with ureq
pub struct HttpUploader {
    agent: ureq::Agent,
}

impl HttpUploader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Default for HttpUploader {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, url: &str, archive: &Path, size_bytes: u64) -> Result<(), UploadError> {
        let file = File::open(archive).map_err(|source| UploadError::Open {
            path: archive.to_path_buf(),
            source,
        })?;
        tracing::debug!(size_bytes, "uploading archive");
        let result = self
            .agent
            .put(url)
            .set(CONTENT_LENGTH_RANGE_HEADER, &content_length_range(size_bytes))
            .set("Content-Length", &size_bytes.to_string())
            .set("Content-Type", "application/gzip")
            .send(file);
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => Err(UploadError::Status {
                code,
                message: resp.into_string().unwrap_or_default().trim().to_string(),
            }),
            Err(ureq::Error::Transport(t)) => Err(UploadError::Transport(t.to_string())),
        }
    }
}

fn content_length_range(size_bytes: u64) -> String {
    format!("0,{size_bytes}")
}
