//! Tar writing shared by task archives and local build contexts
//!
//! Entries are written relative to the task root, in sorted order, with
//! zeroed ownership and timestamps so identical trees produce identical bytes.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use super::ignore::IgnoreRules;

#[derive(Debug, thiserror::Error)]
pub enum TarError {
    #[error("walking {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Counts and hashes everything written through it
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Inner writer, byte count and hex SHA-256
    pub fn finish(self) -> (W, u64, String) {
        (self.inner, self.written, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Tar builder that understands task roots and ignore rules
pub struct TreeWriter<W: Write> {
    builder: Builder<W>,
    entries: usize,
}

impl<W: Write> TreeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: Builder::new(writer),
            entries: 0,
        }
    }

    /// Number of entries appended so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Append the children of `root` (not `root` itself), skipping ignored
    /// paths and symlinks
    pub fn append_tree(&mut self, root: &Path, rules: &IgnoreRules) -> Result<(), TarError> {
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
                !rules.should_prune(rel, entry.file_type().is_dir())
            });

        for entry in walker {
            let entry = entry.map_err(|source| TarError::Walk {
                root: root.to_path_buf(),
                source,
            })?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if rules.is_ignored(rel, file_type.is_dir()) {
                continue;
            }

            if file_type.is_dir() {
                self.append_dir(rel)?;
            } else if file_type.is_file() {
                self.append_file(entry.path(), rel)?;
            }
        }
        Ok(())
    }

    fn append_dir(&mut self, rel: &Path) -> Result<(), TarError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(0);
        let io_err = |source: io::Error| TarError::Io {
            context: "adding directory",
            path: rel.to_path_buf(),
            source,
        };
        self.builder
            .append_data(&mut header, rel, io::empty())
            .map_err(io_err)?;
        self.entries += 1;
        Ok(())
    }

    fn append_file(&mut self, full: &Path, rel: &Path) -> Result<(), TarError> {
        let io_err = |context: &'static str| {
            move |source: io::Error| TarError::Io {
                context,
                path: full.to_path_buf(),
                source,
            }
        };
        let mut file = File::open(full).map_err(io_err("opening"))?;
        let metadata = file.metadata().map_err(io_err("reading metadata of"))?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, rel, &mut file)
            .map_err(io_err("archiving"))?;
        self.entries += 1;
        Ok(())
    }

    /// Append an in-memory file at `rel`
    pub fn append_bytes(&mut self, rel: &str, contents: &[u8]) -> Result<(), TarError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, rel, contents)
            .map_err(|source| TarError::Io {
                context: "adding",
                path: PathBuf::from(rel),
                source,
            })?;
        self.entries += 1;
        Ok(())
    }

    /// Write the end-of-archive marker and return the underlying writer
    pub fn finish(self) -> io::Result<W> {
        self.builder.into_inner()
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// A gzip-compressed archive of a task root on disk
#[derive(Debug)]
pub struct ArchiveFile {
    file: tempfile::NamedTempFile,
    pub size_bytes: u64,
    pub sha256: String,
    pub entries: usize,
}

impl ArchiveFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Write `root`'s filtered tree to a temporary `.tar.gz`
pub fn write_archive(root: &Path, rules: &IgnoreRules) -> Result<ArchiveFile, TarError> {
    let io_err = |context: &'static str, source: io::Error| TarError::Io {
        context,
        path: root.to_path_buf(),
        source,
    };
    let file = tempfile::Builder::new()
        .prefix("taskpilot-archive-")
        .suffix(".tar.gz")
        .tempfile()
        .map_err(|e| io_err("creating temporary archive for", e))?;
    let handle = file
        .reopen()
        .map_err(|e| io_err("creating temporary archive for", e))?;

    let gz = GzEncoder::new(DigestWriter::new(handle), Compression::default());
    let mut tree = TreeWriter::new(gz);
    tree.append_tree(root, rules)?;
    let entries = tree.entries();
    let gz = tree.finish().map_err(|e| io_err("finishing archive of", e))?;
    let digest = gz.finish().map_err(|e| io_err("compressing archive of", e))?;
    let (mut handle, size_bytes, sha256) = digest.finish();
    handle
        .flush()
        .map_err(|e| io_err("writing archive of", e))?;

    Ok(ArchiveFile {
        file,
        size_bytes,
        sha256,
        entries,
    })
}
