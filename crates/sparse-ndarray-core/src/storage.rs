//! Storage backend and path utilities.
//!
//! This module centralizes filesystem access for `sparse-ndarray-core`. It maps
//! an array root to concrete paths and provides the small set of primitives the
//! transaction log and the fragment writer build on:
//!
//! - atomic replacement (write-then-rename) for the `CURRENT` pointer,
//! - create-only writes for commit files and fragments,
//! - whole-file reads.
//!
//! Only the local filesystem is supported. Array URIs are either plain paths or
//! `file://` URIs; any other scheme is rejected with
//! [`StorageError::UnsupportedUri`].

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root location of a sparse array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrayLocation {
    /// An array stored on the local filesystem at the given directory.
    Local(PathBuf),
}

impl ArrayLocation {
    /// Creates a new `ArrayLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        ArrayLocation::Local(root.into())
    }

    /// Parse a user-facing array URI.
    ///
    /// Accepts `file://<path>` and bare paths. Empty URIs and URIs with any
    /// other scheme are rejected.
    pub fn parse(uri: &str) -> StorageResult<Self> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return UnsupportedUriSnafu {
                uri: uri.to_string(),
                reason: "empty URI".to_string(),
            }
            .fail();
        }

        if let Some(path) = trimmed.strip_prefix("file://") {
            if path.is_empty() {
                return UnsupportedUriSnafu {
                    uri: uri.to_string(),
                    reason: "file URI has no path".to_string(),
                }
                .fail();
            }
            return Ok(ArrayLocation::local(path));
        }

        if let Some((scheme, _)) = trimmed.split_once("://") {
            return UnsupportedUriSnafu {
                uri: uri.to_string(),
                reason: format!("scheme {scheme:?} is not supported"),
            }
            .fail();
        }

        Ok(ArrayLocation::local(trimmed))
    }

    /// Root directory of a local array.
    pub fn root(&self) -> &Path {
        match self {
            ArrayLocation::Local(root) => root,
        }
    }
}

impl fmt::Display for ArrayLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Errors produced by the storage backend implementation.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The array URI cannot be mapped to a supported backend.
    #[snafu(display("Unsupported array URI {uri:?}: {reason}"))]
    UnsupportedUri {
        /// The URI as supplied by the caller.
        uri: String,
        /// Why the URI was rejected.
        reason: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Path the error refers to, when there is one.
    pub fn path(&self) -> Option<&str> {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => Some(path),
            StorageError::UnsupportedUri { .. } => None,
        }
    }
}

fn join_local(location: &ArrayLocation, rel: &Path) -> PathBuf {
    match location {
        ArrayLocation::Local(root) => root.join(rel),
    }
}

fn classify_io(path: String, e: io::Error) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are already on an error path.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location` using write-then-rename.
///
/// The payload goes to a temporary sibling file which is synced and then
/// renamed over the target, so readers observe either the old or the new
/// contents and never a torn write.
pub async fn write_atomic(
    location: &ArrayLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        file.write_all(contents)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        file.sync_all()
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    guard.disarm();
    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file is already present.
///
/// Used for commit files and fragments, which are written exactly once.
pub async fn write_new(
    location: &ArrayLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify_io(abs.display().to_string(), e))?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    Ok(())
}

/// Read the file at `rel_path` as UTF-8.
///
/// A missing file yields [`StorageError::NotFound`].
pub async fn read_to_string(location: &ArrayLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = join_local(location, rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(|e| classify_io(abs.display().to_string(), e))
}

/// Read the full contents of the file at `rel_path`.
pub async fn read_all_bytes(location: &ArrayLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = join_local(location, rel_path);
    fs::read(&abs)
        .await
        .map_err(|e| classify_io(abs.display().to_string(), e))
}
