//! Protocol-agnostic access to one storage endpoint.
//!
//! A [`RemoteStorage`] is a live session against a single share. Implementations exist per
//! protocol; the transfer engine, the archive builder and the scanner are written against the
//! trait only. Reads and writes are streaming so file size never dictates memory use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod local;

pub use local::LocalClient;

/// Boxed byte source returned by [`RemoteStorage::read_file`].
pub type BoxedReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Local,
    Smb,
    Nfs,
    Ftp,
    Webdav,
}

impl Protocol {
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Local => 0,
            Protocol::Smb => 445,
            Protocol::Nfs => 2049,
            Protocol::Ftp => 21,
            Protocol::Webdav => 443,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Local => "local",
            Protocol::Smb => "smb",
            Protocol::Nfs => "nfs",
            Protocol::Ftp => "ftp",
            Protocol::Webdav => "webdav",
        };
        f.write_str(name)
    }
}

/// A credential that never shows up in logs or serialized output.
#[derive(Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl serde::Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

/// Everything a [`Connector`] needs to open a session.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub name: String,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: u16,
    /// Share name for SMB, export for NFS, base directory for local roots.
    pub share: Option<String>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub domain: Option<String>,
    /// Where the OS has mounted the share, if it has.
    pub mount_point: Option<PathBuf>,
}

/// Metadata of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with [`StorageError::AlreadyExists`] if the destination exists.
    CreateNew,
    /// Replace any existing file.
    Truncate,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0:?} not found")]
    NotFound(PathBuf),
    #[error("permission denied: {0:?}")]
    PermissionDenied(PathBuf),
    #[error("{0:?} already exists")]
    AlreadyExists(PathBuf),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: &'static str },
    #[error("protocol '{0}' is not supported without a local mount point")]
    Unsupported(Protocol),
    #[error("transport failure on {path:?}")]
    Transport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session is closed")]
    Closed,
}

impl StorageError {
    pub fn from_io(path: &Path, error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(path.to_path_buf())
            }
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_path_buf()),
            _ => StorageError::Transport {
                path: path.to_path_buf(),
                source: error,
            },
        }
    }

    /// True when the session itself (not a single path) is unusable.
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        matches!(self, StorageError::Closed | StorageError::Unsupported(_))
    }
}

/// Per-session operations against one endpoint.
///
/// Implementations must be safe to share between concurrent requests: the pool hands the same
/// session to every holder of a connection key. `close` must be idempotent.
#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync + std::fmt::Debug {
    async fn list_directory(&self, path: &Path) -> Result<Vec<FileInfo>, StorageError>;

    async fn get_file_info(&self, path: &Path) -> Result<FileInfo, StorageError>;

    async fn file_exists(&self, path: &Path) -> Result<bool, StorageError> {
        match self.get_file_info(path).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<BoxedReader, StorageError>;

    /// Streams `data` into `path` and returns the number of bytes written.
    async fn write_file(
        &self,
        path: &Path,
        data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        mode: WriteMode,
    ) -> Result<u64, StorageError>;

    /// Creates a single directory; fails with [`StorageError::AlreadyExists`] if present.
    async fn create_directory(&self, path: &Path) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Opens physical sessions. The pool calls this at most once per live connection key.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &StorageConfig) -> Result<Arc<dyn RemoteStorage>, StorageError>;
}

/// Default connector: local roots and OS-mounted SMB/NFS shares.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolConnector;

#[async_trait::async_trait]
impl Connector for ProtocolConnector {
    #[tracing::instrument(skip(self, config), fields(name = %config.name, protocol = %config.protocol))]
    async fn connect(&self, config: &StorageConfig) -> Result<Arc<dyn RemoteStorage>, StorageError> {
        let base = match (config.protocol, &config.mount_point, &config.share) {
            (Protocol::Local, Some(mount_point), _) => mount_point.clone(),
            (Protocol::Local, None, Some(share)) => PathBuf::from(share),
            (Protocol::Local, None, None) => {
                return Err(StorageError::InvalidPath {
                    path: PathBuf::new(),
                    reason: "local storage root has no path",
                });
            }
            (Protocol::Smb | Protocol::Nfs, Some(mount_point), _) => mount_point.clone(),
            (protocol, _, _) => return Err(StorageError::Unsupported(protocol)),
        };
        tracing::debug!("opening session rooted at {:?}", &base);
        let client = LocalClient::connect(&base).await?;
        Ok(Arc::new(client))
    }
}

/// Joins an entry name onto a directory path, rejecting names that would escape it.
pub fn child_path(parent: &Path, name: &str) -> Result<PathBuf, StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(StorageError::InvalidPath {
            path: parent.join(name),
            reason: "directory entry name is not a single path component",
        });
    }
    Ok(parent.join(name))
}
