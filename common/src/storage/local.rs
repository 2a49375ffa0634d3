use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWriteExt;

use super::{BoxedReader, FileInfo, RemoteStorage, StorageError, WriteMode};

/// Filesystem-backed session.
///
/// A confined client resolves every path below its base directory: absolute paths are re-rooted
/// and `..` components are rejected. An unconfined client uses paths as given and represents the
/// local side of a transfer.
#[derive(Debug, Clone)]
pub struct LocalClient {
    base: Option<PathBuf>,
    closed: Arc<AtomicBool>,
}

fn metadata_to_info(name: String, metadata: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok().map(chrono::DateTime::from),
        is_dir: metadata.is_dir(),
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl LocalClient {
    /// Opens a session confined to `base`, which must be an existing directory.
    pub async fn connect(base: &Path) -> Result<Self, StorageError> {
        let metadata = tokio::fs::metadata(base)
            .await
            .map_err(|error| StorageError::from_io(base, error))?;
        if !metadata.is_dir() {
            return Err(StorageError::InvalidPath {
                path: base.to_path_buf(),
                reason: "storage root is not a directory",
            });
        }
        Ok(Self {
            base: Some(base.to_path_buf()),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn unconfined() -> Self {
        Self {
            base: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    pub fn resolve(&self, path: &Path) -> Result<PathBuf, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let Some(base) = &self.base else {
            return Ok(path.to_path_buf());
        };
        let mut resolved = base.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(StorageError::InvalidPath {
                        path: path.to_path_buf(),
                        reason: "parent directory references are not allowed",
                    });
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait::async_trait]
impl RemoteStorage for LocalClient {
    async fn list_directory(&self, path: &Path) -> Result<Vec<FileInfo>, StorageError> {
        let full = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        let mut listing = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| StorageError::from_io(path, error))?
        {
            let entry_path = entry.path();
            // follow symlinks so the listing reports what a reader would see
            let metadata = match tokio::fs::metadata(&entry_path).await {
                Ok(metadata) => metadata,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("skipping dangling entry {:?}", &entry_path);
                    continue;
                }
                Err(error) => return Err(StorageError::from_io(&entry_path, error)),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            listing.push(metadata_to_info(name, &metadata));
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    async fn get_file_info(&self, path: &Path) -> Result<FileInfo, StorageError> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        Ok(metadata_to_info(entry_name(&full), &metadata))
    }

    async fn read_file(&self, path: &Path) -> Result<BoxedReader, StorageError> {
        let full = self.resolve(path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        if metadata.is_dir() {
            return Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
                reason: "cannot read a directory as a file",
            });
        }
        Ok(Box::new(file))
    }

    async fn write_file(
        &self,
        path: &Path,
        data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        mode: WriteMode,
    ) -> Result<u64, StorageError> {
        let full = self.resolve(path)?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        match mode {
            WriteMode::CreateNew => options.create_new(true),
            WriteMode::Truncate => options.create(true).truncate(true),
        };
        let mut file = options
            .open(&full)
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        let written = tokio::io::copy(data, &mut file)
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        file.flush()
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        Ok(written)
    }

    async fn create_directory(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir(&full)
            .await
            .map_err(|error| StorageError::from_io(path, error))
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("closed session rooted at {:?}", &self.base);
        }
        Ok(())
    }
}
