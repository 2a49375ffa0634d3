//! Entry points for the outer surfaces: transfers, downloads, uploads, archives and scans.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveError};
use crate::catalog::{
    resolve_storage_root, CatalogError, CatalogSink, RootRef, RootRepository, StorageRoot,
};
use crate::config::{depth_limit, ArchiveConfig, PoolConfig, ScanConfig};
use crate::location::{Endpoint, Locator};
use crate::pool::{ConnectionPool, PoolError, PoolStats, PooledClient};
use crate::progress;
use crate::scan::{JobId, ScanError, ScanJob, ScanRegistry, ScanStatus, ScanTicket, ScanType};
use crate::storage::{Connector, FileInfo, LocalClient, StorageError, WriteMode};
use crate::stream::ByteStream;
use crate::transfer::{self, TransferError, TransferResult};

/// Coarse classification callers map to their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PermissionDenied,
    ResourceLimit,
    Unavailable,
    Cancelled,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed {action} {path:?}")]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Transfer(#[from] transfer::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

fn storage_kind(error: &StorageError) -> ErrorKind {
    match error {
        StorageError::NotFound(_) => ErrorKind::NotFound,
        StorageError::PermissionDenied(_) => ErrorKind::PermissionDenied,
        StorageError::AlreadyExists(_) => ErrorKind::Conflict,
        StorageError::InvalidPath { .. } | StorageError::Unsupported(_) => ErrorKind::Validation,
        StorageError::Transport { .. } | StorageError::Closed => ErrorKind::Unavailable,
    }
}

impl ServiceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::Catalog(CatalogError::RootNotFound(_)) => ErrorKind::NotFound,
            ServiceError::Catalog(_) => ErrorKind::Internal,
            ServiceError::Pool(PoolError::Exhausted { .. }) => ErrorKind::ResourceLimit,
            ServiceError::Pool(PoolError::Closed) => ErrorKind::Unavailable,
            ServiceError::Pool(PoolError::Connect { source, .. }) => match storage_kind(source) {
                ErrorKind::NotFound => ErrorKind::Unavailable,
                kind => kind,
            },
            ServiceError::Storage { source, .. } => storage_kind(source),
            ServiceError::Transfer(error) => match &error.source {
                TransferError::Validation(_) => ErrorKind::Validation,
                TransferError::SourceNotFound(_) => ErrorKind::NotFound,
                TransferError::Conflict(_) => ErrorKind::Conflict,
                TransferError::Storage { source, .. } => storage_kind(source),
                TransferError::Cancelled => ErrorKind::Cancelled,
            },
            ServiceError::Archive(error) => match error {
                ArchiveError::NotADirectory(_) => ErrorKind::Validation,
                ArchiveError::SizeLimitExceeded { .. } => ErrorKind::ResourceLimit,
                ArchiveError::Storage { source, .. } => storage_kind(source),
                ArchiveError::Cancelled => ErrorKind::Cancelled,
                ArchiveError::Entry { .. }
                | ArchiveError::Stream { .. }
                | ArchiveError::Finish(_) => ErrorKind::Internal,
            },
            ServiceError::Scan(error) => match error {
                ScanError::DuplicateJob(_) => ErrorKind::Conflict,
                ScanError::QueueFull(_) => ErrorKind::ResourceLimit,
                ScanError::RootDisabled(_) => ErrorKind::Validation,
                ScanError::ShutDown => ErrorKind::Unavailable,
                ScanError::Cancelled => ErrorKind::Cancelled,
                ScanError::Connect(_) | ScanError::Listing { .. } | ScanError::Catalog(_) => {
                    ErrorKind::Unavailable
                }
            },
        }
    }

    fn storage(action: &'static str, path: &Path, source: StorageError) -> Self {
        ServiceError::Storage {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A copy between two locations.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: Locator,
    pub destination: Locator,
    pub overwrite: bool,
    /// Levels of subdirectories to descend into; `None` is unlimited.
    pub max_depth: Option<u32>,
}

/// Options of a directory archive download.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveRequest {
    pub recursive: bool,
    /// Negative for unlimited.
    pub max_depth: i32,
    /// Overrides the configured archive size limit.
    pub max_total_bytes: Option<u64>,
}

impl Default for ArchiveRequest {
    fn default() -> Self {
        Self {
            recursive: true,
            max_depth: -1,
            max_total_bytes: None,
        }
    }
}

/// Metadata and body of a single-file download.
#[derive(Debug)]
pub struct Download {
    pub info: FileInfo,
    pub body: ByteStream,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogSettings {
    pub pool: PoolConfig,
    pub archive: ArchiveConfig,
    pub scan: ScanConfig,
    pub chunk_size: u64,
}

/// The data-access core: storage roots, pooled sessions and the engines built on them.
pub struct Catalog {
    prog_track: &'static progress::Progress,
    roots: Arc<dyn RootRepository>,
    pool: Arc<ConnectionPool>,
    scans: ScanRegistry,
    settings: CatalogSettings,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("pool", &self.pool)
            .field("scans", &self.scans)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Catalog {
    pub fn new(
        prog_track: &'static progress::Progress,
        roots: Arc<dyn RootRepository>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn CatalogSink>,
        settings: CatalogSettings,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(connector, settings.pool));
        let scans = ScanRegistry::new(pool.clone(), roots.clone(), sink, settings.scan);
        Self {
            prog_track,
            roots,
            pool,
            scans,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token for a new request; cancelled when the catalog shuts down.
    #[must_use]
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn list_storage_roots(&self) -> Result<Vec<StorageRoot>, ServiceError> {
        Ok(self.roots.list().await?)
    }

    pub async fn resolve_storage_root(&self, root: &RootRef) -> Result<StorageRoot, ServiceError> {
        Ok(resolve_storage_root(self.roots.as_ref(), root).await?)
    }

    async fn connect(&self, root: &RootRef) -> Result<(StorageRoot, PooledClient), ServiceError> {
        let root = self.resolve_storage_root(root).await?;
        if !root.enabled {
            return Err(ServiceError::Validation(format!(
                "storage root '{}' is disabled",
                root.name
            )));
        }
        let client = self
            .pool
            .acquire(&root.connection_key(), &root.storage_config())
            .await?;
        Ok((root, client))
    }

    async fn open(&self, locator: &Locator) -> Result<(Endpoint, String), ServiceError> {
        match locator {
            Locator::Remote { root, path } => {
                let (root, client) = self.connect(root).await?;
                Ok((
                    Endpoint::Remote(client),
                    format!("{}:{}", root.name, path.display()),
                ))
            }
            Locator::Local(path) => Ok((
                Endpoint::Local(LocalClient::unconfined()),
                path.display().to_string(),
            )),
        }
    }

    /// Copies a file or directory tree between a storage root and another root or the local
    /// filesystem.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn copy(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferResult, ServiceError> {
        if request.source.is_local() && request.destination.is_local() {
            return Err(ServiceError::Transfer(transfer::Error::new(
                TransferError::Validation(
                    "at least one side of a transfer must be a storage root".to_string(),
                ),
                Default::default(),
            )));
        }
        let start = std::time::Instant::now();
        let (source, source_path) = self.open(&request.source).await?;
        let (destination, destination_path) = self.open(&request.destination).await?;
        let settings = transfer::Settings {
            overwrite: request.overwrite,
            max_depth: request.max_depth,
            chunk_size: self.settings.chunk_size,
        };
        let summary = transfer::transfer(
            self.prog_track,
            source.storage(),
            request.source.path(),
            destination.storage(),
            request.destination.path(),
            &settings,
            cancel,
        )
        .await?;
        tracing::info!(
            "copied {} files ({}) from {} to {}",
            summary.files_copied,
            bytesize::ByteSize(summary.bytes_copied),
            &source_path,
            &destination_path
        );
        Ok(TransferResult {
            source_path,
            destination_path,
            bytes_copied: summary.bytes_copied,
            files_count: summary.files_copied,
            directories_created: summary.directories_created,
            elapsed: start.elapsed(),
            success: true,
        })
    }

    /// Metadata of a remote file without opening it.
    pub async fn download_info(&self, root: &RootRef, path: &Path) -> Result<FileInfo, ServiceError> {
        let (_, client) = self.connect(root).await?;
        client
            .get_file_info(path)
            .await
            .map_err(|error| ServiceError::storage("reading metadata of", path, error))
    }

    /// Opens a remote file for chunked reading.
    #[tracing::instrument(skip(self))]
    pub async fn stream_download(&self, root: &RootRef, path: &Path) -> Result<Download, ServiceError> {
        let (_, client) = self.connect(root).await?;
        let info = client
            .get_file_info(path)
            .await
            .map_err(|error| ServiceError::storage("reading metadata of", path, error))?;
        if info.is_dir {
            return Err(ServiceError::Validation(format!(
                "{path:?} is a directory, download it as an archive"
            )));
        }
        let permit = throttle::open_stream_permit().await;
        let reader = client
            .read_file(path)
            .await
            .map_err(|error| ServiceError::storage("opening", path, error))?;
        let chunk = self.settings.archive.buffer_size;
        let body = ByteStream::new(
            ReaderStream::with_capacity(reader, chunk),
            Some(client),
            Some(permit),
        );
        Ok(Download { info, body })
    }

    /// Streams `data` into `directory/file_name` on a storage root.
    #[tracing::instrument(skip(self, data))]
    pub async fn upload(
        &self,
        data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        root: &RootRef,
        directory: &Path,
        file_name: &str,
        overwrite: bool,
    ) -> Result<TransferResult, ServiceError> {
        if file_name.is_empty() || file_name == "." || file_name == ".." || file_name.contains('/')
        {
            return Err(ServiceError::Validation(format!(
                "invalid upload file name '{file_name}'"
            )));
        }
        let start = std::time::Instant::now();
        let (root, client) = self.connect(root).await?;
        let path = directory.join(file_name);
        let mode = if overwrite {
            WriteMode::Truncate
        } else {
            WriteMode::CreateNew
        };
        let _open_stream_guard = throttle::open_stream_permit().await;
        let bytes = match client.write_file(&path, data, mode).await {
            Ok(bytes) => bytes,
            Err(StorageError::AlreadyExists(_)) => {
                return Err(ServiceError::Transfer(transfer::Error::new(
                    TransferError::Conflict(path),
                    Default::default(),
                )));
            }
            Err(error) => return Err(ServiceError::storage("writing", &path, error)),
        };
        self.prog_track.files_copied.inc();
        self.prog_track.bytes_copied.add(bytes);
        tracing::info!("uploaded {} to {}:{:?}", bytesize::ByteSize(bytes), &root.name, &path);
        Ok(TransferResult {
            source_path: file_name.to_string(),
            destination_path: format!("{}:{}", root.name, path.display()),
            bytes_copied: bytes,
            files_count: 1,
            directories_created: 0,
            elapsed: start.elapsed(),
            success: true,
        })
    }

    /// Streams a ZIP archive of a remote directory.
    ///
    /// The archive is built by a background task feeding the returned stream. Errors found
    /// before the first byte (unknown root, missing or non-directory path) are returned
    /// directly; later ones end the stream with an `Err` item.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn stream_directory_archive(
        &self,
        root: &RootRef,
        path: &Path,
        request: ArchiveRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, ServiceError> {
        let (_, client) = self.connect(root).await?;
        let info = client
            .get_file_info(path)
            .await
            .map_err(|error| ServiceError::storage("reading metadata of", path, error))?;
        if !info.is_dir {
            return Err(ServiceError::Archive(ArchiveError::NotADirectory(
                path.to_path_buf(),
            )));
        }
        let settings = archive::Settings {
            recursive: request.recursive,
            max_depth: depth_limit(request.max_depth),
            max_total_bytes: request
                .max_total_bytes
                .unwrap_or(self.settings.archive.max_total_bytes),
            chunk_size: self.settings.chunk_size,
        };
        let (writer, reader) = tokio::io::duplex(self.settings.archive.buffer_size);
        let prog_track = self.prog_track;
        let root_path = path.to_path_buf();
        let cancel = cancel.clone();
        let build = tokio::spawn(async move {
            archive::build(
                prog_track,
                &*client,
                &root_path,
                Box::new(writer),
                &settings,
                &cancel,
            )
            .await
        });
        let outcome = futures::stream::once(async move {
            match build.await {
                Ok(Ok(summary)) => {
                    tracing::debug!("archive complete: {} files", summary.files_added);
                    None
                }
                Ok(Err(ArchiveError::Cancelled)) => {
                    tracing::info!("archive cancelled");
                    Some(Err(std::io::Error::other(ArchiveError::Cancelled)))
                }
                Ok(Err(error)) => {
                    tracing::error!("archive failed: {:#}", &error);
                    Some(Err::<bytes::Bytes, _>(std::io::Error::other(error)))
                }
                Err(join_error) => Some(Err(std::io::Error::other(join_error))),
            }
        })
        .filter_map(futures::future::ready);
        Ok(ByteStream::new(
            ReaderStream::new(reader).chain(outcome),
            None,
            None,
        ))
    }

    /// Queues a scan of `path` (the whole root when `None`) on a storage root.
    pub async fn queue_scan(
        &self,
        root: &RootRef,
        path: Option<PathBuf>,
        scan_type: ScanType,
        max_depth: Option<i32>,
    ) -> Result<ScanTicket, ServiceError> {
        let root = self.resolve_storage_root(root).await?;
        let mut job = ScanJob::new(root, scan_type);
        if let Some(path) = path {
            job.path = path;
        }
        if let Some(max_depth) = max_depth {
            job.max_depth = depth_limit(max_depth);
        }
        Ok(self.scans.queue_scan(self.prog_track, job)?)
    }

    #[must_use]
    pub fn get_scan_status(&self, id: &JobId) -> Option<ScanStatus> {
        self.scans.get_active_status(id)
    }

    #[must_use]
    pub fn list_scan_statuses(&self) -> Vec<ScanStatus> {
        let mut statuses: Vec<_> = self.scans.list_active_statuses().into_values().collect();
        statuses.sort_by_key(|status| status.queued_at);
        statuses
    }

    pub fn cancel_scan(&self, id: &JobId) -> bool {
        self.scans.cancel(id)
    }

    /// Cancels outstanding work and closes every pooled session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scans.shutdown().await;
        self.pool.release_all().await;
    }
}
