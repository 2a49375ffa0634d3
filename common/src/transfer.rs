use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::progress;
use crate::storage::{child_path, FileInfo, RemoteStorage, StorageError, WriteMode};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer request: {0}")]
    Validation(String),
    #[error("source {0:?} does not exist")]
    SourceNotFound(PathBuf),
    #[error("destination {0:?} already exists, did you intend to overwrite?")]
    Conflict(PathBuf),
    #[error("failed {action} {path:?}")]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    fn storage(action: &'static str, path: &Path, source: StorageError) -> Self {
        TransferError::Storage {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Error type for transfers that preserves the work done before the failure.
///
/// The Display implementation shows the full error chain, so it can be logged with any
/// format specifier.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: TransferError,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: TransferError, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct Settings {
    pub overwrite: bool,
    /// Levels of subdirectories to descend into; `None` is unlimited.
    pub max_depth: Option<u32>,
    pub chunk_size: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
        }
    }
}

impl std::ops::AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n\
            directories unchanged: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.directories_created,
            self.directories_unchanged,
        )
    }
}

/// Outcome of a finished transfer request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransferResult {
    pub source_path: String,
    pub destination_path: String,
    pub bytes_copied: u64,
    pub files_count: usize,
    pub directories_created: usize,
    #[serde(with = "human_duration")]
    pub elapsed: std::time::Duration,
    pub success: bool,
}

impl std::fmt::Display for TransferResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}\n\
            bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n\
            elapsed: {}",
            self.source_path,
            self.destination_path,
            bytesize::ByteSize(self.bytes_copied),
            self.files_count,
            self.directories_created,
            humantime::format_duration(self.elapsed),
        )
    }
}

mod human_duration {
    pub fn serialize<S: serde::Serializer>(
        duration: &std::time::Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }
}

fn check_cancelled(cancel: &CancellationToken, summary: Summary) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::new(TransferError::Cancelled, summary));
    }
    Ok(())
}

/// Creates `path` unless a directory is already there.
///
/// Returns `true` if the directory was created.
async fn ensure_directory(dst: &dyn RemoteStorage, path: &Path) -> Result<bool, TransferError> {
    match dst.create_directory(path).await {
        Ok(()) => Ok(true),
        Err(StorageError::AlreadyExists(_)) => {
            let info = dst
                .get_file_info(path)
                .await
                .map_err(|error| TransferError::storage("reading metadata of", path, error))?;
            if info.is_dir {
                Ok(false)
            } else {
                Err(TransferError::Conflict(path.to_path_buf()))
            }
        }
        Err(error) => Err(TransferError::storage("creating directory", path, error)),
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip(prog_track, src, dst, cancel))]
pub async fn copy_file(
    prog_track: &'static progress::Progress,
    src: &dyn RemoteStorage,
    src_path: &Path,
    dst: &dyn RemoteStorage,
    dst_path: &Path,
    size: u64,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Summary, TransferError> {
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    let _open_stream_guard = throttle::open_stream_permit().await;
    throttle::get_transfer_tokens(settings.chunk_size, size).await;
    let mode = if settings.overwrite {
        WriteMode::Truncate
    } else {
        let exists = dst
            .file_exists(dst_path)
            .await
            .map_err(|error| TransferError::storage("checking", dst_path, error))?;
        if exists {
            return Err(TransferError::Conflict(dst_path.to_path_buf()));
        }
        WriteMode::CreateNew
    };
    tracing::debug!("opening 'src' for reading and 'dst' for writing");
    let mut reader = src
        .read_file(src_path)
        .await
        .map_err(|error| TransferError::storage("opening", src_path, error))?;
    let written = tokio::select! {
        written = dst.write_file(dst_path, &mut *reader, mode) => written,
        () = cancel.cancelled() => return Err(TransferError::Cancelled),
    };
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(StorageError::AlreadyExists(_)) => {
            return Err(TransferError::Conflict(dst_path.to_path_buf()));
        }
        Err(error) => return Err(TransferError::storage("writing", dst_path, error)),
    };
    prog_track.files_copied.inc();
    prog_track.bytes_copied.add(bytes);
    Ok(Summary {
        bytes_copied: bytes,
        files_copied: 1,
        ..Default::default()
    })
}

fn descend(settings: &Settings, depth: u32) -> bool {
    settings.max_depth.is_none_or(|max| depth < max)
}

/// Copies a file or a directory tree from `src` to `dst`.
///
/// Directories are walked with an explicit worklist, one listing at a time, and entries are
/// visited in name order. The first error aborts the walk and is returned together with
/// the summary of everything copied so far.
#[instrument(skip(prog_track, src, dst, cancel))]
pub async fn transfer(
    prog_track: &'static progress::Progress,
    src: &dyn RemoteStorage,
    src_path: &Path,
    dst: &dyn RemoteStorage,
    dst_path: &Path,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    check_cancelled(cancel, summary)?;
    check_overlap(src, src_path, dst, dst_path).map_err(|error| Error::new(error, summary))?;
    let root = match src.get_file_info(src_path).await {
        Ok(info) => info,
        Err(StorageError::NotFound(_)) => {
            return Err(Error::new(
                TransferError::SourceNotFound(src_path.to_path_buf()),
                summary,
            ));
        }
        Err(error) => {
            return Err(Error::new(
                TransferError::storage("reading metadata of", src_path, error),
                summary,
            ));
        }
    };
    if !root.is_dir {
        tracing::debug!("source is a single file");
        return copy_file(
            prog_track, src, src_path, dst, dst_path, root.size, settings, cancel,
        )
        .await
        .map_err(|error| Error::new(error, summary));
    }
    let created = ensure_directory(dst, dst_path)
        .await
        .map_err(|error| Error::new(error, summary))?;
    record_directory(prog_track, &mut summary, created);
    let mut pending = vec![(src_path.to_path_buf(), dst_path.to_path_buf(), 0_u32)];
    while let Some((src_dir, dst_dir, depth)) = pending.pop() {
        check_cancelled(cancel, summary)?;
        let _ops_guard = prog_track.ops.guard();
        throttle::get_ops_token().await;
        tracing::debug!("listing {:?}", &src_dir);
        let mut entries = src
            .list_directory(&src_dir)
            .await
            .map_err(|error| {
                Error::new(TransferError::storage("listing", &src_dir, error), summary)
            })?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut subdirectories = Vec::new();
        for entry in entries {
            check_cancelled(cancel, summary)?;
            let (src_child, dst_child) = child_paths(&src_dir, &dst_dir, &entry)
                .map_err(|error| Error::new(error, summary))?;
            if entry.is_dir {
                let created = ensure_directory(dst, &dst_child)
                    .await
                    .map_err(|error| Error::new(error, summary))?;
                record_directory(prog_track, &mut summary, created);
                if descend(settings, depth) {
                    subdirectories.push((src_child, dst_child, depth + 1));
                }
                continue;
            }
            summary += copy_file(
                prog_track, src, &src_child, dst, &dst_child, entry.size, settings, cancel,
            )
            .await
            .map_err(|error| Error::new(error, summary))?;
        }
        // reversed so the worklist pops subdirectories in name order
        pending.extend(subdirectories.into_iter().rev());
    }
    Ok(summary)
}

fn normal_components(path: &Path) -> Vec<&std::ffi::OsStr> {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Rejects copying a tree onto itself or into its own subtree on the same session.
fn check_overlap(
    src: &dyn RemoteStorage,
    src_path: &Path,
    dst: &dyn RemoteStorage,
    dst_path: &Path,
) -> Result<(), TransferError> {
    if !std::ptr::addr_eq(src, dst) {
        return Ok(());
    }
    if normal_components(dst_path).starts_with(&normal_components(src_path)) {
        return Err(TransferError::Validation(format!(
            "destination {dst_path:?} is the source {src_path:?} or lies inside it"
        )));
    }
    Ok(())
}

fn child_paths(
    src_dir: &Path,
    dst_dir: &Path,
    entry: &FileInfo,
) -> Result<(PathBuf, PathBuf), TransferError> {
    let src_child = child_path(src_dir, &entry.name)
        .map_err(|error| TransferError::storage("resolving", src_dir, error))?;
    let dst_child = child_path(dst_dir, &entry.name)
        .map_err(|error| TransferError::storage("resolving", dst_dir, error))?;
    Ok((src_child, dst_child))
}

fn record_directory(prog_track: &progress::Progress, summary: &mut Summary, created: bool) {
    if created {
        prog_track.directories_created.inc();
        summary.directories_created += 1;
    } else {
        prog_track.directories_unchanged.inc();
        summary.directories_unchanged += 1;
    }
}
