//! Streaming ZIP archives of remote directory trees.
//!
//! Entries are written as they are read from the share, so neither the archive nor any single
//! file is ever held in memory. Directories are stored, files are deflated. A failure after
//! the first bytes have been written leaves a truncated archive behind: the sink cannot be
//! rewound.

use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipDateTime, ZipEntryBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::progress;
use crate::storage::{child_path, FileInfo, RemoteStorage, StorageError};

pub type ArchiveSink = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

type Writer = ZipFileWriter<Compat<ArchiveSink>>;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("adding {path:?} would exceed the archive size limit of {limit}")]
    SizeLimitExceeded {
        path: PathBuf,
        limit: bytesize::ByteSize,
    },
    #[error("failed {action} {path:?}")]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("failed writing archive entry '{name}'")]
    Entry {
        name: String,
        #[source]
        source: async_zip::error::ZipError,
    },
    #[error("failed streaming '{name}' into the archive")]
    Stream {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed finishing the archive")]
    Finish(#[source] std::io::Error),
    #[error("archive build cancelled")]
    Cancelled,
}

impl ArchiveError {
    fn storage(action: &'static str, path: &Path, source: StorageError) -> Self {
        ArchiveError::Storage {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Descend into subdirectories; when false they are recorded but left empty.
    pub recursive: bool,
    /// Levels of subdirectories to descend into; `None` is unlimited.
    pub max_depth: Option<u32>,
    /// Upper bound on the summed size of all archived files.
    pub max_total_bytes: u64,
    pub chunk_size: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    pub files_added: usize,
    pub directories_added: usize,
    pub bytes_added: u64,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files archived: {}\n\
            directories archived: {}\n\
            bytes archived: {}",
            self.files_added,
            self.directories_added,
            bytesize::ByteSize(self.bytes_added),
        )
    }
}

fn entry_builder(name: String, compression: Compression, info: &FileInfo) -> ZipEntryBuilder {
    let builder = ZipEntryBuilder::new(name.into(), compression);
    match &info.modified {
        Some(modified) => builder.last_modification_date(ZipDateTime::from_chrono(modified)),
        None => builder,
    }
}

fn entry_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Streams one file into the archive, reading at most `remaining` bytes plus one so a file that
/// grew since it was listed still trips the size limit.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(prog_track, writer, source, entry, cancel))]
async fn add_file(
    prog_track: &'static progress::Progress,
    writer: &mut Writer,
    source: &dyn RemoteStorage,
    path: &Path,
    name: String,
    entry: &FileInfo,
    remaining: u64,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let _open_stream_guard = throttle::open_stream_permit().await;
    throttle::get_transfer_tokens(settings.chunk_size, entry.size).await;
    let reader = source
        .read_file(path)
        .await
        .map_err(|error| ArchiveError::storage("opening", path, error))?
        .take(remaining.saturating_add(1));
    let mut entry_writer = writer
        .write_entry_stream(entry_builder(name.clone(), Compression::Deflate, entry))
        .await
        .map_err(|source| ArchiveError::Entry {
            name: name.clone(),
            source,
        })?;
    let copied = tokio::select! {
        copied = futures::io::copy(reader.compat(), &mut entry_writer) => copied,
        () = cancel.cancelled() => return Err(ArchiveError::Cancelled),
    };
    let bytes = copied.map_err(|source| ArchiveError::Stream {
        name: name.clone(),
        source,
    })?;
    if bytes > remaining {
        return Err(ArchiveError::SizeLimitExceeded {
            path: path.to_path_buf(),
            limit: bytesize::ByteSize(settings.max_total_bytes),
        });
    }
    entry_writer
        .close()
        .await
        .map_err(|source| ArchiveError::Entry { name, source })?;
    prog_track.archive_entries.inc();
    prog_track.archive_bytes.add(bytes);
    Ok(bytes)
}

#[allow(clippy::too_many_arguments)]
#[async_recursion]
async fn add_directory(
    prog_track: &'static progress::Progress,
    writer: &mut Writer,
    source: &dyn RemoteStorage,
    path: &Path,
    prefix: &str,
    depth: u32,
    settings: &Settings,
    cancel: &CancellationToken,
    summary: &mut Summary,
) -> Result<(), ArchiveError> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    let _ops_guard = prog_track.ops.guard();
    throttle::get_ops_token().await;
    tracing::debug!("listing {:?}", path);
    let mut entries = source
        .list_directory(path)
        .await
        .map_err(|error| ArchiveError::storage("listing", path, error))?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let child = child_path(path, &entry.name)
            .map_err(|error| ArchiveError::storage("resolving", path, error))?;
        let name = entry_name(prefix, &entry.name);
        if entry.is_dir {
            let dir_entry = entry_builder(format!("{name}/"), Compression::Stored, &entry);
            writer
                .write_entry_whole(dir_entry, &[])
                .await
                .map_err(|source| ArchiveError::Entry {
                    name: name.clone(),
                    source,
                })?;
            prog_track.archive_entries.inc();
            summary.directories_added += 1;
            let within_depth = settings.max_depth.is_none_or(|max| depth < max);
            if settings.recursive && within_depth {
                add_directory(
                    prog_track,
                    writer,
                    source,
                    &child,
                    &name,
                    depth + 1,
                    settings,
                    cancel,
                    summary,
                )
                .await?;
            }
            continue;
        }
        if summary.bytes_added.saturating_add(entry.size) > settings.max_total_bytes {
            return Err(ArchiveError::SizeLimitExceeded {
                path: child,
                limit: bytesize::ByteSize(settings.max_total_bytes),
            });
        }
        let remaining = settings.max_total_bytes.saturating_sub(summary.bytes_added);
        let bytes = add_file(
            prog_track, writer, source, &child, name, &entry, remaining, settings, cancel,
        )
        .await?;
        summary.files_added += 1;
        summary.bytes_added += bytes;
    }
    Ok(())
}

/// Writes a ZIP archive of the directory at `root` into `sink`.
///
/// Entry names are relative to `root`. The sink is shut down once the central directory has
/// been written.
#[instrument(skip(prog_track, source, sink, cancel))]
pub async fn build(
    prog_track: &'static progress::Progress,
    source: &dyn RemoteStorage,
    root: &Path,
    sink: ArchiveSink,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Summary, ArchiveError> {
    let info = source
        .get_file_info(root)
        .await
        .map_err(|error| ArchiveError::storage("reading metadata of", root, error))?;
    if !info.is_dir {
        return Err(ArchiveError::NotADirectory(root.to_path_buf()));
    }
    let mut writer = ZipFileWriter::new(sink.compat_write());
    let mut summary = Summary::default();
    add_directory(
        prog_track,
        &mut writer,
        source,
        root,
        "",
        0,
        settings,
        cancel,
        &mut summary,
    )
    .await?;
    let mut sink = writer
        .close()
        .await
        .map_err(|source| ArchiveError::Entry {
            name: "central directory".to_string(),
            source,
        })?
        .into_inner();
    sink.shutdown().await.map_err(ArchiveError::Finish)?;
    tracing::info!(
        "archived {} files and {} directories from {:?}",
        summary.files_added,
        summary.directories_added,
        root
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{self, MemoryStorage};
    use std::io::Read;
    use tracing_test::traced_test;

    static PROGRESS: std::sync::LazyLock<progress::Progress> =
        std::sync::LazyLock::new(progress::Progress::new);

    fn settings() -> Settings {
        Settings {
            recursive: true,
            max_depth: None,
            max_total_bytes: u64::MAX,
            chunk_size: 0,
        }
    }

    async fn build_into_file(
        source: &MemoryStorage,
        root: &str,
        settings: &Settings,
    ) -> Result<(Result<Summary, ArchiveError>, tempfile::NamedTempFile), anyhow::Error> {
        let archive = tempfile::NamedTempFile::new()?;
        let sink = tokio::fs::File::create(archive.path()).await?;
        let result = build(
            &PROGRESS,
            source,
            Path::new(root),
            Box::new(sink),
            settings,
            &CancellationToken::new(),
        )
        .await;
        Ok((result, archive))
    }

    fn read_entries(path: &Path) -> Result<Vec<(String, Vec<u8>)>, anyhow::Error> {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            entries.push((file.name().to_string(), data));
        }
        Ok(entries)
    }

    #[tokio::test]
    #[traced_test]
    async fn archives_every_entry_once() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share();
        let (result, archive) = build_into_file(&source, "movies", &settings()).await?;
        let summary = result?;
        assert_eq!(summary.files_added, 3);
        assert_eq!(summary.directories_added, 1);
        assert_eq!(summary.bytes_added, 8);
        let entries = read_entries(archive.path())?;
        let names: Vec<_> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a.mkv", "b.srt", "extras/", "extras/c.mkv"]);
        assert_eq!(entries[0].1, b"aaaaa");
        assert!(entries[1].1.is_empty());
        assert_eq!(entries[3].1, b"ccc");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directories_are_stored_and_files_deflated() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share();
        let (result, archive) = build_into_file(&source, "movies", &settings()).await?;
        result?;
        let mut zip = zip::ZipArchive::new(std::fs::File::open(archive.path())?)?;
        let dir = zip.by_name("extras/")?;
        assert!(dir.is_dir());
        assert_eq!(dir.compression(), zip::CompressionMethod::Stored);
        drop(dir);
        let file = zip.by_name("a.mkv")?;
        assert_eq!(file.compression(), zip::CompressionMethod::Deflated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn non_recursive_records_directories_without_contents() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share();
        let (result, archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                recursive: false,
                ..settings()
            },
        )
        .await?;
        let summary = result?;
        assert_eq!(summary.files_added, 2);
        let entries = read_entries(archive.path())?;
        let names: Vec<_> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a.mkv", "b.srt", "extras/"]);
        assert_eq!(source.listed(), vec!["movies".to_string()]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn depth_zero_lists_only_the_root() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share().with_file("movies/extras/deep/d.mkv", b"d");
        let (result, _archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                max_depth: Some(0),
                ..settings()
            },
        )
        .await?;
        result?;
        assert_eq!(source.list_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
        let source = testutils::movies_share().with_file("movies/extras/deep/d.mkv", b"d");
        let (result, archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                max_depth: Some(1),
                ..settings()
            },
        )
        .await?;
        result?;
        assert_eq!(source.listed(), vec!["movies", "movies/extras"]);
        let names: Vec<_> = read_entries(archive.path())?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert!(names.contains(&"extras/deep/".to_string()));
        assert!(!names.contains(&"extras/deep/d.mkv".to_string()));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn size_limit_is_checked_before_writing() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share();
        let (result, _archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                max_total_bytes: 7,
                ..settings()
            },
        )
        .await?;
        match result {
            Err(ArchiveError::SizeLimitExceeded { path, .. }) => {
                assert_eq!(path, Path::new("movies/extras/c.mkv"));
            }
            other => panic!("expected size limit error, got {other:?}"),
        }
        // an exact fit is allowed
        let (result, _archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                max_total_bytes: 8,
                ..settings()
            },
        )
        .await?;
        assert_eq!(result?.bytes_added, 8);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn file_grown_since_listing_still_hits_the_limit() -> Result<(), anyhow::Error> {
        // listed as empty, streams five bytes
        let source = testutils::movies_share().with_stale_size("movies/a.mkv");
        let (result, _archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                max_total_bytes: 3,
                ..settings()
            },
        )
        .await?;
        match result {
            Err(ArchiveError::SizeLimitExceeded { path, .. }) => {
                assert_eq!(path, Path::new("movies/a.mkv"));
            }
            other => panic!("expected size limit error, got {other:?}"),
        }
        let (result, _archive) = build_into_file(
            &source,
            "movies",
            &Settings {
                max_total_bytes: 8,
                ..settings()
            },
        )
        .await?;
        assert_eq!(result?.bytes_added, 8);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rejects_files_and_missing_roots() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share();
        let (result, _archive) = build_into_file(&source, "movies/a.mkv", &settings()).await?;
        assert!(matches!(result, Err(ArchiveError::NotADirectory(_))));
        let (result, _archive) = build_into_file(&source, "shows", &settings()).await?;
        assert!(matches!(
            result,
            Err(ArchiveError::Storage {
                source: StorageError::NotFound(_),
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancellation_stops_the_walk() -> Result<(), anyhow::Error> {
        let source = testutils::movies_share();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = build(
            &PROGRESS,
            &source,
            Path::new("movies"),
            Box::new(tokio::io::sink()),
            &settings(),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
        assert_eq!(source.list_calls.load(std::sync::atomic::Ordering::Relaxed), 0);
        Ok(())
    }
}
