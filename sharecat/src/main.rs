use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use common::catalog::{MemoryCatalog, MemoryRootRepository, RootRef};
use common::location::Locator;
use common::scan::{ScanState, ScanStatus, ScanType};
use common::service::{ArchiveRequest, Catalog, CatalogSettings, TransferRequest};
use common::storage::ProtocolConnector;
use common::transfer::TransferResult;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sharecat",
    version,
    about = "Copy, download, archive and scan media on remote shares",
    long_about = "`sharecat` works against the storage roots listed in a TOML file. A root is a share \
(local directory, or an SMB/NFS share mounted by the OS) addressed as `root:/path`, where `root` is \
the root's name or numeric id. Any other path is a path on the local filesystem.

EXAMPLES:
    # List configured roots
    sharecat --roots roots.toml roots

    # Copy a directory from one root to another
    sharecat copy nas:/movies backup:/movies --progress --summary

    # Download a directory as a ZIP archive, at most two levels deep
    sharecat archive nas:/movies movies.zip --max-depth 1

    # Rescan a root, recording only entries changed since the last scan
    sharecat scan nas --incremental"
)]
struct Args {
    /// TOML file with one `[[root]]` table per storage root
    #[arg(long, value_name = "FILE", default_value = "roots.toml", global = true)]
    roots: PathBuf,

    // Connections
    /// Maximum number of sessions open at the same time
    #[arg(
        long,
        default_value = "10",
        value_name = "N",
        global = true,
        help_heading = "Connections"
    )]
    max_connections: usize,

    /// How long to wait for a free session slot, e.g. "30s"
    #[arg(
        long,
        default_value = "30s",
        value_name = "DURATION",
        global = true,
        help_heading = "Connections"
    )]
    acquire_timeout: humantime::Duration,

    /// Number of scans that may run at the same time
    #[arg(
        long,
        default_value = "4",
        value_name = "N",
        global = true,
        help_heading = "Connections"
    )]
    scan_workers: usize,

    // Progress & output
    /// Show progress
    #[arg(long, global = true, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", global = true, help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for the progress bar and 10s for text updates. Accepts human-readable
    /// durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", global = true, help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of file streams open at the same time (unspecified = no limit)
    #[arg(long, value_name = "N", global = true, help_heading = "Performance & throttling")]
    max_open_streams: Option<usize>,

    /// Throttle the number of directory entries visited per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Limit chunk-sized I/O operations per second (0 = no throttle)
    ///
    /// Requires --chunk-size to calculate I/O operations per file: ((`file_size` - 1) / `chunk_size`) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size for calculating I/O operations per file
    ///
    /// Required when using --iops-throttle (must be > 0)
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        global = true,
        help_heading = "Performance & throttling"
    )]
    chunk_size: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print the configured storage roots as JSON, credentials redacted
    Roots,

    /// Copy a file or directory tree; at least one side must be `root:/path`
    Copy {
        /// Source, `root:/path` or a local path
        source: Locator,
        /// Destination, `root:/path` or a local path
        destination: Locator,
        /// Overwrite existing files
        #[arg(short, long)]
        overwrite: bool,
        /// Levels of subdirectories to copy, negative for unlimited
        #[arg(long, default_value = "-1", value_name = "N", allow_negative_numbers = true)]
        max_depth: i32,
    },

    /// Download a single file from a storage root
    Download {
        /// File to download, `root:/path`
        source: Locator,
        /// Local file to write
        output: PathBuf,
        /// Overwrite the output file if it exists
        #[arg(short, long)]
        overwrite: bool,
    },

    /// Download a directory of a storage root as a ZIP archive
    Archive {
        /// Directory to archive, `root:/path`
        source: Locator,
        /// Local archive file to write
        output: PathBuf,
        /// Only archive the files directly inside the directory
        #[arg(long)]
        no_recursive: bool,
        /// Levels of subdirectories to include, negative for unlimited
        #[arg(long, default_value = "-1", value_name = "N", allow_negative_numbers = true)]
        max_depth: i32,
        /// Refuse to build archives with more file data than this
        #[arg(long, default_value = "4GiB", value_name = "SIZE")]
        max_archive_size: bytesize::ByteSize,
        /// Overwrite the output file if it exists
        #[arg(short, long)]
        overwrite: bool,
    },

    /// Scan a storage root into the catalog and print the final status as JSON
    Scan {
        /// Root name or numeric id
        root: RootRef,
        /// Directory to scan instead of the whole root
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,
        /// Only record entries modified since the last scan
        #[arg(long)]
        incremental: bool,
        /// Levels of subdirectories to scan, negative for unlimited (default: the root's setting)
        #[arg(long, value_name = "N", allow_negative_numbers = true)]
        max_depth: Option<i32>,
    },
}

#[derive(Debug)]
enum Outcome {
    Roots(usize),
    Transfer(TransferResult),
    Download { path: PathBuf, bytes: u64 },
    Archive { path: PathBuf, bytes: u64 },
    Scan(ScanStatus),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Outcome::Roots(count) => write!(f, "storage roots: {count}"),
            Outcome::Transfer(result) => write!(f, "{result}"),
            Outcome::Download { path, bytes } => {
                write!(f, "downloaded {} to {:?}", bytesize::ByteSize(*bytes), path)
            }
            Outcome::Archive { path, bytes } => {
                write!(f, "wrote archive of {} to {:?}", bytesize::ByteSize(*bytes), path)
            }
            Outcome::Scan(status) => write!(
                f,
                "scan {} {:?}\n\
                files found: {}\n\
                files processed: {}\n\
                files updated: {}\n\
                files deleted: {}\n\
                errors: {}",
                status.job_id,
                status.state,
                status.files_found,
                status.files_processed,
                status.files_updated,
                status.files_deleted,
                status.error_count,
            ),
        }
    }
}

fn remote_path(locator: &Locator) -> anyhow::Result<(&RootRef, &Path)> {
    match locator {
        Locator::Remote { root, path } => Ok((root, path)),
        Locator::Local(path) => Err(anyhow!(
            "{:?} is a local path, expected root:/path",
            path
        )),
    }
}

async fn create_output(path: &Path, overwrite: bool) -> anyhow::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).await.with_context(|| {
        if overwrite {
            format!("cannot create {path:?}")
        } else {
            format!("cannot create {path:?}, use --overwrite to replace an existing file")
        }
    })
}

async fn execute(
    catalog: &Catalog,
    command: &Command,
    cancel: &CancellationToken,
) -> anyhow::Result<Outcome> {
    match command {
        Command::Roots => {
            let roots = catalog.list_storage_roots().await?;
            println!("{}", serde_json::to_string_pretty(&roots)?);
            Ok(Outcome::Roots(roots.len()))
        }
        Command::Copy {
            source,
            destination,
            overwrite,
            max_depth,
        } => {
            let request = TransferRequest {
                source: source.clone(),
                destination: destination.clone(),
                overwrite: *overwrite,
                max_depth: common::config::depth_limit(*max_depth),
            };
            let result = catalog.copy(&request, cancel).await?;
            Ok(Outcome::Transfer(result))
        }
        Command::Download {
            source,
            output,
            overwrite,
        } => {
            let (root, path) = remote_path(source)?;
            let download = catalog.stream_download(root, path).await?;
            tracing::info!(
                "downloading {} ({})",
                source,
                bytesize::ByteSize(download.info.size)
            );
            let mut file = create_output(output, *overwrite).await?;
            let bytes = tokio::select! {
                written = download.body.write_to(&mut file) => {
                    written.with_context(|| format!("failed downloading {source}"))?
                }
                _ = cancel.cancelled() => return Err(anyhow!("download of {source} cancelled")),
            };
            Ok(Outcome::Download {
                path: output.clone(),
                bytes,
            })
        }
        Command::Archive {
            source,
            output,
            no_recursive,
            max_depth,
            max_archive_size,
            overwrite,
        } => {
            let (root, path) = remote_path(source)?;
            let request = ArchiveRequest {
                recursive: !no_recursive,
                max_depth: *max_depth,
                max_total_bytes: Some(max_archive_size.as_u64()),
            };
            let body = catalog
                .stream_directory_archive(root, path, request, cancel)
                .await?;
            let mut file = create_output(output, *overwrite).await?;
            match body.write_to(&mut file).await {
                Ok(bytes) => Ok(Outcome::Archive {
                    path: output.clone(),
                    bytes,
                }),
                Err(error) => {
                    drop(file);
                    if let Err(remove_error) = tokio::fs::remove_file(output).await {
                        tracing::warn!(
                            "failed removing incomplete archive {:?}: {}",
                            output,
                            remove_error
                        );
                    }
                    Err(anyhow::Error::new(error)
                        .context(format!("failed archiving {source}")))
                }
            }
        }
        Command::Scan {
            root,
            path,
            incremental,
            max_depth,
        } => {
            let scan_type = if *incremental {
                ScanType::Incremental
            } else {
                ScanType::Full
            };
            let ticket = catalog
                .queue_scan(root, path.clone(), scan_type, *max_depth)
                .await?;
            tracing::info!("queued scan {} of {}", ticket.id(), root);
            let status = tokio::select! {
                status = ticket.clone().wait() => status,
                _ = cancel.cancelled() => {
                    catalog.cancel_scan(ticket.id());
                    ticket.wait().await
                }
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
            match status.state {
                ScanState::Completed => Ok(Outcome::Scan(status)),
                state => Err(anyhow!(
                    "scan of {} ended {:?}: {}",
                    root,
                    state,
                    status.error.as_deref().unwrap_or("no error recorded")
                )),
            }
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<Outcome> {
    if args.max_connections == 0 {
        return Err(anyhow!("--max-connections must be greater than zero"));
    }
    let roots = MemoryRootRepository::load(&args.roots)
        .await
        .with_context(|| format!("failed loading storage roots from {:?}", &args.roots))?;
    let settings = CatalogSettings {
        pool: common::config::PoolConfig {
            max_connections: args.max_connections,
            acquire_timeout: args.acquire_timeout.into(),
        },
        scan: common::config::ScanConfig {
            max_concurrent: args.scan_workers,
            ..Default::default()
        },
        chunk_size: args.chunk_size.as_u64(),
        ..Default::default()
    };
    settings.scan.validate().map_err(|error| anyhow!(error))?;
    let catalog = Catalog::new(
        common::get_progress(),
        Arc::new(roots),
        Arc::new(ProtocolConnector),
        Arc::new(MemoryCatalog::default()),
        settings,
    );
    let cancel = catalog.request_token();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling");
                cancel.cancel();
            }
        })
    };
    let result = execute(&catalog, &args.command, &cancel).await;
    interrupt.abort();
    catalog.shutdown().await;
    result
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_streams: args.max_open_streams,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size.as_u64(),
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
