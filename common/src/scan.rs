//! Background scans of storage roots.
//!
//! Every queued job gets a status snapshot that only its worker writes. Readers get copies,
//! never references into live state. A job is listed by the registry from the moment it is
//! queued until its run is recorded; it leaves the registry before the terminal snapshot is
//! published, so a [`ScanTicket`] that observed the end never finds the job still listed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::catalog::{
    CatalogError, CatalogSink, RecordOutcome, RootRepository, ScanCoverage, StorageRoot,
};
use crate::config::ScanConfig;
use crate::pool::{ConnectionPool, PoolError};
use crate::progress;
use crate::storage::{child_path, FileInfo, Protocol, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    /// Records every entry and removes catalog entries that are gone.
    #[default]
    Full,
    /// Records only entries modified since the root's last scan.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::Cancelled
        )
    }
}

/// Point-in-time copy of a job's progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanStatus {
    pub job_id: JobId,
    pub storage_root: String,
    pub protocol: Protocol,
    pub scan_type: ScanType,
    pub state: ScanState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_path: PathBuf,
    /// Entries handed to the catalog, or skipped as unchanged by an incremental scan.
    pub files_processed: u64,
    /// Entries seen in directory listings.
    pub files_found: u64,
    pub files_updated: u64,
    pub files_deleted: u64,
    pub error_count: u64,
    pub error: Option<String>,
}

/// A request to scan part of a storage root.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub id: JobId,
    pub root: StorageRoot,
    pub path: PathBuf,
    pub scan_type: ScanType,
    /// Levels of subdirectories to descend into; `None` is unlimited.
    pub max_depth: Option<u32>,
}

impl ScanJob {
    #[must_use]
    pub fn new(root: StorageRoot, scan_type: ScanType) -> Self {
        let max_depth = crate::config::depth_limit(root.max_depth);
        Self {
            id: JobId::generate(),
            root,
            path: PathBuf::from("/"),
            scan_type,
            max_depth,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan job {0} is already registered")]
    DuplicateJob(JobId),
    #[error("scan queue is full ({0} jobs)")]
    QueueFull(usize),
    #[error("storage root '{0}' is disabled")]
    RootDisabled(String),
    #[error("scan registry is shut down")]
    ShutDown,
    #[error("failed connecting to storage root")]
    Connect(#[from] PoolError),
    #[error("failed listing {path:?}")]
    Listing {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("catalog update failed")]
    Catalog(#[from] CatalogError),
    #[error("scan cancelled")]
    Cancelled,
}

/// Handle to a queued job that can wait for its final snapshot.
#[derive(Debug, Clone)]
pub struct ScanTicket {
    id: JobId,
    status: watch::Receiver<ScanStatus>,
}

impl ScanTicket {
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    /// Waits until the job reaches a terminal state and returns that snapshot.
    pub async fn wait(mut self) -> ScanStatus {
        if let Ok(status) = self.status.wait_for(|status| status.state.is_terminal()).await {
            return status.clone();
        }
        // the worker is gone; its last write is final
        self.status.borrow().clone()
    }
}

struct ActiveScan {
    status: watch::Receiver<ScanStatus>,
    cancel: CancellationToken,
}

struct Inner {
    pool: Arc<ConnectionPool>,
    roots: Arc<dyn RootRepository>,
    sink: Arc<dyn CatalogSink>,
    config: ScanConfig,
    workers: Arc<Semaphore>,
    active: parking_lot::RwLock<HashMap<JobId, ActiveScan>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ScanRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ScanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRegistry")
            .field("config", &self.inner.config)
            .field("active", &self.inner.active.read().len())
            .finish()
    }
}

/// Lets the worker publish progress without holding the status lock between updates.
struct Reporter<'a> {
    tx: &'a watch::Sender<ScanStatus>,
}

impl Reporter<'_> {
    fn update(&self, change: impl FnOnce(&mut ScanStatus)) {
        self.tx.send_modify(change);
    }

    fn error(&self, prog_track: &progress::Progress) {
        prog_track.scan_errors.inc();
        self.update(|status| status.error_count += 1);
    }
}

impl ScanRegistry {
    pub fn new(
        pool: Arc<ConnectionPool>,
        roots: Arc<dyn RootRepository>,
        sink: Arc<dyn CatalogSink>,
        config: ScanConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                roots,
                sink,
                workers: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                active: parking_lot::RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers `job` and starts it as soon as a worker slot frees up.
    pub fn queue_scan(
        &self,
        prog_track: &'static progress::Progress,
        job: ScanJob,
    ) -> Result<ScanTicket, ScanError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ScanError::ShutDown);
        }
        if !job.root.enabled {
            return Err(ScanError::RootDisabled(job.root.name.clone()));
        }
        let status = ScanStatus {
            job_id: job.id.clone(),
            storage_root: job.root.name.clone(),
            protocol: job.root.protocol,
            scan_type: job.scan_type,
            state: ScanState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            current_path: job.path.clone(),
            files_processed: 0,
            files_found: 0,
            files_updated: 0,
            files_deleted: 0,
            error_count: 0,
            error: None,
        };
        let (tx, rx) = watch::channel(status);
        let cancel = self.inner.shutdown.child_token();
        {
            let mut active = self.inner.active.write();
            if active.contains_key(&job.id) {
                return Err(ScanError::DuplicateJob(job.id));
            }
            if active.len() >= self.inner.config.queue_capacity {
                return Err(ScanError::QueueFull(active.len()));
            }
            active.insert(
                job.id.clone(),
                ActiveScan {
                    status: rx.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        tracing::info!(
            "queued {:?} scan {} of '{}'",
            job.scan_type,
            &job.id,
            &job.root.name
        );
        let ticket = ScanTicket {
            id: job.id.clone(),
            status: rx,
        };
        tokio::spawn(run_job(prog_track, self.inner.clone(), job, tx, cancel));
        Ok(ticket)
    }

    /// Snapshot of a queued or running job; `None` once it has finished or was never queued.
    #[must_use]
    pub fn get_active_status(&self, id: &JobId) -> Option<ScanStatus> {
        self.inner
            .active
            .read()
            .get(id)
            .map(|scan| scan.status.borrow().clone())
    }

    #[must_use]
    pub fn list_active_statuses(&self) -> HashMap<JobId, ScanStatus> {
        self.inner
            .active
            .read()
            .iter()
            .map(|(id, scan)| (id.clone(), scan.status.borrow().clone()))
            .collect()
    }

    /// Requests cancellation; returns false if the job is not active.
    pub fn cancel(&self, id: &JobId) -> bool {
        match self.inner.active.read().get(id) {
            Some(scan) => {
                scan.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every job, refuses new ones, and waits for the workers to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let receivers: Vec<_> = self
            .inner
            .active
            .read()
            .values()
            .map(|scan| scan.status.clone())
            .collect();
        for mut status in receivers {
            // an error means the worker already dropped its sender
            let _ = status.wait_for(|status| status.state.is_terminal()).await;
        }
    }
}

#[instrument(skip_all, fields(job = %job.id, root = %job.root.name))]
async fn run_job(
    prog_track: &'static progress::Progress,
    inner: Arc<Inner>,
    job: ScanJob,
    tx: watch::Sender<ScanStatus>,
    cancel: CancellationToken,
) {
    let reporter = Reporter { tx: &tx };
    let permit = tokio::select! {
        permit = inner.workers.clone().acquire_owned() => permit.ok(),
        () = cancel.cancelled() => None,
    };
    let outcome = match permit {
        Some(_permit) => {
            reporter.update(|status| {
                status.state = ScanState::Running;
                status.started_at = Some(Utc::now());
            });
            tracing::info!("scan started");
            scan(prog_track, &inner, &job, &reporter, &cancel).await
        }
        None => Err(ScanError::Cancelled),
    };
    let finished_at = Utc::now();
    let mut final_status = tx.borrow().clone();
    final_status.finished_at = Some(finished_at);
    match &outcome {
        Ok(()) => final_status.state = ScanState::Completed,
        Err(ScanError::Cancelled) => final_status.state = ScanState::Cancelled,
        Err(error) => {
            final_status.state = ScanState::Failed;
            final_status.error = Some(format!("{error:#}"));
        }
    }
    match &outcome {
        Ok(()) => tracing::info!(
            "scan completed: {} found, {} updated, {} deleted, {} errors",
            final_status.files_found,
            final_status.files_updated,
            final_status.files_deleted,
            final_status.error_count
        ),
        Err(ScanError::Cancelled) => tracing::info!("scan cancelled"),
        Err(error) => tracing::error!("scan failed: {:#}", error),
    }
    if let Err(error) = inner.sink.record_run(&final_status).await {
        tracing::warn!("failed recording scan run: {:#}", &error);
    }
    if outcome.is_ok()
        && let Err(error) = inner.roots.mark_scanned(job.root.id, finished_at).await
    {
        tracing::warn!("failed updating last scan time: {:#}", &error);
    }
    inner.active.write().remove(&job.id);
    tx.send_modify(|status| *status = final_status);
}

fn within_depth(max_depth: Option<u32>, depth: u32) -> bool {
    max_depth.is_none_or(|max| depth < max)
}

fn is_new(scan_type: ScanType, since: Option<DateTime<Utc>>, info: &FileInfo) -> bool {
    match (scan_type, since, info.modified) {
        (ScanType::Incremental, Some(since), Some(modified)) => modified > since,
        _ => true,
    }
}

async fn scan(
    prog_track: &'static progress::Progress,
    inner: &Inner,
    job: &ScanJob,
    reporter: &Reporter<'_>,
    cancel: &CancellationToken,
) -> Result<(), ScanError> {
    let client = inner
        .pool
        .acquire(&job.root.connection_key(), &job.root.storage_config())
        .await?;
    let mut coverage = ScanCoverage::default();
    let mut pending = vec![(job.path.clone(), 0_u32)];
    while let Some((dir, depth)) = pending.pop() {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        reporter.update(|status| status.current_path = dir.clone());
        let _ops_guard = prog_track.ops.guard();
        throttle::get_ops_token().await;
        let entries = match client.list_directory(&dir).await {
            Ok(entries) => entries,
            Err(source) if depth == 0 || source.is_connection_level() => {
                return Err(ScanError::Listing { path: dir, source });
            }
            Err(error) => {
                tracing::warn!("failed listing {:?}: {:#}", &dir, &error);
                reporter.error(prog_track);
                coverage.unlisted.push(dir);
                continue;
            }
        };
        let mut subdirectories = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            prog_track.scan_entries.inc();
            reporter.update(|status| status.files_found += 1);
            let path = match child_path(&dir, &entry.name) {
                Ok(path) => path,
                Err(error) => {
                    tracing::warn!("skipping entry: {:#}", &error);
                    reporter.error(prog_track);
                    continue;
                }
            };
            if job.scan_type == ScanType::Full {
                coverage.seen.insert(path.clone());
            }
            if entry.is_dir {
                if within_depth(job.max_depth, depth) {
                    subdirectories.push((path.clone(), depth + 1));
                } else {
                    coverage.unlisted.push(path.clone());
                }
            }
            if !is_new(job.scan_type, job.root.last_scan_at, &entry) {
                reporter.update(|status| status.files_processed += 1);
                continue;
            }
            match inner.sink.record_entry(&job.root, &path, &entry).await {
                Ok(outcome) => reporter.update(|status| {
                    status.files_processed += 1;
                    if outcome == RecordOutcome::Updated {
                        status.files_updated += 1;
                    }
                }),
                Err(error) => {
                    tracing::warn!("failed recording {:?}: {:#}", &path, &error);
                    reporter.error(prog_track);
                }
            }
        }
        pending.extend(subdirectories.into_iter().rev());
    }
    if job.scan_type == ScanType::Full {
        match inner.sink.remove_unseen(&job.root, &job.path, &coverage).await {
            Ok(deleted) => reporter.update(|status| status.files_deleted = deleted),
            Err(error) => {
                tracing::warn!("failed removing deleted entries: {:#}", &error);
                reporter.error(prog_track);
            }
        }
    }
    Ok(())
}
