//! Storage roots and the catalog the scanner feeds.
//!
//! Roots are read from a repository (a TOML file for the command line tool); scan results go to
//! a [`CatalogSink`]. Both are traits so a relational store can stand in for the in-memory
//! implementations provided here.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::pool::ConnectionKey;
use crate::storage::{FileInfo, Protocol, Secret, StorageConfig};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("storage root {0} not found")]
    RootNotFound(RootRef),
    #[error("invalid storage roots: {0}")]
    Invalid(String),
    #[error("failed reading {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing storage roots")]
    Parse(#[from] toml::de::Error),
    #[error("catalog store failure: {0}")]
    Store(String),
}

fn default_enabled() -> bool {
    true
}

fn default_max_depth() -> i32 {
    -1
}

/// A configured share and its scan bookkeeping.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StorageRoot {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Share name for network protocols, base directory for local roots.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Scan depth limit, negative for unlimited.
    #[serde(default = "default_max_depth")]
    pub max_depth: i32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl StorageRoot {
    #[must_use]
    pub fn connection_key(&self) -> ConnectionKey {
        let share = match (&self.path, &self.mount_point) {
            (Some(path), _) => path.clone(),
            (None, Some(mount_point)) => mount_point.to_string_lossy().into_owned(),
            (None, None) => String::new(),
        };
        ConnectionKey {
            host: self.host.clone().unwrap_or_else(|| "localhost".to_string()),
            port: self.port.unwrap_or_else(|| self.protocol.default_port()),
            share,
            username: self.username.clone().unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            name: self.name.clone(),
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| self.protocol.default_port()),
            share: self.path.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            domain: self.domain.clone(),
            mount_point: self.mount_point.clone(),
        }
    }
}

/// Reference to a storage root by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RootRef {
    Id(i64),
    Name(String),
}

impl std::str::FromStr for RootRef {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.parse::<i64>() {
            Ok(id) => RootRef::Id(id),
            Err(_) => RootRef::Name(value.to_string()),
        })
    }
}

impl std::fmt::Display for RootRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootRef::Id(id) => write!(f, "#{id}"),
            RootRef::Name(name) => write!(f, "'{name}'"),
        }
    }
}

#[async_trait::async_trait]
pub trait RootRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<StorageRoot>, CatalogError>;
    async fn get_by_name(&self, name: &str) -> Result<Option<StorageRoot>, CatalogError>;
    async fn list(&self) -> Result<Vec<StorageRoot>, CatalogError>;
    async fn mark_scanned(&self, id: i64, at: DateTime<Utc>) -> Result<(), CatalogError>;
}

/// Looks a root up by id or name.
pub async fn resolve_storage_root(
    roots: &dyn RootRepository,
    reference: &RootRef,
) -> Result<StorageRoot, CatalogError> {
    let found = match reference {
        RootRef::Id(id) => roots.get_by_id(*id).await?,
        RootRef::Name(name) => roots.get_by_name(name).await?,
    };
    found.ok_or_else(|| CatalogError::RootNotFound(reference.clone()))
}

#[derive(Debug, serde::Deserialize)]
struct RootsFile {
    #[serde(default, rename = "root")]
    roots: Vec<StorageRoot>,
}

/// Roots held in memory, typically loaded from a TOML file of `[[root]]` tables.
#[derive(Debug, Default)]
pub struct MemoryRootRepository {
    roots: parking_lot::RwLock<Vec<StorageRoot>>,
}

impl MemoryRootRepository {
    pub fn new(roots: Vec<StorageRoot>) -> Result<Self, CatalogError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for root in &roots {
            if root.name.is_empty() {
                return Err(CatalogError::Invalid(format!(
                    "root #{} has an empty name",
                    root.id
                )));
            }
            if !ids.insert(root.id) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate root id {}",
                    root.id
                )));
            }
            if !names.insert(root.name.clone()) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate root name '{}'",
                    root.name
                )));
            }
        }
        Ok(Self {
            roots: parking_lot::RwLock::new(roots),
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, CatalogError> {
        let file: RootsFile = toml::from_str(contents)?;
        Self::new(file.roots)
    }

    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| CatalogError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::from_toml_str(&contents)
    }
}

#[async_trait::async_trait]
impl RootRepository for MemoryRootRepository {
    async fn get_by_id(&self, id: i64) -> Result<Option<StorageRoot>, CatalogError> {
        Ok(self.roots.read().iter().find(|root| root.id == id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<StorageRoot>, CatalogError> {
        Ok(self
            .roots
            .read()
            .iter()
            .find(|root| root.name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<StorageRoot>, CatalogError> {
        let mut roots = self.roots.read().clone();
        roots.sort_by_key(|root| root.id);
        Ok(roots)
    }

    async fn mark_scanned(&self, id: i64, at: DateTime<Utc>) -> Result<(), CatalogError> {
        let mut roots = self.roots.write();
        let root = roots
            .iter_mut()
            .find(|root| root.id == id)
            .ok_or(CatalogError::RootNotFound(RootRef::Id(id)))?;
        root.last_scan_at = Some(at);
        root.updated_at = at;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Destination of scan results.
#[async_trait::async_trait]
pub trait CatalogSink: Send + Sync {
    async fn record_entry(
        &self,
        root: &StorageRoot,
        path: &Path,
        info: &FileInfo,
    ) -> Result<RecordOutcome, CatalogError>;

    /// Drops entries under `scope` that a full scan could have seen but did not. Returns how
    /// many were removed.
    async fn remove_unseen(
        &self,
        root: &StorageRoot,
        scope: &Path,
        coverage: &ScanCoverage,
    ) -> Result<u64, CatalogError>;

    /// Persists the final status of a scan run.
    async fn record_run(&self, run: &crate::scan::ScanStatus) -> Result<(), CatalogError>;
}

/// What a full scan looked at below its scope.
#[derive(Debug, Default, Clone)]
pub struct ScanCoverage {
    /// Paths of every listed entry.
    pub seen: HashSet<PathBuf>,
    /// Directories whose contents were never listed, either because listing failed or because
    /// they sit at the depth limit. Nothing below them may be pruned.
    pub unlisted: Vec<PathBuf>,
}

impl ScanCoverage {
    /// True when `path` was within reach of the scan and still not found.
    #[must_use]
    pub fn is_unseen(&self, path: &Path) -> bool {
        !self.seen.contains(path) && !self.unlisted.iter().any(|dir| path.starts_with(dir))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogEntry {
    size: u64,
    modified: Option<DateTime<Utc>>,
    is_dir: bool,
}

/// Catalog kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: parking_lot::Mutex<HashMap<(i64, PathBuf), CatalogEntry>>,
    runs: parking_lot::Mutex<Vec<crate::scan::ScanStatus>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn entry_count(&self, root_id: i64) -> usize {
        self.entries
            .lock()
            .keys()
            .filter(|(id, _)| *id == root_id)
            .count()
    }

    #[must_use]
    pub fn contains(&self, root_id: i64, path: &Path) -> bool {
        self.entries
            .lock()
            .contains_key(&(root_id, path.to_path_buf()))
    }

    #[must_use]
    pub fn runs(&self) -> Vec<crate::scan::ScanStatus> {
        self.runs.lock().clone()
    }
}

#[async_trait::async_trait]
impl CatalogSink for MemoryCatalog {
    async fn record_entry(
        &self,
        root: &StorageRoot,
        path: &Path,
        info: &FileInfo,
    ) -> Result<RecordOutcome, CatalogError> {
        let entry = CatalogEntry {
            size: info.size,
            modified: info.modified,
            is_dir: info.is_dir,
        };
        let previous = self
            .entries
            .lock()
            .insert((root.id, path.to_path_buf()), entry.clone());
        Ok(match previous {
            None => RecordOutcome::Created,
            Some(previous) if previous == entry => RecordOutcome::Unchanged,
            Some(_) => RecordOutcome::Updated,
        })
    }

    async fn remove_unseen(
        &self,
        root: &StorageRoot,
        scope: &Path,
        coverage: &ScanCoverage,
    ) -> Result<u64, CatalogError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, path), _| {
            *id != root.id
                || !path.starts_with(scope)
                || path == scope
                || !coverage.is_unseen(path)
        });
        Ok((before - entries.len()) as u64)
    }

    async fn record_run(&self, run: &crate::scan::ScanStatus) -> Result<(), CatalogError> {
        self.runs.lock().push(run.clone());
        Ok(())
    }
}
