use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::io::AsyncReadExt;

use crate::storage::{
    BoxedReader, Connector, FileInfo, RemoteStorage, StorageConfig, StorageError, WriteMode,
};

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    Ok(tmp_dir)
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

fn key(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

fn modified() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

/// In-memory share that records how it is used.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    nodes: parking_lot::Mutex<BTreeMap<String, Node>>,
    listed: parking_lot::Mutex<Vec<String>>,
    failing: parking_lot::Mutex<Vec<String>>,
    stale_sizes: parking_lot::Mutex<Vec<String>>,
    list_delay: std::time::Duration,
    closed: AtomicBool,
    pub list_calls: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let storage = Self::default();
        storage.nodes.lock().insert(String::new(), Node::Dir);
        storage
    }

    /// Adds a directory and any missing parents.
    pub fn with_dir(self, path: &str) -> Self {
        {
            let mut nodes = self.nodes.lock();
            let mut current = String::new();
            for part in key(Path::new(path)).split('/').filter(|part| !part.is_empty()) {
                if !current.is_empty() {
                    current.push('/');
                }
                current.push_str(part);
                nodes.entry(current.clone()).or_insert(Node::Dir);
            }
        }
        self
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        let path_key = key(Path::new(path));
        let parent = Path::new(&path_key)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_default();
        let storage = self.with_dir(&parent);
        storage
            .nodes
            .lock()
            .insert(path_key, Node::File(contents.to_vec()));
        storage
    }

    /// Makes listing `path` fail with a permission error.
    pub fn with_unreadable(self, path: &str) -> Self {
        self.failing.lock().push(key(Path::new(path)));
        self
    }

    /// Makes listings report `path` as empty, as if it grew after being listed.
    pub fn with_stale_size(self, path: &str) -> Self {
        self.stale_sizes.lock().push(key(Path::new(path)));
        self
    }

    /// Slows every directory listing down so a walk can be observed while it runs.
    pub fn with_list_delay(self, delay: std::time::Duration) -> Self {
        Self {
            list_delay: delay,
            ..self
        }
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&key(Path::new(path))) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(&key(Path::new(path))), Some(Node::Dir))
    }

    pub fn listed(&self) -> Vec<String> {
        self.listed.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn info(name: &str, node: &Node) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: match node {
                Node::Dir => 0,
                Node::File(data) => data.len() as u64,
            },
            modified: Some(modified()),
            is_dir: matches!(node, Node::Dir),
        }
    }
}

/// The fixture share used across engine tests.
///
/// movies
/// |- a.mkv
/// |- b.srt (empty)
/// |- extras
///    |- c.mkv
pub fn movies_share() -> MemoryStorage {
    MemoryStorage::new()
        .with_file("movies/a.mkv", b"aaaaa")
        .with_file("movies/b.srt", b"")
        .with_file("movies/extras/c.mkv", b"ccc")
}

#[async_trait::async_trait]
impl RemoteStorage for MemoryStorage {
    async fn list_directory(&self, path: &Path) -> Result<Vec<FileInfo>, StorageError> {
        self.check_open()?;
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let dir = key(path);
        self.listed.lock().push(dir.clone());
        if self.failing.lock().contains(&dir) {
            return Err(StorageError::PermissionDenied(path.to_path_buf()));
        }
        let nodes = self.nodes.lock();
        match nodes.get(&dir) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(StorageError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "not a directory",
                });
            }
            None => return Err(StorageError::NotFound(path.to_path_buf())),
        }
        let stale = self.stale_sizes.lock().clone();
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let listing = nodes
            .iter()
            .filter_map(|(node_key, node)| {
                let name = node_key.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                let mut info = Self::info(name, node);
                if stale.contains(node_key) {
                    info.size = 0;
                }
                Some(info)
            })
            .collect();
        Ok(listing)
    }

    async fn get_file_info(&self, path: &Path) -> Result<FileInfo, StorageError> {
        self.check_open()?;
        let path_key = key(path);
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&path_key)
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))?;
        let name = path_key.rsplit('/').next().unwrap_or_default();
        Ok(Self::info(name, node))
    }

    async fn read_file(&self, path: &Path) -> Result<BoxedReader, StorageError> {
        self.check_open()?;
        match self.nodes.lock().get(&key(path)) {
            Some(Node::File(data)) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
            Some(Node::Dir) => Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
                reason: "cannot read a directory as a file",
            }),
            None => Err(StorageError::NotFound(path.to_path_buf())),
        }
    }

    async fn write_file(
        &self,
        path: &Path,
        data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        mode: WriteMode,
    ) -> Result<u64, StorageError> {
        self.check_open()?;
        let path_key = key(path);
        let parent = Path::new(&path_key)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_default();
        {
            let nodes = self.nodes.lock();
            if !matches!(nodes.get(&parent), Some(Node::Dir)) {
                return Err(StorageError::NotFound(path.to_path_buf()));
            }
            match (nodes.get(&path_key), mode) {
                (Some(_), WriteMode::CreateNew) | (Some(Node::Dir), WriteMode::Truncate) => {
                    return Err(StorageError::AlreadyExists(path.to_path_buf()));
                }
                _ => {}
            }
        }
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer)
            .await
            .map_err(|error| StorageError::from_io(path, error))?;
        let written = buffer.len() as u64;
        self.nodes.lock().insert(path_key, Node::File(buffer));
        Ok(written)
    }

    async fn create_directory(&self, path: &Path) -> Result<(), StorageError> {
        self.check_open()?;
        let path_key = key(path);
        let parent = Path::new(&path_key)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&path_key) {
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }
        if !matches!(nodes.get(&parent), Some(Node::Dir)) {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        nodes.insert(path_key, Node::Dir);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Connector that hands out fresh [`MemoryStorage`] sessions and counts how often it dials.
#[derive(Debug, Default)]
pub struct CountingConnector {
    pub connects: AtomicUsize,
    pub delay: std::time::Duration,
    pub fail: AtomicBool,
    pub sessions: parking_lot::Mutex<Vec<Arc<MemoryStorage>>>,
}

impl CountingConnector {
    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl Connector for CountingConnector {
    async fn connect(
        &self,
        config: &StorageConfig,
    ) -> Result<Arc<dyn RemoteStorage>, StorageError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Transport {
                path: PathBuf::from(config.share.clone().unwrap_or_default()),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        }
        let session = Arc::new(MemoryStorage::new());
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Connector that always returns the same session.
#[derive(Debug)]
pub struct FixedConnector(pub Arc<MemoryStorage>);

#[async_trait::async_trait]
impl Connector for FixedConnector {
    async fn connect(
        &self,
        _config: &StorageConfig,
    ) -> Result<Arc<dyn RemoteStorage>, StorageError> {
        Ok(self.0.clone())
    }
}

pub fn storage_config(share: &str) -> StorageConfig {
    StorageConfig {
        name: share.to_string(),
        protocol: crate::storage::Protocol::Smb,
        host: Some("nas.local".to_string()),
        port: 445,
        share: Some(share.to_string()),
        username: Some("media".to_string()),
        password: None,
        domain: None,
        mount_point: None,
    }
}

pub fn storage_root(id: i64, name: &str) -> crate::catalog::StorageRoot {
    let now = chrono::Utc::now();
    crate::catalog::StorageRoot {
        id,
        name: name.to_string(),
        protocol: crate::storage::Protocol::Smb,
        host: Some("nas.local".to_string()),
        port: None,
        path: Some(name.to_string()),
        username: Some("media".to_string()),
        password: Some(crate::storage::Secret::new("hunter2")),
        domain: None,
        mount_point: None,
        enabled: true,
        max_depth: -1,
        created_at: now,
        updated_at: now,
        last_scan_at: None,
    }
}
