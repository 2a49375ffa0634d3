use std::path::{Path, PathBuf};

use crate::catalog::RootRef;
use crate::pool::PooledClient;
use crate::storage::{LocalClient, RemoteStorage};

/// One side of a transfer: a path on a storage root or on the local filesystem.
///
/// Written as `root:/path` for storage roots, where `root` is a name or numeric id; anything
/// else is a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Remote { root: RootRef, path: PathBuf },
    Local(PathBuf),
}

impl Locator {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Locator::Remote { path, .. } | Locator::Local(path) => path,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Locator::Local(_))
    }
}

impl std::str::FromStr for Locator {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err("path must not be empty".to_string());
        }
        match value.split_once(':') {
            Some((root, path)) if !root.is_empty() && !root.contains('/') => {
                let root = root.parse::<RootRef>().map_err(|error| format!("{error}"))?;
                let path = if path.is_empty() { "/" } else { path };
                Ok(Locator::Remote {
                    root,
                    path: PathBuf::from(path),
                })
            }
            _ => Ok(Locator::Local(PathBuf::from(value))),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Remote {
                root: RootRef::Id(id),
                path,
            } => write!(f, "{}:{}", id, path.display()),
            Locator::Remote {
                root: RootRef::Name(name),
                path,
            } => write!(f, "{}:{}", name, path.display()),
            Locator::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A resolved [`Locator`]: a leased pooled session or the local filesystem.
#[derive(Debug)]
pub enum Endpoint {
    Remote(PooledClient),
    Local(LocalClient),
}

impl Endpoint {
    #[must_use]
    pub fn storage(&self) -> &dyn RemoteStorage {
        match self {
            Endpoint::Remote(client) => &**client,
            Endpoint::Local(client) => client,
        }
    }
}
