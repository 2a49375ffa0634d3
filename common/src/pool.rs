//! Shared sessions keyed by endpoint identity.
//!
//! At most one physical session exists per [`ConnectionKey`]. Callers receive a
//! [`PooledClient`] lease; dropping it returns the session to the pool without closing it.
//! When the pool is full, the least recently used idle session is evicted; if every session is
//! leased, `acquire` waits (bounded) for a lease to be returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Notify, OnceCell};

use crate::config::PoolConfig;
use crate::storage::{Connector, RemoteStorage, StorageConfig, StorageError};

/// Identity of a session: two roots with the same key share one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub share: String,
    pub username: String,
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.share
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("all {max_connections} pooled connections are in use")]
    Exhausted { max_connections: usize },
    #[error("failed to connect to {key}")]
    Connect {
        key: ConnectionKey,
        #[source]
        source: StorageError,
    },
}

type Session = Arc<dyn RemoteStorage>;

struct Slot {
    session: Arc<OnceCell<Session>>,
    leases: Arc<AtomicUsize>,
    last_used: Instant,
}

#[derive(Default)]
struct State {
    closed: bool,
    slots: HashMap<ConnectionKey, Slot>,
}

struct Reservation {
    session: Arc<OnceCell<Session>>,
    leases: Arc<AtomicUsize>,
    evicted: Option<(ConnectionKey, Arc<OnceCell<Session>>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub leased: usize,
    pub max_connections: usize,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: parking_lot::Mutex<State>,
    released: Arc<Notify>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A leased session. Derefs to the underlying [`RemoteStorage`].
pub struct PooledClient {
    key: ConnectionKey,
    session: Session,
    leases: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl PooledClient {
    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledClient {
    type Target = dyn RemoteStorage;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }
}

async fn close_session(key: &ConnectionKey, session: &Session) {
    match session.close().await {
        Ok(()) => tracing::debug!("closed session {}", key),
        Err(error) => tracing::warn!("failed closing session {}: {:#}", key, &error),
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: parking_lot::Mutex::new(State::default()),
            released: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            connections: state.slots.len(),
            leased: state
                .slots
                .values()
                .filter(|slot| slot.leases.load(Ordering::Acquire) > 0)
                .count(),
            max_connections: self.config.max_connections,
        }
    }

    fn try_reserve(&self, key: &ConnectionKey) -> Result<Option<Reservation>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let now = Instant::now();
        if let Some(slot) = state.slots.get_mut(key) {
            slot.leases.fetch_add(1, Ordering::AcqRel);
            slot.last_used = now;
            return Ok(Some(Reservation {
                session: slot.session.clone(),
                leases: slot.leases.clone(),
                evicted: None,
            }));
        }
        let mut evicted = None;
        if state.slots.len() >= self.config.max_connections {
            let idle = state
                .slots
                .iter()
                .filter(|(_, slot)| slot.leases.load(Ordering::Acquire) == 0)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(idle_key, _)| idle_key.clone());
            let Some(idle_key) = idle else {
                return Ok(None);
            };
            evicted = state
                .slots
                .remove(&idle_key)
                .map(|slot| (idle_key, slot.session));
        }
        let slot = Slot {
            session: Arc::new(OnceCell::new()),
            leases: Arc::new(AtomicUsize::new(1)),
            last_used: now,
        };
        let reservation = Reservation {
            session: slot.session.clone(),
            leases: slot.leases.clone(),
            evicted,
        };
        state.slots.insert(key.clone(), slot);
        Ok(Some(reservation))
    }

    async fn reserve(&self, key: &ConnectionKey) -> Result<Reservation, PoolError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reservation) = self.try_reserve(key)? {
                return Ok(reservation);
            }
            tracing::debug!("pool is full, waiting for a session to be released");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PoolError::Exhausted {
                    max_connections: self.config.max_connections,
                });
            }
        }
    }

    fn forget_failed(&self, key: &ConnectionKey, reservation: &Reservation) {
        let remaining = reservation.leases.fetch_sub(1, Ordering::AcqRel) - 1;
        let mut state = self.state.lock();
        let ours = state.slots.get(key).is_some_and(|slot| {
            Arc::ptr_eq(&slot.session, &reservation.session) && slot.session.get().is_none()
        });
        if ours && remaining == 0 {
            state.slots.remove(key);
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Leases the session for `key`, connecting with `config` if none is live.
    ///
    /// Concurrent callers for the same key wait on a single connect attempt. A failed attempt
    /// leaves no entry behind so the next caller retries.
    #[tracing::instrument(skip(self, key, config), fields(key = %key))]
    pub async fn acquire(
        &self,
        key: &ConnectionKey,
        config: &StorageConfig,
    ) -> Result<PooledClient, PoolError> {
        let reservation = self.reserve(key).await?;
        if let Some((evicted_key, evicted)) = &reservation.evicted {
            tracing::info!("evicting idle session {}", evicted_key);
            if let Some(session) = evicted.get() {
                close_session(evicted_key, session).await;
            }
        }
        let connector = self.connector.clone();
        let connected = reservation
            .session
            .get_or_try_init(|| async move {
                tracing::info!("connecting to {}", key);
                connector.connect(config).await
            })
            .await
            .cloned();
        let session = match connected {
            Ok(session) => session,
            Err(source) => {
                tracing::warn!("connection to {} failed: {:#}", key, &source);
                self.forget_failed(key, &reservation);
                return Err(PoolError::Connect {
                    key: key.clone(),
                    source,
                });
            }
        };
        let client = PooledClient {
            key: key.clone(),
            session,
            leases: reservation.leases,
            released: self.released.clone(),
        };
        if self.state.lock().closed {
            // the pool shut down while we were connecting
            close_session(key, &client.session).await;
            return Err(PoolError::Closed);
        }
        Ok(client)
    }

    /// Closes every session and refuses further acquires. Safe to call more than once.
    pub async fn release_all(&self) {
        let slots = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.slots)
        };
        if !slots.is_empty() {
            tracing::info!("closing {} pooled sessions", slots.len());
        }
        for (key, slot) in slots {
            if let Some(session) = slot.session.get() {
                close_session(&key, session).await;
            }
        }
        self.released.notify_waiters();
    }
}
