use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::Connection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection `{0}` not found")]
    NotFound(String),
    #[error("connection store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection store is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Where tenant connections live.
///
/// Calls are treated as possibly-failing; callers on the reconcile path log
/// the failures instead of propagating them.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Connection>, StoreError>;

    async fn list_active(&self) -> Result<Vec<Connection>, StoreError> {
        Ok(self.list().await?.into_iter().filter(|c| c.active).collect())
    }

    async fn get(&self, client_id: &str) -> Result<Option<Connection>, StoreError>;

    /// Insert or replace by client id. Returns the stored record.
    async fn upsert(&self, connection: Connection) -> Result<Connection, StoreError>;

    async fn update_activity(
        &self,
        client_id: &str,
        active: bool,
        system_url: &str,
    ) -> Result<(), StoreError>;

    async fn remove(&self, client_id: &str) -> Result<bool, StoreError>;
}

fn stamp(mut connection: Connection, previous: Option<&Connection>, next_id: impl FnOnce() -> u64) -> Connection {
    let now = Utc::now();
    match previous {
        Some(prev) => {
            connection.id = prev.id;
            connection.created_at = prev.created_at;
        }
        None => {
            connection.id = next_id();
            connection.created_at = now;
        }
    }
    connection.updated_at = now;
    connection
}

#[derive(Debug)]
pub struct InMemoryConnectionStore {
    connections: DashMap<String, Connection>,
    next_id: AtomicU64,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_connections(connections: impl IntoIterator<Item = Connection>) -> Self {
        let store = Self::new();
        for conn in connections {
            store.put(conn);
        }
        store
    }

    /// Stamp and store under the entry lock so ids are handed out once per
    /// client id.
    fn put(&self, connection: Connection) -> Connection {
        match self.connections.entry(connection.client_id.clone()) {
            Entry::Occupied(mut entry) => {
                let stored = stamp(connection, Some(entry.get()), || entry.get().id);
                entry.insert(stored.clone());
                stored
            }
            Entry::Vacant(entry) => {
                let stored = stamp(connection, None, || self.next_id.fetch_add(1, Ordering::SeqCst));
                entry.insert(stored.clone());
                stored
            }
        }
    }
}

impl Default for InMemoryConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn list(&self) -> Result<Vec<Connection>, StoreError> {
        let mut all: Vec<Connection> = self.connections.iter().map(|kv| kv.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }

    async fn get(&self, client_id: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.connections.get(client_id).map(|c| c.clone()))
    }

    async fn upsert(&self, connection: Connection) -> Result<Connection, StoreError> {
        Ok(self.put(connection))
    }

    async fn update_activity(
        &self,
        client_id: &str,
        active: bool,
        system_url: &str,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .connections
            .get_mut(client_id)
            .ok_or_else(|| StoreError::NotFound(client_id.to_string()))?;
        entry.active = active;
        entry.system_url = system_url.to_string();
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<bool, StoreError> {
        Ok(self.connections.remove(client_id).is_some())
    }
}

/// Connections kept in a single JSON document on disk.
///
/// Every write rewrites the whole file through a temp file + rename, so a
/// crash mid-write leaves the previous version in place.
#[derive(Debug)]
pub struct JsonFileConnectionStore {
    path: PathBuf,
    connections: Mutex<BTreeMap<String, Connection>>,
}

impl JsonFileConnectionStore {
    /// Open (or lazily create) the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let connections = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<Connection> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|c| (c.client_id.clone(), c)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No connection store at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        debug!("Loaded {} connections from {}", connections.len(), path.display());
        Ok(Self {
            path,
            connections: Mutex::new(connections),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, connections: &BTreeMap<String, Connection>) -> Result<(), StoreError> {
        let mut list: Vec<&Connection> = connections.values().collect();
        list.sort_by_key(|c| c.id);
        let body = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for JsonFileConnectionStore {
    async fn list(&self) -> Result<Vec<Connection>, StoreError> {
        let guard = self.connections.lock().await;
        let mut all: Vec<Connection> = guard.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }

    async fn get(&self, client_id: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.connections.lock().await.get(client_id).cloned())
    }

    async fn upsert(&self, connection: Connection) -> Result<Connection, StoreError> {
        let mut guard = self.connections.lock().await;
        let next_id = guard.values().map(|c| c.id).max().unwrap_or(0) + 1;
        let previous = guard.get(&connection.client_id).cloned();
        let stored = stamp(connection, previous.as_ref(), || next_id);
        let mut updated = guard.clone();
        updated.insert(stored.client_id.clone(), stored.clone());
        self.flush(&updated).await?;
        *guard = updated;
        Ok(stored)
    }

    async fn update_activity(
        &self,
        client_id: &str,
        active: bool,
        system_url: &str,
    ) -> Result<(), StoreError> {
        let mut guard = self.connections.lock().await;
        let mut updated = guard.clone();
        let entry = updated
            .get_mut(client_id)
            .ok_or_else(|| StoreError::NotFound(client_id.to_string()))?;
        entry.active = active;
        entry.system_url = system_url.to_string();
        entry.updated_at = Utc::now();
        self.flush(&updated).await?;
        *guard = updated;
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<bool, StoreError> {
        let mut guard = self.connections.lock().await;
        if !guard.contains_key(client_id) {
            return Ok(false);
        }
        let mut updated = guard.clone();
        updated.remove(client_id);
        self.flush(&updated).await?;
        *guard = updated;
        Ok(true)
    }
}
