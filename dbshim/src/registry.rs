//! The connection registry: named handles built from [`Settings`].

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::backend::cache::{CacheBackend, RedisStore};
use crate::config::{ConnectionConfig, Settings};
use crate::connection::Connection;
use crate::errors::{DbError, DbResult};

/// All configured connections. Handles carry their own state, so the
/// registry itself is a plain map.
pub struct Registry {
    connections: BTreeMap<String, Connection>,
}

impl Registry {
    /// Builds handles for every configured connection. Two-phase: MySQL
    /// connections first, then cache connections bound to their backing
    /// handle. No I/O happens here; see [`connect_all`](Self::connect_all).
    pub fn from_settings(settings: Settings) -> DbResult<Self> {
        let mut connections = BTreeMap::new();

        for (name, config) in &settings.connections {
            if let ConnectionConfig::MySql(mysql) = config {
                connections.insert(name.clone(), Connection::mysql(name.clone(), mysql.clone()));
            }
        }

        for (name, config) in &settings.connections {
            if let ConnectionConfig::Cache(cache) = config {
                let backing = connections
                    .get(&cache.backing)
                    .cloned()
                    .ok_or_else(|| DbError::UnknownConnection(cache.backing.clone()))?;
                let store = RedisStore::new(&cache.server)?;
                let backend = CacheBackend::new(
                    name.clone(),
                    Box::new(store),
                    backing,
                    cache.min_cache_minutes,
                    cache.max_cache_minutes,
                )?;
                connections.insert(
                    name.clone(),
                    Connection::cache(
                        name.clone(),
                        backend,
                        cache.connect_on_demand,
                        cache.non_fatal,
                    ),
                );
            }
        }

        Ok(Self { connections })
    }

    pub fn get(&self, name: &str) -> DbResult<Connection> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownConnection(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connects every connection not marked connect-on-demand. A
    /// `non_fatal` connection's failure is logged and latched; any other
    /// failure aborts.
    pub async fn connect_all(&self) -> DbResult<()> {
        for (name, conn) in &self.connections {
            if conn.connect_on_demand() {
                continue;
            }
            match conn.connect().await {
                Ok(()) => info!(connection = %name, "connected"),
                Err(e) if conn.non_fatal() => {
                    warn!(connection = %name, error = %e, "connect failed, latched");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn close(&self, name: &str) -> DbResult<()> {
        self.get(name)?.disconnect().await
    }

    pub async fn close_all(&self) -> DbResult<()> {
        for conn in self.connections.values() {
            conn.disconnect().await?;
        }
        Ok(())
    }

    /// Clears the store behind a cache connection.
    pub async fn flush_cache(&self, name: &str) -> DbResult<()> {
        self.get(name)?.flush_cache().await
    }
}
