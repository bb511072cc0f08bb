//! Query-result cache decorator.
//!
//! A cache connection sits in front of a backing MySQL connection: SELECT
//! statements are looked up by a key derived from the backing host, schema
//! and query text, and misses run on the backing connection and are stored
//! with a randomized TTL. A dead store degrades to a miss rather than
//! taking the feature down.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::Stats;
use crate::connection::{Connection, QueryOptions};
use crate::errors::{DbError, DbResult};
use crate::result::{QueryOutcome, RowSet};
use crate::sql::StatementKind;

/// The seam between the decorator and the store that holds cached row
/// sets.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>>;
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> DbResult<()>;
    async fn flush(&self) -> DbResult<()>;
    async fn ping(&self) -> DbResult<()>;
}

/// Redis-backed store. The manager is created lazily on first use so a
/// cache connection can be configured without the server being up yet.
pub struct RedisStore {
    client: redis::Client,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    pub fn new(url: &str) -> DbResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| DbError::Config(format!("invalid cache server URL '{}': {}", url, e)))?;
        Ok(Self {
            client,
            manager: Mutex::new(None),
        })
    }

    async fn manager(&self) -> DbResult<ConnectionManager> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let mut conn = self.manager().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> DbResult<()> {
        let mut conn = self.manager().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn flush(&self) -> DbResult<()> {
        let mut conn = self.manager().await?;
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> DbResult<()> {
        let mut conn = self.manager().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// In-process store with expiry, for tests and development.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    expires_at: tokio::time::Instant,
    value: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > tokio::time::Instant::now() => {
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> DbResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                expires_at: tokio::time::Instant::now() + ttl,
                value,
            },
        );
        Ok(())
    }

    async fn flush(&self) -> DbResult<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Key for a query against a backing connection: the backing host and
/// schema disambiguate identical query text against different databases.
pub(crate) fn cache_key(hostname: &str, database: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    hasher.update(b"-");
    hasher.update(database.as_bytes());
    hasher.update(b"-");
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

/// TTL for a stored row set: a random whole number of minutes in
/// `[min, max]`.
fn cache_ttl(min_minutes: u64, max_minutes: u64) -> Duration {
    use rand::Rng;
    let minutes = if min_minutes >= max_minutes {
        min_minutes
    } else {
        rand::thread_rng().gen_range(min_minutes..=max_minutes)
    };
    Duration::from_secs(60 * minutes)
}

pub(crate) struct CacheBackend {
    name: String,
    store: Box<dyn CacheStore>,
    backing: Connection,
    backing_host: String,
    backing_database: String,
    min_minutes: u64,
    max_minutes: u64,
    pub(crate) stats: Stats,
}

impl CacheBackend {
    pub fn new(
        name: String,
        store: Box<dyn CacheStore>,
        backing: Connection,
        min_minutes: u64,
        max_minutes: u64,
    ) -> DbResult<Self> {
        let (backing_host, backing_database) = backing.mysql_identity().ok_or_else(|| {
            DbError::Config(format!(
                "cache connection '{}' backs onto non-MySQL connection '{}'",
                name,
                backing.name()
            ))
        })?;
        Ok(Self {
            name,
            store,
            backing,
            backing_host,
            backing_database,
            min_minutes,
            max_minutes,
            stats: Stats::default(),
        })
    }

    pub fn database_name(&self) -> &str {
        &self.backing_database
    }

    pub async fn connect(&self) -> DbResult<()> {
        let started = Instant::now();
        let result = self.store.ping().await;
        self.stats.add_time(started.elapsed());
        result
    }

    pub async fn ping(&self) -> DbResult<Duration> {
        let started = Instant::now();
        self.store.ping().await?;
        let elapsed = started.elapsed();
        self.stats.add_time(elapsed);
        Ok(elapsed)
    }

    pub async fn flush(&self) -> DbResult<()> {
        let started = Instant::now();
        let result = self.store.flush().await;
        self.stats.add_time(started.elapsed());
        result
    }

    /// SELECT statements go through the cache; anything else passes
    /// through to the backing connection uncached.
    pub async fn query(
        &self,
        sql: &str,
        description: &str,
        opts: &QueryOptions,
    ) -> DbResult<QueryOutcome> {
        let routed = format!("for cache: {}", description);
        if StatementKind::classify(sql) != StatementKind::Select {
            // Boxed: the handle's dispatch awaits back into this function,
            // which would otherwise make the future infinitely sized.
            return Box::pin(self.backing.query_with(sql, &routed, opts.clone())).await;
        }

        let key = cache_key(&self.backing_host, &self.backing_database, sql);
        debug!(connection = %self.name, key = %key, "cache key calculated");

        let started = Instant::now();
        let cached = self.store.get(&key).await;
        let lookup = started.elapsed();
        self.stats.add_time(lookup);

        match cached {
            Ok(Some(bytes)) => match serde_json::from_slice::<RowSet>(&bytes) {
                Ok(set) => {
                    if !opts.quiet {
                        debug!(
                            connection = %self.name,
                            rows = set.rows.len(),
                            elapsed_ms = lookup.as_millis() as u64,
                            "{}", description
                        );
                    }
                    return Ok(QueryOutcome::from_row_set(set, lookup));
                }
                Err(e) => {
                    warn!(
                        connection = %self.name,
                        error = %e,
                        "cached payload unreadable, treating as miss"
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(
                    connection = %self.name,
                    error = %e,
                    "cache store read failed, treating as miss"
                );
            }
        }

        let outcome = Box::pin(self.backing.query_with(sql, &routed, opts.clone())).await?;

        match serde_json::to_vec(&outcome.to_row_set(Utc::now())) {
            Ok(bytes) => {
                let ttl = cache_ttl(self.min_minutes, self.max_minutes);
                let started = Instant::now();
                if let Err(e) = self.store.set_ex(&key, bytes, ttl).await {
                    warn!(connection = %self.name, error = %e, "cache store write failed");
                }
                self.stats.add_time(started.elapsed());
            }
            Err(e) => {
                warn!(connection = %self.name, error = %e, "could not serialize row set");
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverFlavor, MySqlConfig, RetryConfig};
    use crate::result::ColumnInfo;
    use serde_json::json;

    fn unreachable_mysql(name: &str) -> Connection {
        Connection::mysql(
            name.to_string(),
            MySqlConfig {
                flavor: DriverFlavor::Improved,
                hostname: Some("127.0.0.1".to_string()),
                port: 9,
                socket: None,
                username: "app".to_string(),
                password: String::new(),
                database: "appdb".to_string(),
                charset: Some("utf8".to_string()),
                set_timezone: None,
                connect_on_demand: true,
                non_fatal: false,
                retry: RetryConfig {
                    max_replays: 1,
                    min_delay_ms: 1,
                    max_delay_ms: 1,
                },
            },
        )
    }

    fn sample_row_set() -> RowSet {
        RowSet {
            columns: vec![ColumnInfo {
                name: "id".into(),
                type_name: "BIGINT".into(),
            }],
            rows: vec![vec![json!(1)], vec![json!(2)]],
            cached_at: Utc::now(),
        }
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = cache_key("db1", "app", "SELECT 1");
        assert_eq!(a, cache_key("db1", "app", "SELECT 1"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key("db2", "app", "SELECT 1"));
        assert_ne!(a, cache_key("db1", "other", "SELECT 1"));
        assert_ne!(a, cache_key("db1", "app", "SELECT 2"));
    }

    #[test]
    fn test_cache_ttl_bounds() {
        for _ in 0..100 {
            let ttl = cache_ttl(5, 15);
            assert!(ttl >= Duration::from_secs(5 * 60));
            assert!(ttl <= Duration::from_secs(15 * 60));
            assert_eq!(ttl.as_secs() % 60, 0);
        }
        assert_eq!(cache_ttl(7, 7), Duration::from_secs(7 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expiry() {
        let store = MemoryStore::new();
        store
            .set_ex("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_flush() {
        let store = MemoryStore::new();
        store
            .set_ex("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_backing_query() {
        let sql = "SELECT id FROM things";
        let store = MemoryStore::new();
        let key = cache_key("127.0.0.1", "appdb", sql);
        store
            .set_ex(
                &key,
                serde_json::to_vec(&sample_row_set()).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        // The backing connection is unreachable; a hit must never touch it.
        let backend = CacheBackend::new(
            "cache".to_string(),
            Box::new(store),
            unreachable_mysql("main"),
            1,
            2,
        )
        .unwrap();

        let mut outcome = backend
            .query(sql, "list things", &QueryOptions::default())
            .await
            .unwrap();
        assert!(outcome.from_cache());
        assert_eq!(outcome.num_rows(), 2);
        assert_eq!(outcome.fetch_row().unwrap().get("id"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_modification_passes_through_uncached() {
        let store = MemoryStore::new();
        let backend = CacheBackend::new(
            "cache".to_string(),
            Box::new(store),
            unreachable_mysql("main"),
            1,
            2,
        )
        .unwrap();

        // Routed straight at the (unreachable) backing connection, never
        // the store.
        let err = backend
            .query("UPDATE things SET x = 1", "bump things", &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_payload_falls_through_to_backing() {
        let sql = "SELECT id FROM things";
        let store = MemoryStore::new();
        let key = cache_key("127.0.0.1", "appdb", sql);
        store
            .set_ex(&key, b"{not json".to_vec(), Duration::from_secs(300))
            .await
            .unwrap();

        let backend = CacheBackend::new(
            "cache".to_string(),
            Box::new(store),
            unreachable_mysql("main"),
            1,
            2,
        )
        .unwrap();

        // Treated as a miss: the query is routed to the (unreachable)
        // backing connection and its connect failure propagates.
        let err = backend
            .query(sql, "list things", &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connect { .. }));
    }
}
