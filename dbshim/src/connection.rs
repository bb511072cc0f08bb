//! The single public connection handle.
//!
//! The original exposed the same behavior twice, through a procedural API
//! and an object-oriented one; both collapse into this one handle
//! dispatching over the backend kind. Handles are cheap to clone and share
//! their state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::backend::cache::CacheBackend;
use crate::backend::mysql::MySqlBackend;
use crate::config::{ConnectionKind, MySqlConfig};
use crate::errors::{DbError, DbResult};
use crate::result::QueryOutcome;
use crate::sql::{self, SqlParam};

/// Per-call behavior flags.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Skip the automatic post-statement warning check.
    pub ignore_warnings: bool,
    /// Suppress the per-query debug message.
    pub quiet: bool,
    /// Cap on buffered rows; `None` buffers everything.
    pub max_rows: Option<usize>,
}

enum Backend {
    MySql(MySqlBackend),
    Cache(CacheBackend),
}

struct Inner {
    name: String,
    kind: ConnectionKind,
    connect_on_demand: bool,
    non_fatal: bool,
    backend: Backend,
}

/// A named database connection: MySQL through one of the two historical
/// driver flavors, or a query cache in front of one.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl Connection {
    pub(crate) fn mysql(name: String, config: MySqlConfig) -> Self {
        let kind = ConnectionKind::MySql(config.flavor);
        let connect_on_demand = config.connect_on_demand;
        let non_fatal = config.non_fatal;
        let backend = Backend::MySql(MySqlBackend::new(name.clone(), config));
        Self {
            inner: Arc::new(Inner {
                name,
                kind,
                connect_on_demand,
                non_fatal,
                backend,
            }),
        }
    }

    pub(crate) fn cache(
        name: String,
        backend: CacheBackend,
        connect_on_demand: bool,
        non_fatal: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                kind: ConnectionKind::Cache,
                connect_on_demand,
                non_fatal,
                backend: Backend::Cache(backend),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    /// The schema this connection reads from; for a cache connection,
    /// the backing connection's schema.
    pub fn database_name(&self) -> &str {
        match &self.inner.backend {
            Backend::MySql(b) => b.database_name(),
            Backend::Cache(b) => b.database_name(),
        }
    }

    pub(crate) fn connect_on_demand(&self) -> bool {
        self.inner.connect_on_demand
    }

    pub(crate) fn non_fatal(&self) -> bool {
        self.inner.non_fatal
    }

    /// Host and schema of a MySQL connection (cache key ingredients).
    pub(crate) fn mysql_identity(&self) -> Option<(String, String)> {
        match &self.inner.backend {
            Backend::MySql(b) => Some((b.hostname().to_string(), b.database_name().to_string())),
            Backend::Cache(_) => None,
        }
    }

    pub async fn connect(&self) -> DbResult<()> {
        match &self.inner.backend {
            Backend::MySql(b) => b.connect().await,
            Backend::Cache(b) => b.connect().await,
        }
    }

    pub async fn disconnect(&self) -> DbResult<()> {
        match &self.inner.backend {
            Backend::MySql(b) => b.disconnect().await,
            // The cache store has no session to tear down.
            Backend::Cache(_) => Ok(()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        match &self.inner.backend {
            Backend::MySql(b) => b.is_connected().await,
            Backend::Cache(_) => true,
        }
    }

    /// Connectivity probe returning the round-trip latency.
    pub async fn ping(&self) -> DbResult<Duration> {
        match &self.inner.backend {
            Backend::MySql(b) => b.ping().await,
            Backend::Cache(b) => b.ping().await,
        }
    }

    /// Total time spent in driver calls on this connection.
    pub fn database_time(&self) -> Duration {
        match &self.inner.backend {
            Backend::MySql(b) => b.stats.database_time(),
            Backend::Cache(b) => b.stats.database_time(),
        }
    }

    /// Insert id of the most recent statement that generated one.
    pub fn last_insert_id(&self) -> Option<u64> {
        match &self.inner.backend {
            Backend::MySql(b) => b.stats.last_insert_id(),
            Backend::Cache(_) => None,
        }
    }

    pub async fn query(&self, sql: &str, description: &str) -> DbResult<QueryOutcome> {
        self.query_with(sql, description, QueryOptions::default())
            .await
    }

    pub async fn query_with(
        &self,
        sql: &str,
        description: &str,
        opts: QueryOptions,
    ) -> DbResult<QueryOutcome> {
        match &self.inner.backend {
            Backend::MySql(b) => b.query(sql, description, &opts).await,
            Backend::Cache(b) => b.query(sql, description, &opts).await,
        }
    }

    /// Multiple `;`-separated statements in one round trip. Improved
    /// flavor only; never replayed.
    pub async fn multi_query(
        &self,
        sql: &str,
        description: &str,
    ) -> DbResult<Vec<DbResult<QueryOutcome>>> {
        self.multi_query_with(sql, description, QueryOptions::default())
            .await
    }

    pub async fn multi_query_with(
        &self,
        sql: &str,
        description: &str,
        opts: QueryOptions,
    ) -> DbResult<Vec<DbResult<QueryOutcome>>> {
        match &self.inner.backend {
            Backend::MySql(b) => b.multi_query(sql, description, &opts).await,
            Backend::Cache(_) => Err(self.unsupported("multi_query")),
        }
    }

    /// Runs a query and returns all rows as maps keyed by column name.
    pub async fn query_rows(
        &self,
        sql: &str,
        description: &str,
    ) -> DbResult<Vec<Map<String, Value>>> {
        Ok(self.query(sql, description).await?.into_maps())
    }

    /// Like [`query_rows`](Self::query_rows), but keyed by the value of
    /// `key_column`.
    pub async fn query_rows_by(
        &self,
        sql: &str,
        description: &str,
        key_column: &str,
    ) -> DbResult<BTreeMap<String, Map<String, Value>>> {
        self.query(sql, description).await?.into_maps_by(key_column)
    }

    /// Server warnings for the previous statement (improved flavor only).
    pub async fn warnings(&self) -> DbResult<Vec<Map<String, Value>>> {
        match &self.inner.backend {
            Backend::MySql(b) => b.warnings().await,
            Backend::Cache(_) => Err(self.unsupported("warnings")),
        }
    }

    pub fn in_transaction(&self) -> bool {
        match &self.inner.backend {
            Backend::MySql(b) => b.in_transaction(),
            Backend::Cache(_) => false,
        }
    }

    pub async fn begin_transaction(&self) -> DbResult<()> {
        match &self.inner.backend {
            Backend::MySql(b) => b.begin_transaction().await,
            Backend::Cache(_) => Err(self.unsupported("transactions")),
        }
    }

    pub async fn commit(&self) -> DbResult<()> {
        match &self.inner.backend {
            Backend::MySql(b) => b.commit().await,
            Backend::Cache(_) => Err(self.unsupported("transactions")),
        }
    }

    pub async fn rollback(&self) -> DbResult<()> {
        match &self.inner.backend {
            Backend::MySql(b) => b.rollback().await,
            Backend::Cache(_) => Err(self.unsupported("transactions")),
        }
    }

    /// Clears the cache store. Cache connections only.
    pub async fn flush_cache(&self) -> DbResult<()> {
        match &self.inner.backend {
            Backend::MySql(_) => Err(self.unsupported("flushing")),
            Backend::Cache(b) => b.flush().await,
        }
    }

    // Quoting conveniences, mirroring the per-connection helpers of the
    // original API. See [`crate::sql`] for the free functions.

    pub fn escape(&self, value: &str) -> String {
        sql::escape_string(value)
    }

    pub fn quote_value(&self, param: SqlParam<'_>) -> String {
        sql::quote_value(param)
    }

    pub fn quote_compare(&self, op: &str, value: Option<&str>) -> String {
        sql::quote_compare(op, value)
    }

    pub fn quote_hex(&self, value: Option<&[u8]>) -> String {
        sql::quote_hex(value)
    }

    fn unsupported(&self, operation: &'static str) -> DbError {
        DbError::Unsupported {
            connection: self.inner.name.clone(),
            operation,
        }
    }
}
