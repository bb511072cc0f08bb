//! Compatibility-layer database access for a legacy web application.
//!
//! Named connections reach MySQL through one of two historical driver
//! flavors, optionally fronted by a query-result cache, behind one uniform
//! result and error model. Queries that fail on transient connection loss
//! are replayed after a bounded, jittered reconnect cycle.
//!
//! ```no_run
//! use dbshim::{Registry, Settings};
//!
//! # async fn run() -> dbshim::DbResult<()> {
//! let settings = Settings::load("dbshim.toml")?;
//! let registry = Registry::from_settings(settings)?;
//! registry.connect_all().await?;
//!
//! let db = registry.get("main")?;
//! let rows = db
//!     .query_rows("SELECT id, name FROM accounts", "list accounts")
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

mod backend;
mod connection;
mod registry;

pub mod config;
pub mod errors;
pub mod result;
pub mod retry;
pub mod sql;

pub use backend::cache::{CacheStore, MemoryStore, RedisStore};
pub use config::{ConnectionKind, DriverFlavor, Settings};
pub use connection::{Connection, QueryOptions};
pub use errors::{DbError, DbResult};
pub use registry::Registry;
pub use result::{ColumnInfo, QueryOutcome, Row, RowSet};
pub use retry::RetryPolicy;
pub use sql::{SqlParam, StatementKind};
