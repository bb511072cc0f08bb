//! Uniform error model spanning all backends.
//!
//! Driver errors are folded into [`DbError`] so callers never see a raw
//! `sqlx` or `redis` error. Transient connection loss (MySQL 2006/2013 and
//! the I/O channel errors that carry the same meaning) is distinguished from
//! fatal failures so the replay loop knows what to retry.

use thiserror::Error;

/// MySQL "server has gone away".
pub const ER_SERVER_GONE: u16 = 2006;
/// MySQL "lost connection to server during query".
pub const ER_SERVER_LOST: u16 = 2013;
/// MySQL duplicate key on insert.
pub const ER_DUP_ENTRY: u16 = 1062;

pub type DbResult<T> = Result<T, DbError>;

/// Error type for all dbshim operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database connection '{0}' doesn't exist")]
    UnknownConnection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not connect to '{connection}': {message}")]
    Connect { connection: String, message: String },

    #[error("connection '{0}' previously failed to connect")]
    ConnectLatched(String),

    #[error("connection '{connection}' failed after reconnecting {attempts} times")]
    ConnectionLost { connection: String, attempts: u32 },

    #[error("query failed on '{connection}': {message}")]
    Query {
        connection: String,
        code: Option<u16>,
        message: String,
    },

    #[error("lost channel to '{connection}': {message}")]
    Io { connection: String, message: String },

    #[error("cache store error: {0}")]
    Cache(String),

    #[error("connection '{connection}' does not support {operation}")]
    Unsupported {
        connection: String,
        operation: &'static str,
    },

    #[error("transaction error on '{connection}': {message}")]
    Transaction { connection: String, message: String },

    #[error("row seek out of bounds: offset {offset} with {len} rows")]
    RowIndex { offset: usize, len: usize },

    #[error("could not decode result value: {0}")]
    Decode(String),
}

impl DbError {
    /// The driver error number, when the error carries one.
    pub fn code(&self) -> Option<u16> {
        match self {
            DbError::Query { code, .. } => *code,
            _ => None,
        }
    }

    /// True for errors that warrant a reconnect-and-replay rather than
    /// propagation: the server dropped the connection, or the channel died.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            DbError::ConnectionLost { .. } | DbError::Io { .. } => true,
            DbError::Query { code, .. } => {
                matches!(code, Some(ER_SERVER_GONE) | Some(ER_SERVER_LOST))
            }
            _ => false,
        }
    }

    /// True when an INSERT failed on a duplicate key.
    pub fn is_duplicate_insert(&self) -> bool {
        self.code() == Some(ER_DUP_ENTRY)
    }

    /// Maps a driver error from a statement on `connection` into [`DbError`].
    pub(crate) fn from_driver(connection: &str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => DbError::Io {
                connection: connection.to_string(),
                message: e.to_string(),
            },
            sqlx::Error::Database(db) => {
                let code = db
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number());
                DbError::Query {
                    connection: connection.to_string(),
                    code,
                    message: db.message().to_string(),
                }
            }
            other => DbError::Query {
                connection: connection.to_string(),
                code: None,
                message: other.to_string(),
            },
        }
    }

    /// Maps a driver error raised while connecting.
    pub(crate) fn from_connect(connection: &str, err: sqlx::Error) -> Self {
        DbError::Connect {
            connection: connection.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for DbError {
    fn from(err: redis::RedisError) -> Self {
        DbError::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_err(code: Option<u16>) -> DbError {
        DbError::Query {
            connection: "main".into(),
            code,
            message: "boom".into(),
        }
    }

    #[test]
    fn test_connection_lost_codes() {
        assert!(query_err(Some(2006)).is_connection_lost());
        assert!(query_err(Some(2013)).is_connection_lost());
        assert!(!query_err(Some(1064)).is_connection_lost());
        assert!(!query_err(None).is_connection_lost());
    }

    #[test]
    fn test_io_is_connection_lost() {
        let err = DbError::Io {
            connection: "main".into(),
            message: "broken pipe".into(),
        };
        assert!(err.is_connection_lost());
    }

    #[test]
    fn test_duplicate_insert() {
        assert!(query_err(Some(1062)).is_duplicate_insert());
        assert!(!query_err(Some(1062)).is_connection_lost());
        assert!(!query_err(Some(2006)).is_duplicate_insert());
    }

    #[test]
    fn test_code_extraction() {
        assert_eq!(query_err(Some(1062)).code(), Some(1062));
        assert_eq!(
            DbError::UnknownConnection("x".into()).code(),
            None
        );
    }
}
