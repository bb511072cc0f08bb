//! MySQL backend: one persistent wire connection per named connection.
//!
//! Both historical driver flavors ride the same wire driver; the flavor
//! gates the capability differences (charset/timezone handshake, warnings,
//! multi-statement support, stored-procedure sniffing). Statements run over
//! the text protocol and results are buffered into [`QueryOutcome`]s.
//!
//! Transient connection loss (2006/2013 or a dead channel) triggers the
//! bounded reconnect-and-replay cycle; everything else propagates.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection as _, Either, Row as _, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::backend::Stats;
use crate::config::{DriverFlavor, MySqlConfig};
use crate::connection::QueryOptions;
use crate::errors::{DbError, DbResult};
use crate::result::{ColumnInfo, QueryOutcome};
use crate::retry::RetryPolicy;
use crate::sql::{quote_value, SqlParam};

pub(crate) struct MySqlBackend {
    name: String,
    config: MySqlConfig,
    retry: RetryPolicy,
    conn: Mutex<Option<MySqlConnection>>,
    pub(crate) stats: Stats,
}

/// One statement's worth of driver output before it becomes a
/// [`QueryOutcome`].
#[derive(Debug)]
struct RawResult {
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<Value>>,
    affected_rows: u64,
    last_insert_id: u64,
}

impl MySqlBackend {
    pub fn new(name: String, config: MySqlConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            name,
            config,
            retry,
            conn: Mutex::new(None),
            stats: Stats::default(),
        }
    }

    pub fn flavor(&self) -> DriverFlavor {
        self.config.flavor
    }

    pub fn database_name(&self) -> &str {
        &self.config.database
    }

    pub fn hostname(&self) -> &str {
        self.config.hostname.as_deref().unwrap_or("localhost")
    }

    pub async fn connect(&self) -> DbResult<()> {
        let mut guard = self.conn.lock().await;
        connect_slot(&self.name, self, &mut guard, &self.stats).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> DbResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.close().await {
                debug!(connection = %self.name, error = %e, "close reported an error");
            }
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Opens a fresh wire connection, applying the flavor's handshake
    /// behavior (charset, post-connect timezone).
    async fn open(&self) -> DbResult<MySqlConnection> {
        let mut options = MySqlConnectOptions::new()
            .username(&self.config.username)
            .password(&self.config.password)
            .database(&self.config.database);
        options = match &self.config.socket {
            Some(socket) => options.socket(socket),
            None => options
                .host(self.config.hostname.as_deref().unwrap_or("localhost"))
                .port(self.config.port),
        };
        if let Some(charset) = &self.config.charset {
            options = options.charset(charset);
        }

        let started = Instant::now();
        let mut conn = options
            .connect()
            .await
            .map_err(|e| DbError::from_connect(&self.name, e))?;

        if self.config.flavor == DriverFlavor::Improved {
            if let Some(tz) = &self.config.set_timezone {
                let stmt = format!("SET time_zone = {}", quote_value(SqlParam::Text(tz)));
                exec_simple(&mut conn, &stmt)
                    .await
                    .map_err(|e| DbError::from_connect(&self.name, e))?;
            }
        }

        self.stats.add_time(started.elapsed());
        debug!(connection = %self.name, "connected");
        Ok(conn)
    }

    /// Connectivity probe: `SELECT 1`, returning the round-trip latency.
    /// Bypasses the replay loop.
    pub async fn ping(&self) -> DbResult<Duration> {
        let mut guard = self.conn.lock().await;
        let conn = connect_slot(&self.name, self, &mut guard, &self.stats).await?;

        let started = Instant::now();
        sqlx::raw_sql("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::from_driver(&self.name, e))?;
        let elapsed = started.elapsed();
        self.stats.add_time(elapsed);
        Ok(elapsed)
    }

    /// Runs one statement with reconnect-and-replay on transient loss.
    pub async fn query(
        &self,
        sql: &str,
        description: &str,
        opts: &QueryOptions,
    ) -> DbResult<QueryOutcome> {
        let mut guard = self.conn.lock().await;
        let result = run_with_replays(
            &self.name,
            self,
            &mut guard,
            &self.stats,
            &self.retry,
            sql,
            opts.max_rows,
        )
        .await;

        match result {
            Ok((raw, elapsed)) => {
                self.stats.record_insert_id(raw.last_insert_id);

                let mut warning_count = 0;
                if self.config.flavor == DriverFlavor::Improved && !opts.ignore_warnings {
                    if let Some(conn) = guard.as_mut() {
                        warning_count = self.check_warnings(conn, sql, description).await;
                    }
                }
                if warning_count == 0 && !opts.quiet {
                    let elapsed_ms = elapsed.as_millis() as u64;
                    if raw.columns.is_empty() {
                        debug!(
                            connection = %self.name,
                            affected = raw.affected_rows,
                            elapsed_ms,
                            "{}", description
                        );
                    } else {
                        debug!(
                            connection = %self.name,
                            rows = raw.rows.len(),
                            elapsed_ms,
                            "{}", description
                        );
                    }
                }

                let last_insert_id = match raw.last_insert_id {
                    0 => None,
                    id => Some(id),
                };
                Ok(QueryOutcome::new(
                    raw.columns,
                    raw.rows,
                    raw.affected_rows,
                    last_insert_id,
                    elapsed,
                ))
            }
            Err(err) => {
                if let DbError::Query { message, .. } = &err {
                    if self.config.flavor == DriverFlavor::Improved {
                        if let Some(signal) = procedure_signal(message) {
                            warn!(
                                connection = %self.name,
                                signal = %signal,
                                "stored procedure said"
                            );
                        }
                    }
                    warn!(connection = %self.name, error = %err, "{}", description);
                }
                Err(err)
            }
        }
    }

    /// Multiple `;`-separated statements in one round trip (improved
    /// flavor only). Outer error: nothing could be executed; inner errors
    /// are per statement. Never retries.
    pub async fn multi_query(
        &self,
        sql: &str,
        description: &str,
        opts: &QueryOptions,
    ) -> DbResult<Vec<DbResult<QueryOutcome>>> {
        if self.config.flavor != DriverFlavor::Improved {
            return Err(DbError::Unsupported {
                connection: self.name.clone(),
                operation: "multi_query",
            });
        }

        let mut guard = self.conn.lock().await;
        let conn = connect_slot(&self.name, self, &mut guard, &self.stats).await?;

        let started = Instant::now();
        let mut stream = sqlx::raw_sql(sql).fetch_many(conn);

        let mut results: Vec<DbResult<QueryOutcome>> = Vec::new();
        let mut columns: Vec<ColumnInfo> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();

        loop {
            match stream.try_next().await {
                Ok(Some(Either::Right(row))) => {
                    if columns.is_empty() {
                        columns = column_info(&row);
                    }
                    if opts.max_rows.map_or(true, |cap| rows.len() < cap) {
                        match decode_row(&row) {
                            Ok(values) => rows.push(values),
                            Err(e) => {
                                results.push(Err(e));
                                break;
                            }
                        }
                    }
                }
                Ok(Some(Either::Left(done))) => {
                    let part = results.len() + 1;
                    let elapsed = started.elapsed();
                    self.stats.record_insert_id(done.last_insert_id());
                    if !opts.quiet {
                        let elapsed_ms = elapsed.as_millis() as u64;
                        if columns.is_empty() {
                            debug!(
                                connection = %self.name,
                                affected = done.rows_affected(),
                                elapsed_ms,
                                "{} (part {})", description, part
                            );
                        } else {
                            debug!(
                                connection = %self.name,
                                rows = rows.len(),
                                elapsed_ms,
                                "{} (part {})", description, part
                            );
                        }
                    }
                    let last_insert_id = match done.last_insert_id() {
                        0 => None,
                        id => Some(id),
                    };
                    results.push(Ok(QueryOutcome::new(
                        std::mem::take(&mut columns),
                        std::mem::take(&mut rows),
                        done.rows_affected(),
                        last_insert_id,
                        elapsed,
                    )));
                }
                Ok(None) => break,
                Err(e) => {
                    let err = DbError::from_driver(&self.name, e);
                    if results.is_empty() && rows.is_empty() {
                        // Could not execute at all.
                        drop(stream);
                        self.stats.add_time(started.elapsed());
                        return Err(err);
                    }
                    let part = results.len() + 1;
                    warn!(
                        connection = %self.name,
                        error = %err,
                        "{} (part {})", description, part
                    );
                    results.push(Err(err));
                    break;
                }
            }
        }

        drop(stream);
        self.stats.add_time(started.elapsed());
        Ok(results)
    }

    /// Fetches the server warnings for the previous statement (improved
    /// flavor only).
    pub async fn warnings(&self) -> DbResult<Vec<Map<String, Value>>> {
        if self.config.flavor != DriverFlavor::Improved {
            return Err(DbError::Unsupported {
                connection: self.name.clone(),
                operation: "warnings",
            });
        }
        let opts = QueryOptions {
            ignore_warnings: true,
            quiet: true,
            max_rows: None,
        };
        let outcome = self.query("SHOW WARNINGS", "get warnings", &opts).await?;
        Ok(outcome.into_maps())
    }

    /// Post-statement warning check. The wire driver does not surface the
    /// OK-packet warning count, so this costs a `SHOW WARNINGS` round trip.
    async fn check_warnings(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        description: &str,
    ) -> usize {
        if sql.trim_start().to_uppercase().starts_with("SHOW WARNINGS") {
            return 0;
        }
        let started = Instant::now();
        let fetched = run_statement(&self.name, conn, "SHOW WARNINGS", None).await;
        self.stats.add_time(started.elapsed());
        match fetched {
            Ok(raw) if !raw.rows.is_empty() => {
                warn!(
                    connection = %self.name,
                    warnings = raw.rows.len(),
                    "{}", description
                );
                raw.rows.len()
            }
            Ok(_) => 0,
            Err(e) => {
                debug!(connection = %self.name, error = %e, "warning check failed");
                0
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.stats.in_transaction()
    }

    pub async fn begin_transaction(&self) -> DbResult<()> {
        if self.stats.in_transaction() {
            return Err(DbError::Transaction {
                connection: self.name.clone(),
                message: "already in the middle of a transaction, can't start a new one".into(),
            });
        }
        self.query("START TRANSACTION", "start transaction", &QueryOptions::default())
            .await?;
        self.stats.enter_transaction();
        Ok(())
    }

    pub async fn commit(&self) -> DbResult<()> {
        if !self.stats.in_transaction() {
            return Err(DbError::Transaction {
                connection: self.name.clone(),
                message: "not in a transaction, can't commit".into(),
            });
        }
        self.query("COMMIT", "commit", &QueryOptions::default())
            .await?;
        self.stats.leave_transaction();
        Ok(())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        if !self.stats.in_transaction() {
            return Err(DbError::Transaction {
                connection: self.name.clone(),
                message: "not in a transaction, can't rollback".into(),
            });
        }
        self.query("ROLLBACK", "rollback", &QueryOptions::default())
            .await?;
        self.stats.leave_transaction();
        Ok(())
    }
}

/// The seam the replay cycle drives: opening a session and running one
/// statement on it.
#[async_trait]
trait ReplaySession: Send + Sync {
    type Conn: Send;

    async fn establish(&self) -> DbResult<Self::Conn>;

    async fn run(
        &self,
        conn: &mut Self::Conn,
        sql: &str,
        max_rows: Option<usize>,
    ) -> DbResult<RawResult>;
}

#[async_trait]
impl ReplaySession for MySqlBackend {
    type Conn = MySqlConnection;

    async fn establish(&self) -> DbResult<MySqlConnection> {
        self.open().await
    }

    async fn run(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        max_rows: Option<usize>,
    ) -> DbResult<RawResult> {
        run_statement(&self.name, conn, sql, max_rows).await
    }
}

/// Connect-or-reuse into `slot`. A previous connect failure latches and
/// short-circuits later attempts until the retry path clears it.
async fn connect_slot<'a, S: ReplaySession>(
    name: &str,
    session: &S,
    slot: &'a mut Option<S::Conn>,
    stats: &Stats,
) -> DbResult<&'a mut S::Conn> {
    let conn = match slot.take() {
        Some(conn) => conn,
        None => {
            if stats.failed() {
                return Err(DbError::ConnectLatched(name.to_string()));
            }
            match session.establish().await {
                Ok(conn) => conn,
                Err(e) => {
                    stats.latch_failure();
                    return Err(e);
                }
            }
        }
    };
    Ok(slot.insert(conn))
}

/// Drives one statement through the reconnect-and-replay cycle. On
/// transient loss the dead session is dropped from `slot` and the
/// statement is replayed after a jittered sleep, bounded by the policy's
/// replay ceiling. Statements inside a transaction are never replayed.
async fn run_with_replays<S: ReplaySession>(
    name: &str,
    session: &S,
    slot: &mut Option<S::Conn>,
    stats: &Stats,
    retry: &RetryPolicy,
    sql: &str,
    max_rows: Option<usize>,
) -> DbResult<(RawResult, Duration)> {
    let mut replays = 0u32;

    loop {
        let conn = connect_slot(name, session, slot, stats).await?;

        let started = Instant::now();
        let result = session.run(conn, sql, max_rows).await;
        let elapsed = started.elapsed();
        stats.add_time(elapsed);

        match result {
            Ok(raw) => return Ok((raw, elapsed)),
            Err(err) if err.is_connection_lost() => {
                *slot = None;
                stats.clear_failure();

                // Replaying into a fresh session mid-transaction would
                // silently split the transaction across sessions.
                if stats.leave_transaction() {
                    error!(
                        connection = %name,
                        "connection lost inside a transaction, not replaying"
                    );
                    return Err(DbError::ConnectionLost {
                        connection: name.to_string(),
                        attempts: replays,
                    });
                }

                warn!(
                    connection = %name,
                    error = %err,
                    "connection to server failed, attempting reconnect and replay"
                );

                // Reconnect attempts share the replay ceiling, so the
                // whole cycle terminates.
                loop {
                    replays += 1;
                    if replays > retry.max_replays {
                        error!(
                            connection = %name,
                            attempts = replays - 1,
                            "connection failed after reconnecting too many times, done trying"
                        );
                        return Err(DbError::ConnectionLost {
                            connection: name.to_string(),
                            attempts: replays - 1,
                        });
                    }
                    tokio::time::sleep(retry.delay()).await;
                    match connect_slot(name, session, slot, stats).await {
                        Ok(_) => break,
                        Err(e) => {
                            stats.clear_failure();
                            warn!(connection = %name, error = %e, "reconnect failed");
                        }
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs one statement over the text protocol, buffering rows.
/// Execute a single statement, discarding its result. Drains a
/// `fetch_many` stream rather than calling `execute` because the latter
/// trips a rustc "implementation of `Executor` is not general enough"
/// limitation when awaited inside an `async_trait` future; the wire
/// behavior is identical.
async fn exec_simple(conn: &mut MySqlConnection, sql: &str) -> Result<(), sqlx::Error> {
    let mut stream = sqlx::raw_sql(sql).fetch_many(conn);
    while stream.try_next().await?.is_some() {}
    Ok(())
}

async fn run_statement(
    name: &str,
    conn: &mut MySqlConnection,
    sql: &str,
    max_rows: Option<usize>,
) -> DbResult<RawResult> {
    let mut stream = sqlx::raw_sql(sql).fetch_many(conn);

    let mut columns = Vec::new();
    let mut rows = Vec::new();
    let mut affected_rows = 0u64;
    let mut last_insert_id = 0u64;

    while let Some(item) = stream
        .try_next()
        .await
        .map_err(|e| DbError::from_driver(name, e))?
    {
        match item {
            Either::Left(done) => {
                affected_rows += done.rows_affected();
                if done.last_insert_id() != 0 {
                    last_insert_id = done.last_insert_id();
                }
            }
            Either::Right(row) => {
                if columns.is_empty() {
                    columns = column_info(&row);
                }
                if max_rows.map_or(true, |cap| rows.len() < cap) {
                    rows.push(decode_row(&row)?);
                }
            }
        }
    }

    Ok(RawResult {
        columns,
        rows,
        affected_rows,
        last_insert_id,
    })
}

fn column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|c| ColumnInfo {
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

fn decode_row(row: &MySqlRow) -> DbResult<Vec<Value>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(index)
            .map_err(|e| DbError::Decode(e.to_string()))?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        let bytes = <&[u8] as sqlx::Decode<sqlx::MySql>>::decode(raw)
            .map_err(|e| DbError::Decode(e.to_string()))?;
        values.push(normalize_value(column.type_info().name(), bytes));
    }
    Ok(values)
}

/// Normalizes a text-protocol column value into JSON: numeric columns
/// become numbers, booleans become booleans, JSON columns are parsed,
/// binary columns fall back to hex when not valid UTF-8, and everything
/// else keeps the server's textual form.
fn normalize_value(type_name: &str, bytes: &[u8]) -> Value {
    let as_text = || String::from_utf8_lossy(bytes).into_owned();
    match type_name {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<i64>().ok()) {
                Some(n) => Value::from(n),
                None => Value::String(as_text()),
            }
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => {
            match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<u64>().ok()) {
                Some(n) => Value::from(n),
                None => Value::String(as_text()),
            }
        }
        "BOOLEAN" => match bytes {
            b"0" => Value::Bool(false),
            b"1" => Value::Bool(true),
            _ => Value::String(as_text()),
        },
        "FLOAT" | "DOUBLE" => {
            match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<f64>().ok()) {
                Some(f) => serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(as_text())),
                None => Value::String(as_text()),
            }
        }
        "JSON" => serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(as_text())),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::String(hex::encode(bytes)),
        },
        // DATETIME, DECIMAL, CHAR/VARCHAR/TEXT, ENUM, SET: the server's
        // textual form.
        _ => Value::String(as_text()),
    }
}

static PROCEDURE_ERROR: OnceLock<Regex> = OnceLock::new();

/// Matches the "missing stored procedure" trick the original schemas used
/// to signal application errors; returns the captured signal name.
fn procedure_signal(message: &str) -> Option<String> {
    let re = PROCEDURE_ERROR.get_or_init(|| {
        Regex::new(r"PROCEDURE .+\.Error([A-Za-z]+) does not exist").expect("procedure pattern")
    });
    re.captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Session double scripting one result per statement run; an empty
    /// script reports connection loss forever.
    struct ScriptedSession {
        script: tokio::sync::Mutex<Vec<DbResult<RawResult>>>,
        establishes: AtomicUsize,
        runs: AtomicUsize,
    }

    impl ScriptedSession {
        fn new(script: Vec<DbResult<RawResult>>) -> Self {
            Self {
                script: tokio::sync::Mutex::new(script),
                establishes: AtomicUsize::new(0),
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReplaySession for ScriptedSession {
        type Conn = ();

        async fn establish(&self) -> DbResult<()> {
            self.establishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(
            &self,
            _conn: &mut (),
            _sql: &str,
            _max_rows: Option<usize>,
        ) -> DbResult<RawResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().await;
            if script.is_empty() {
                Err(lost())
            } else {
                script.remove(0)
            }
        }
    }

    fn lost() -> DbError {
        DbError::Query {
            connection: "main".into(),
            code: Some(2006),
            message: "server has gone away".into(),
        }
    }

    fn one_row() -> RawResult {
        RawResult {
            columns: vec![ColumnInfo {
                name: "id".into(),
                type_name: "BIGINT".into(),
            }],
            rows: vec![vec![json!(1)]],
            affected_rows: 0,
            last_insert_id: 0,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_replays: 5,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_recovers_after_transient_loss() {
        let session = ScriptedSession::new(vec![Err(lost()), Err(lost()), Ok(one_row())]);
        let stats = Stats::default();
        let mut slot = None;

        let (raw, _) =
            run_with_replays("main", &session, &mut slot, &stats, &fast_retry(), "SELECT 1", None)
                .await
                .unwrap();
        assert_eq!(raw.rows.len(), 1);
        // Initial session plus one per replay.
        assert_eq!(session.runs.load(Ordering::SeqCst), 3);
        assert_eq!(session.establishes.load(Ordering::SeqCst), 3);
        assert!(slot.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_ceiling_gives_up() {
        let session = ScriptedSession::new(Vec::new());
        let stats = Stats::default();
        let mut slot = None;

        let err =
            run_with_replays("main", &session, &mut slot, &stats, &fast_retry(), "SELECT 1", None)
                .await
                .unwrap_err();
        assert!(matches!(
            err,
            DbError::ConnectionLost { attempts: 5, .. }
        ));
        assert_eq!(session.runs.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_replay_inside_transaction() {
        let session = ScriptedSession::new(Vec::new());
        let stats = Stats::default();
        stats.enter_transaction();
        let mut slot = None;

        let err = run_with_replays(
            "main",
            &session,
            &mut slot,
            &stats,
            &fast_retry(),
            "UPDATE t SET x = 1",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DbError::ConnectionLost { attempts: 0, .. }
        ));
        assert_eq!(session.runs.load(Ordering::SeqCst), 1);
        assert!(!stats.in_transaction());
    }

    #[tokio::test]
    async fn test_connect_failure_latches() {
        struct Refusing;

        #[async_trait]
        impl ReplaySession for Refusing {
            type Conn = ();

            async fn establish(&self) -> DbResult<()> {
                Err(DbError::Connect {
                    connection: "main".into(),
                    message: "refused".into(),
                })
            }

            async fn run(
                &self,
                _conn: &mut (),
                _sql: &str,
                _max_rows: Option<usize>,
            ) -> DbResult<RawResult> {
                Ok(one_row())
            }
        }

        let stats = Stats::default();
        let mut slot = None;
        let err = connect_slot("main", &Refusing, &mut slot, &stats)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connect { .. }));

        // Latched: the next attempt short-circuits.
        let err = connect_slot("main", &Refusing, &mut slot, &stats)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ConnectLatched(_)));
    }

    #[test]
    fn test_procedure_signal_extraction() {
        let msg = "PROCEDURE app.ErrorDuplicateAccount does not exist";
        assert_eq!(procedure_signal(msg).as_deref(), Some("DuplicateAccount"));
        assert_eq!(procedure_signal("Unknown column 'x'"), None);
    }

    #[test]
    fn test_normalize_integers() {
        assert_eq!(normalize_value("BIGINT", b"-7"), json!(-7));
        assert_eq!(
            normalize_value("BIGINT UNSIGNED", b"18446744073709551615"),
            json!(18446744073709551615u64)
        );
        assert_eq!(normalize_value("INT", b"not-a-number"), json!("not-a-number"));
    }

    #[test]
    fn test_normalize_boolean_and_floats() {
        assert_eq!(normalize_value("BOOLEAN", b"1"), json!(true));
        assert_eq!(normalize_value("BOOLEAN", b"0"), json!(false));
        assert_eq!(normalize_value("DOUBLE", b"1.5"), json!(1.5));
    }

    #[test]
    fn test_normalize_json_column() {
        assert_eq!(
            normalize_value("JSON", br#"{"a": 1}"#),
            json!({"a": 1})
        );
        assert_eq!(normalize_value("JSON", b"{broken"), json!("{broken"));
    }

    #[test]
    fn test_normalize_binary_fallback() {
        assert_eq!(normalize_value("BLOB", b"plain text"), json!("plain text"));
        assert_eq!(normalize_value("VARBINARY", &[0xff, 0x00]), json!("ff00"));
    }

    #[test]
    fn test_normalize_textual_forms() {
        assert_eq!(
            normalize_value("DATETIME", b"2024-05-01 12:00:00"),
            json!("2024-05-01 12:00:00")
        );
        assert_eq!(normalize_value("DECIMAL", b"12.3400"), json!("12.3400"));
    }
}
