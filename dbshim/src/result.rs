//! Normalized query results.
//!
//! Every backend produces the same [`QueryOutcome`] shape: column metadata,
//! fully buffered rows of JSON values, and the bookkeeping the original
//! drivers reported per statement (affected rows, insert id, elapsed time).
//! A cursor preserves the historical row access pattern (fetch-next / seek).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DbError, DbResult};

/// Column metadata in a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Server type name, e.g. `VARCHAR` or `BIGINT UNSIGNED`.
    pub type_name: String,
}

/// The serializable part of a result, as stored in the query cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Value>>,
    pub cached_at: DateTime<Utc>,
}

/// Uniform result of a single statement, spanning all backends.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<Value>>,
    cursor: usize,
    affected_rows: u64,
    last_insert_id: Option<u64>,
    elapsed: Duration,
    from_cache: bool,
}

impl QueryOutcome {
    pub(crate) fn new(
        columns: Vec<ColumnInfo>,
        rows: Vec<Vec<Value>>,
        affected_rows: u64,
        last_insert_id: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        Self {
            columns,
            rows,
            cursor: 0,
            affected_rows,
            last_insert_id,
            elapsed,
            from_cache: false,
        }
    }

    /// Builds an outcome from a cached row set.
    pub(crate) fn from_row_set(set: RowSet, elapsed: Duration) -> Self {
        Self {
            columns: set.columns,
            rows: set.rows,
            cursor: 0,
            affected_rows: 0,
            last_insert_id: None,
            elapsed,
            from_cache: true,
        }
    }

    pub(crate) fn to_row_set(&self, cached_at: DateTime<Utc>) -> RowSet {
        RowSet {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            cached_at,
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Rows affected by a modification statement; 0 for row-returning
    /// statements and cached outcomes.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Insert id generated by this statement, when the server reported one.
    pub fn last_insert_id(&self) -> Option<u64> {
        self.last_insert_id
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// True when the rows were served from the query cache.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Returns the row under the cursor and advances it, or `None` once
    /// the rows are exhausted.
    pub fn fetch_row(&mut self) -> Option<Row<'_>> {
        if self.cursor >= self.rows.len() {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(Row {
            columns: &self.columns,
            values: &self.rows[index],
        })
    }

    /// Moves the cursor to `offset`. Errors when the offset is outside
    /// the buffered rows.
    pub fn seek(&mut self, offset: usize) -> DbResult<()> {
        if offset >= self.rows.len() {
            return Err(DbError::RowIndex {
                offset,
                len: self.rows.len(),
            });
        }
        self.cursor = offset;
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Consumes the outcome into one map per row, keyed by column name.
    pub fn into_maps(self) -> Vec<Map<String, Value>> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|values| row_to_map(&columns, values))
            .collect()
    }

    /// Consumes the outcome into maps keyed by the value of `key_column`.
    pub fn into_maps_by(self, key_column: &str) -> DbResult<BTreeMap<String, Map<String, Value>>> {
        if !self.columns.iter().any(|c| c.name == key_column) {
            return Err(DbError::Decode(format!(
                "key column '{}' not present in result",
                key_column
            )));
        }
        let columns = self.columns;
        let mut out = BTreeMap::new();
        for values in self.rows {
            let map = row_to_map(&columns, values);
            let key = map
                .get(key_column)
                .map(value_key)
                .unwrap_or_default();
            out.insert(key, map);
        }
        Ok(out)
    }
}

fn row_to_map(columns: &[ColumnInfo], values: Vec<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    for (column, value) in columns.iter().zip(values) {
        map.insert(column.name.clone(), value);
    }
    map
}

/// Renders a column value as a map key, the way the original indexed rows
/// by column value.
fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Borrowed view of one row.
#[derive(Debug)]
pub struct Row<'a> {
    columns: &'a [ColumnInfo],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let index = self.columns.iter().position(|c| c.name == column)?;
        self.values.get(index)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn to_map(&self) -> Map<String, Value> {
        row_to_map(self.columns, self.values.to_vec())
    }
}
