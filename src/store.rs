use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{BatchError, Result};

/// Tracking columns appended after the loader-defined parameter columns.
/// Owned by the execution engine; the loader never touches them.
pub const TRACKING_COLUMNS: [&str; 5] = [
    "succeed",
    "attempts",
    "last_stdout",
    "last_stderr",
    "last_attempt_dt",
];

/// Reserved snapshot key carrying a row's primary key.
pub const ROWID: &str = "rowid";

/// Format for stored `last_attempt_dt` values.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default ordering: never-attempted rows first (empty timestamp sorts
/// lowest), then oldest attempts, ties broken by insertion order.
const DEFAULT_ORDER: &str = "last_attempt_dt ASC, rowid ASC";

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Selection criteria for pending rows.
///
/// `filter` and `order` are raw SQL fragments injected into the query.
/// The store trusts the CLI operator here, not an untrusted client; do
/// not widen that boundary.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Arbitrary SQL predicate over parameter and tracking fields.
    /// Empty means match everything.
    pub filter: String,

    /// Arbitrary SQL ordering expression. Empty means the default
    /// ascending last-attempt order.
    pub order: String,

    /// Maximum rows to return; non-positive removes the limit.
    pub take: i64,
}

/// One row as returned by [`JobStore::filter`]: field name to value,
/// with the primary key under the reserved `rowid` key.
pub type RowSnapshot = serde_json::Map<String, Value>;

struct StoreInner {
    conn: Connection,
    columns: Vec<String>,
}

/// Durable keeper of parameter rows and their execution tracking fields.
///
/// One SQLite file, one `jobs` table: loader-defined parameter columns
/// followed by the fixed tracking suffix. All access goes through a
/// mutex owned by this instance, which makes the read-increment-write in
/// [`JobStore::update_outcome`] atomic across concurrent workers.
pub struct JobStore {
    inner: Mutex<StoreInner>,
}

impl JobStore {
    /// Open (or create) a state store file and populate the schema cache
    /// from its `jobs` table, if one exists.
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable = |source: rusqlite::Error| BatchError::StoreUnavailable {
            path: path.display().to_string(),
            source,
        };
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;

        let store = Self {
            inner: Mutex::new(StoreInner {
                conn,
                columns: Vec::new(),
            }),
        };
        store.load_schema()?;
        Ok(store)
    }

    /// In-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| BatchError::StoreUnavailable {
            path: ":memory:".to_string(),
            source,
        })?;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                columns: Vec::new(),
            }),
        })
    }

    /// Populate the schema cache by introspecting an existing `jobs`
    /// table, excluding the reserved tracking columns.
    ///
    /// A store without a `jobs` table leaves the cache empty; the loader
    /// creates the table later via [`JobStore::init_schema`].
    pub fn load_schema(&self) -> Result<()> {
        let mut inner = self.lock();
        let columns = introspect(&inner.conn)?;
        inner.columns = columns;
        Ok(())
    }

    /// Create the `jobs` table for `header` if it does not exist, and
    /// cache the column order.
    ///
    /// Idempotent for a compatible existing table; an existing table
    /// whose parameter columns differ is a schema conflict.
    pub fn init_schema(&self, header: &[String]) -> Result<()> {
        let mut inner = self.lock();
        let mut ddl = String::from("CREATE TABLE IF NOT EXISTS jobs (");
        for name in header {
            ddl.push_str(&quote_ident(name));
            ddl.push_str(", ");
        }
        ddl.push_str(
            "succeed INT DEFAULT 0, \
             attempts INT DEFAULT 0, \
             last_stdout TEXT DEFAULT '', \
             last_stderr TEXT DEFAULT '', \
             last_attempt_dt TEXT DEFAULT '')",
        );
        inner.conn.execute(&ddl, [])?;

        let existing = introspect(&inner.conn)?;
        if existing != header {
            return Err(BatchError::SchemaConflict {
                found: existing,
                supplied: header.to_vec(),
            });
        }
        inner.columns = existing;
        Ok(())
    }

    /// Parameter column names, in schema order.
    pub fn columns(&self) -> Vec<String> {
        self.lock().columns.clone()
    }

    /// Append one row; tracking fields take their defaults.
    pub fn insert(&self, record: &[String]) -> Result<()> {
        let inner = self.lock();
        if inner.columns.is_empty() {
            return Err(BatchError::SchemaMissing);
        }
        if record.len() != inner.columns.len() {
            return Err(BatchError::ArityMismatch {
                expected: inner.columns.len(),
                got: record.len(),
            });
        }
        let sql = format!(
            "INSERT INTO jobs ({}) VALUES ({})",
            inner
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; record.len()].join(", ")
        );
        inner
            .conn
            .execute(&sql, rusqlite::params_from_iter(record.iter()))?;
        Ok(())
    }

    /// Bulk-reset every row's tracking fields to their defaults.
    /// Parameter fields and the rows themselves are untouched.
    pub fn reset(&self) -> Result<()> {
        let inner = self.lock();
        inner.conn.execute(
            "UPDATE jobs SET succeed = 0, attempts = 0, last_stdout = '', \
             last_stderr = '', last_attempt_dt = ''",
            [],
        )?;
        Ok(())
    }

    /// Select pending rows: snapshots plus a parallel primary-key vector,
    /// in query-result order.
    ///
    /// Rows already marked succeeded are always excluded; that implicit
    /// constraint is what makes a re-run retry only failures.
    pub fn filter(&self, spec: &FilterSpec) -> Result<(Vec<RowSnapshot>, Vec<i64>)> {
        let inner = self.lock();
        if inner.columns.is_empty() {
            return Err(BatchError::SchemaMissing);
        }

        let limit = if spec.take <= 0 { -1 } else { spec.take };
        let order = if spec.order.is_empty() {
            DEFAULT_ORDER
        } else {
            spec.order.as_str()
        };
        let filter = if spec.filter.is_empty() {
            "1 = 1"
        } else {
            spec.filter.as_str()
        };
        let query_failure = |source: rusqlite::Error| BatchError::QueryFailure {
            filter: filter.to_string(),
            order: order.to_string(),
            limit,
            source,
        };

        let mut select = Vec::with_capacity(inner.columns.len() + TRACKING_COLUMNS.len());
        select.extend(inner.columns.iter().map(|c| quote_ident(c)));
        select.extend(TRACKING_COLUMNS.iter().map(|c| c.to_string()));
        let sql = format!(
            "SELECT rowid, {} FROM jobs WHERE ({}) AND succeed = 0 ORDER BY {} LIMIT {}",
            select.join(", "),
            filter,
            order,
            limit
        );

        let mut stmt = inner.conn.prepare(&sql).map_err(query_failure)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([]).map_err(query_failure)?;

        let mut snapshots = Vec::new();
        let mut keys = Vec::new();
        while let Some(row) = rows.next().map_err(query_failure)? {
            let mut snapshot = RowSnapshot::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(query_failure)?;
                snapshot.insert(name.clone(), json_value(value));
            }
            keys.push(row.get(0).map_err(query_failure)?);
            snapshots.push(snapshot);
        }
        Ok((snapshots, keys))
    }

    /// Record one attempt's outcome for `rowid`.
    ///
    /// Runs read-increment-write on `attempts` in a single transaction
    /// under the store lock, so concurrent workers cannot lose a count.
    pub fn update_outcome(
        &self,
        rowid: i64,
        succeeded: bool,
        stdout: &str,
        stderr: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let tx = inner.conn.transaction()?;
        let attempts: i64 = tx
            .query_row(
                "SELECT attempts FROM jobs WHERE rowid = ?1",
                params![rowid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(BatchError::RowNotFound(rowid))?;
        tx.execute(
            "UPDATE jobs SET succeed = ?1, attempts = ?2, last_stdout = ?3, \
             last_stderr = ?4, last_attempt_dt = ?5 WHERE rowid = ?6",
            params![
                succeeded,
                attempts + 1,
                stdout,
                stderr,
                at.format(TIMESTAMP_FORMAT).to_string(),
                rowid
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock leaves the guard poisoned but
        // the connection itself consistent; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn introspect(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_info('jobs') WHERE name NOT IN \
         ('succeed', 'attempts', 'last_stdout', 'last_stderr', 'last_attempt_dt')",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let columns = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}
