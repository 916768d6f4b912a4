//! Database connection management and the raw row operations the
//! [`Datastore`](crate::Datastore) facade is built on.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] behind a mutex and
//! guarantees that migrations are run before any other operation. Everything
//! here is synchronous; the async facade moves calls onto the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use convo_shared::{Key, Kind};
use directories::ProjectDirs;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::migrations;

/// A stored document with its optimistic-concurrency version.
#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub version: i64,
    pub body: String,
}

/// One buffered or immediate write.
#[derive(Debug, Clone)]
pub(crate) enum Write {
    Put {
        key: Key,
        body: String,
        index: Vec<(String, String)>,
    },
    Delete {
        key: Key,
    },
}

impl Write {
    pub fn key(&self) -> Key {
        match self {
            Write::Put { key, .. } | Write::Delete { key } => *key,
        }
    }
}

/// Shared handle to the SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the default database in the platform data directory
    /// (`~/.local/share/convo/convo.db` on Linux).
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "convo", "convo").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("convo.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.with_conn(|conn| Ok(conn.path().map(PathBuf::from)))
            .ok()
            .flatten()
    }

    /// Run `f` with exclusive access to the connection. Blocks the caller.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Background("connection mutex poisoned".into()))?;
        f(&mut guard)
    }
}

// ---------------------------------------------------------------------------
// Row operations
// ---------------------------------------------------------------------------

pub(crate) fn load_rows(conn: &Connection, kind: Kind, ids: &[i64]) -> Result<Vec<Option<StoredRow>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT version, body FROM entities WHERE kind = ?1 AND id = ?2",
    )?;
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        let row = stmt
            .query_row(params![kind.as_str(), id], |row| {
                Ok(StoredRow {
                    version: row.get(0)?,
                    body: row.get(1)?,
                })
            })
            .optional()?;
        rows.push(row);
    }
    Ok(rows)
}

/// IDs of `kind` matching every `(property, value)` equality filter, in
/// ascending ID order.
pub(crate) fn query_ids(
    conn: &Connection,
    kind: Kind,
    filters: &[(String, String)],
    limit: Option<usize>,
) -> Result<Vec<i64>> {
    let mut sql = String::from("SELECT e.id FROM entities e WHERE e.kind = ?");
    let mut values: Vec<String> = vec![kind.as_str().to_string()];
    for (property, value) in filters {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM entity_index i \
             WHERE i.kind = e.kind AND i.id = e.id AND i.property = ? AND i.value = ?)",
        );
        values.push(property.clone());
        values.push(value.clone());
    }
    sql.push_str(" ORDER BY e.id ASC");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, i64>(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

pub(crate) fn allocate_ids(conn: &Connection, count: usize) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached("INSERT INTO id_sequence DEFAULT VALUES")?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        stmt.execute([])?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

/// Apply `writes` atomically after checking that every `(key, version)` in
/// `expected` still holds. Version `0` means "must not exist".
pub(crate) fn apply(conn: &mut Connection, expected: &[(Key, i64)], writes: &[Write]) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for (key, version) in expected {
        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM entities WHERE kind = ?1 AND id = ?2",
                params![key.kind.as_str(), key.id],
                |row| row.get(0),
            )
            .optional()?;
        if current.unwrap_or(0) != *version {
            return Err(StoreError::Conflict(*key));
        }
    }

    for write in writes {
        match write {
            Write::Put { key, body, index } => {
                tx.execute(
                    "INSERT INTO entities (kind, id, version, body) VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(kind, id) DO UPDATE SET version = version + 1, body = excluded.body",
                    params![key.kind.as_str(), key.id, body],
                )?;
                tx.execute(
                    "DELETE FROM entity_index WHERE kind = ?1 AND id = ?2",
                    params![key.kind.as_str(), key.id],
                )?;
                for (property, value) in index {
                    tx.execute(
                        "INSERT INTO entity_index (kind, id, property, value) VALUES (?1, ?2, ?3, ?4)",
                        params![key.kind.as_str(), key.id, property, value],
                    )?;
                }
            }
            Write::Delete { key } => {
                tx.execute(
                    "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
                    params![key.kind.as_str(), key.id],
                )?;
            }
        }
    }

    tx.commit()?;
    Ok(())
}
