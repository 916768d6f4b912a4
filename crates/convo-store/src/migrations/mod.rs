//! Schema migrations, applied in order when a [`crate::Database`] opens.
//! `PRAGMA user_version` records the last one applied.

pub mod v001_initial;
pub mod v002_id_sequence;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Up = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// `(version, name, up)`, ascending. Append only.
const MIGRATIONS: &[(u32, &str, Up)] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_id_sequence", v002_id_sequence::up),
];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = MIGRATIONS.last().map_or(0, |(version, ..)| *version);
    tracing::info!(current, target, "checking database schema");

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, ..)| *v > current) {
        tracing::info!(migration = name, "applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
