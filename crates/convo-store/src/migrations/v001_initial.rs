//! v001 -- Initial schema creation.
//!
//! Two tables: `entities` holds one JSON document per `(kind, id)` and
//! `entity_index` holds the queryable properties of each document.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Entities
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS entities (
    kind     TEXT    NOT NULL,              -- User, Thread, Event, Message, Note
    id       INTEGER NOT NULL,              -- server-assigned numeric id
    version  INTEGER NOT NULL,              -- bumped on every write
    body     TEXT    NOT NULL,              -- JSON document

    PRIMARY KEY (kind, id)
);

-- ----------------------------------------------------------------
-- Property index
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS entity_index (
    kind     TEXT    NOT NULL,
    id       INTEGER NOT NULL,
    property TEXT    NOT NULL,
    value    TEXT    NOT NULL,

    FOREIGN KEY (kind, id) REFERENCES entities(kind, id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entity_index_lookup
    ON entity_index(kind, property, value);

CREATE INDEX IF NOT EXISTS idx_entity_index_owner
    ON entity_index(kind, id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
