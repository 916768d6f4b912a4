use rusqlite::Connection;

// Numeric ids are allocated from one sequence shared by every kind, so an id
// never repeats even across kinds.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS id_sequence (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
