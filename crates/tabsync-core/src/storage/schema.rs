//! SQLite schema for the persistence database
//!
//! One physical database holds every persisted document, namespaced by
//! `doc_key` (the persistence key). Three partitions per key:
//!
//! - `snapshots` - latest compacted document state, one row per key
//! - `changes`   - ordered log of change entries since the snapshot
//! - `sessions`  - advisory registry of active sessions

use rusqlite::{Connection, Result};

/// Current database layout version (distinct from document schema versions,
/// which are stored per snapshot row).
pub const DB_LAYOUT_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Layout version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Latest compacted snapshot per document
        CREATE TABLE IF NOT EXISTS snapshots (
            doc_key TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            records TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- Change log since the snapshot, ordered by seq within a document
        CREATE TABLE IF NOT EXISTS changes (
            doc_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            record_id TEXT NOT NULL,
            entry TEXT NOT NULL,
            PRIMARY KEY (doc_key, seq)
        );

        -- Advisory session registry
        CREATE TABLE IF NOT EXISTS sessions (
            doc_key TEXT NOT NULL,
            session_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            registered_at TEXT NOT NULL,
            PRIMARY KEY (doc_key, session_id)
        );

        -- Fast per-record lookups in the change log
        CREATE INDEX IF NOT EXISTS idx_changes_record_id ON changes(doc_key, record_id);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [DB_LAYOUT_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current layout version from the database
pub fn get_layout_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if the schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_layout_version(conn) {
        Ok(Some(v)) => v < DB_LAYOUT_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"snapshots".to_string()));
        assert!(tables.contains(&"changes".to_string()));
        assert!(tables.contains(&"sessions".to_string()));
    }

    #[test]
    fn test_layout_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));
        init_schema(&conn).unwrap();

        assert_eq!(get_layout_version(&conn).unwrap(), Some(DB_LAYOUT_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert!(!needs_init(&conn));
    }
}
