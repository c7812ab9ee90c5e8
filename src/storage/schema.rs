//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the progress database.

use crate::storage::metrics;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track engine runs
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    files_processed INTEGER NOT NULL DEFAULT 0,
    files_downloaded INTEGER NOT NULL DEFAULT 0,
    files_failed INTEGER NOT NULL DEFAULT 0,
    mb_downloaded REAL NOT NULL DEFAULT 0
);

-- One row per configured site
CREATE TABLE IF NOT EXISTS sites (
    name TEXT PRIMARY KEY,
    source_url TEXT NOT NULL,
    status TEXT NOT NULL,
    total_files INTEGER NOT NULL DEFAULT 0,
    completed_files INTEGER NOT NULL DEFAULT 0,
    failed_files INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    last_error TEXT,
    discovery_complete INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sites_status ON sites(status);

-- One row per remote file
CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_name TEXT NOT NULL REFERENCES sites(name),
    library_name TEXT NOT NULL,
    file_name TEXT NOT NULL,
    remote_id TEXT NOT NULL,
    destination_path TEXT NOT NULL,
    size_bytes INTEGER,
    size_mb REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    discovered_at TEXT NOT NULL,
    last_attempt_at TEXT,
    completed_at TEXT,
    UNIQUE(site_name, library_name, file_name)
);

CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
CREATE INDEX IF NOT EXISTS idx_downloads_site ON downloads(site_name);

-- Running counters
CREATE TABLE IF NOT EXISTS statistics (
    stat_name TEXT PRIMARY KEY,
    stat_value REAL NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);
"#;

/// Columns added after the first release, as `(table, column, definition)`
const ADDED_COLUMNS: [(&str, &str, &str); 1] = [(
    "sites",
    "discovery_complete",
    "INTEGER NOT NULL DEFAULT 0",
)];

/// Initializes the database schema and seeds the statistics counters
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;

    for (table, column, definition) in ADDED_COLUMNS {
        if !has_column(conn, table, column)? {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))?;
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    for name in metrics::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO statistics (stat_name, stat_value, last_updated) VALUES (?1, 0, ?2)",
            rusqlite::params![name, now],
        )?;
    }

    Ok(())
}

fn has_column(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
