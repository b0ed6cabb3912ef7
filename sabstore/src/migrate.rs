//! Schema creation and additive migrations.
//!
//! Migrations are column-adds only, each guarded by a column-existence
//! check, so any released schema upgrades in place without a version table.

use rusqlite::Connection;
use tracing::debug;

pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            encrypted_token TEXT NOT NULL,
            user_id TEXT NOT NULL,
            username TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_index (
            item_id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            source_size INTEGER NOT NULL,
            source_mtime INTEGER NOT NULL,
            profile_version TEXT NOT NULL,
            cache_format TEXT NOT NULL,
            segment_count INTEGER NOT NULL DEFAULT 1,
            segment_duration_sec INTEGER NOT NULL DEFAULT 0,
            duration_sec REAL,
            status TEXT NOT NULL DEFAULT 'pending',
            error_text TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cache_index_status
         ON cache_index (status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sonos_devices (
            uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            ip TEXT NOT NULL,
            location_url TEXT NOT NULL,
            model TEXT NOT NULL,
            is_reachable INTEGER NOT NULL DEFAULT 0,
            is_hidden INTEGER NOT NULL DEFAULT 0,
            group_size INTEGER NOT NULL DEFAULT 1,
            discovered_at TEXT NOT NULL,
            last_seen TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS playback_sessions (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            sonos_uuid TEXT NOT NULL,
            stream_token TEXT NOT NULL,
            position_sec REAL NOT NULL DEFAULT 0,
            duration_sec REAL NOT NULL DEFAULT 0,
            current_segment INTEGER NOT NULL DEFAULT 0,
            segment_duration_sec INTEGER NOT NULL DEFAULT 0,
            is_playing INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            last_position_update TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_playback_sessions_session
         ON playback_sessions (session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_playback_sessions_token
         ON playback_sessions (stream_token)",
        [],
    )?;

    // Later additions
    add_column_if_missing(
        conn,
        "playback_sessions",
        "abs_progress_synced_at",
        "TEXT",
    )?;
    add_column_if_missing(conn, "playback_sessions", "sleep_at", "TEXT")?;

    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    debug!("Adding column {}.{}", table, column);
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert!(column_exists(&conn, "playback_sessions", "sleep_at").unwrap());
    }

    #[test]
    fn guarded_add_detects_existing_column() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert!(column_exists(&conn, "cache_index", "status").unwrap());
        assert!(!column_exists(&conn, "cache_index", "no_such_column").unwrap());
        // Second add must be a no-op, not an error
        add_column_if_missing(&conn, "playback_sessions", "sleep_at", "TEXT").unwrap();
    }
}
