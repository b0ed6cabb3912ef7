//! Persistent state of the bridge: a single SQLite database
//! (`<config_dir>/bridge.db`) holding user sessions, the transcode cache
//! index, discovered renderers and active playback sessions.
//!
//! The connection lives behind a `Mutex`; every access is a short
//! single-statement transaction, so write serialization through the lock is
//! sufficient. Row structs are plain data; all domain logic lives in the
//! crates built on top.

mod cache_index;
mod devices;
mod migrate;
mod playback;
mod sessions;

pub use cache_index::{CacheStatus, CacheEntry, NewCacheEntry};
pub use devices::{NewDevice, SonosDevice};
pub use playback::{new_playback_session, PlaybackSession};
pub use sessions::Session;

// Callers match on database errors without declaring their own rusqlite
// dependency.
pub use rusqlite;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// Handle on `bridge.db`.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (or creates) the database file and applies migrations.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// UTC timestamp in the format every table uses.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
