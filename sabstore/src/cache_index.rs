//! `cache_index` table: one row per transcoded item.

use crate::{now_rfc3339, Store};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Build lifecycle of a cache entry. Transitions are monotonic:
/// pending → in_progress → ready | failed. A retry deletes the row and
/// starts over with a fresh pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Pending,
    InProgress,
    Ready,
    Failed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Pending => "pending",
            CacheStatus::InProgress => "in_progress",
            CacheStatus::Ready => "ready",
            CacheStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CacheStatus::Pending),
            "in_progress" => Some(CacheStatus::InProgress),
            "ready" => Some(CacheStatus::Ready),
            "failed" => Some(CacheStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub item_id: String,
    /// First source file, kept for staleness checks.
    pub source_path: String,
    /// Cumulative size of all source files in bytes.
    pub source_size: i64,
    /// Modification time of the first source file (unix seconds).
    pub source_mtime: i64,
    /// Compatibility-policy revision the entry was built under.
    pub profile_version: String,
    /// Artifact container/extension (mp3, m4a, flac, ogg, wma).
    pub cache_format: String,
    pub segment_count: u32,
    /// 0 when the artifact is a single file.
    pub segment_duration_sec: u32,
    pub duration_sec: Option<f64>,
    pub status: CacheStatus,
    pub error_text: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CacheEntry {
    pub fn is_segmented(&self) -> bool {
        self.segment_count > 1
    }
}

/// Fields required to create a pending entry.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub item_id: String,
    pub source_path: String,
    pub source_size: i64,
    pub source_mtime: i64,
    pub profile_version: String,
    pub cache_format: String,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let status_text: String = row.get(9)?;
    let status = CacheStatus::parse(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown cache status: {}", status_text).into(),
        )
    })?;

    Ok(CacheEntry {
        item_id: row.get(0)?,
        source_path: row.get(1)?,
        source_size: row.get(2)?,
        source_mtime: row.get(3)?,
        profile_version: row.get(4)?,
        cache_format: row.get(5)?,
        segment_count: row.get(6)?,
        segment_duration_sec: row.get(7)?,
        duration_sec: row.get(8)?,
        status,
        error_text: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

const ENTRY_COLUMNS: &str = "item_id, source_path, source_size, source_mtime, profile_version, \
     cache_format, segment_count, segment_duration_sec, duration_sec, status, \
     error_text, created_at, updated_at";

impl Store {
    /// Inserts a fresh pending entry. Returns `false` when a row for the
    /// item already exists (another caller won the race); the primary key
    /// on item_id is what enforces at-most-one build.
    pub fn create_cache_entry(&self, entry: &NewCacheEntry) -> rusqlite::Result<bool> {
        let conn = self.conn();
        let now = now_rfc3339();
        let changed = conn.execute(
            "INSERT INTO cache_index (item_id, source_path, source_size, source_mtime,
                 profile_version, cache_format, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)
             ON CONFLICT(item_id) DO NOTHING",
            params![
                entry.item_id,
                entry.source_path,
                entry.source_size,
                entry.source_mtime,
                entry.profile_version,
                entry.cache_format,
                now,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_cache_entry(&self, item_id: &str) -> rusqlite::Result<Option<CacheEntry>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM cache_index WHERE item_id = ?1", ENTRY_COLUMNS),
            [item_id],
            row_to_entry,
        )
        .optional()
    }

    /// pending → in_progress. Returns `false` when the row was not pending,
    /// i.e. some other worker claimed it first.
    pub fn claim_cache_entry(&self, item_id: &str) -> rusqlite::Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE cache_index SET status = 'in_progress', updated_at = ?2
             WHERE item_id = ?1 AND status = 'pending'",
            params![item_id, now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_cache_ready(
        &self,
        item_id: &str,
        duration_sec: f64,
        cache_format: &str,
        segment_count: u32,
        segment_duration_sec: u32,
    ) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE cache_index SET status = 'ready', duration_sec = ?2,
                 cache_format = ?3, segment_count = ?4, segment_duration_sec = ?5,
                 error_text = NULL, updated_at = ?6
             WHERE item_id = ?1",
            params![
                item_id,
                duration_sec,
                cache_format,
                segment_count,
                segment_duration_sec,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_cache_failed(&self, item_id: &str, error_text: &str) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE cache_index SET status = 'failed', error_text = ?2, updated_at = ?3
             WHERE item_id = ?1",
            params![item_id, error_text, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_cache_entry(&self, item_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM cache_index WHERE item_id = ?1", [item_id])?;
        Ok(())
    }

    pub fn list_cache_entries(&self) -> rusqlite::Result<Vec<CacheEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cache_index ORDER BY updated_at DESC",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn list_cache_by_status(&self, status: CacheStatus) -> rusqlite::Result<Vec<CacheEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cache_index WHERE status = ?1 ORDER BY updated_at DESC",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([status.as_str()], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Startup recovery: builds interrupted by a crash go back to pending
    /// so the warm-up pass (or the next on-demand request) re-queues them.
    pub fn reset_in_progress_entries(&self) -> rusqlite::Result<usize> {
        let conn = self.conn();
        conn.execute(
            "UPDATE cache_index SET status = 'pending', updated_at = ?1
             WHERE status = 'in_progress'",
            [now_rfc3339()],
        )
    }
}
