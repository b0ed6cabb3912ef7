//! `playback_sessions` table: one row per active playback, keyed by id with
//! secondary lookups by browser session and by stream token.
//!
//! `position_sec` is always the global position across the whole book;
//! segment-local positions never reach the database.

use crate::{now_rfc3339, Store};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSession {
    pub id: String,
    pub session_id: String,
    pub item_id: String,
    pub sonos_uuid: String,
    pub stream_token: String,
    pub position_sec: f64,
    pub duration_sec: f64,
    pub current_segment: u32,
    /// 0 when the cached artifact is a single file.
    pub segment_duration_sec: u32,
    pub is_playing: bool,
    pub started_at: String,
    pub last_position_update: String,
    pub abs_progress_synced_at: Option<String>,
    /// RFC3339 instant at which the sleep timer fires.
    pub sleep_at: Option<String>,
}

fn row_to_playback(row: &Row<'_>) -> rusqlite::Result<PlaybackSession> {
    Ok(PlaybackSession {
        id: row.get(0)?,
        session_id: row.get(1)?,
        item_id: row.get(2)?,
        sonos_uuid: row.get(3)?,
        stream_token: row.get(4)?,
        position_sec: row.get(5)?,
        duration_sec: row.get(6)?,
        current_segment: row.get(7)?,
        segment_duration_sec: row.get(8)?,
        is_playing: row.get::<_, i64>(9)? != 0,
        started_at: row.get(10)?,
        last_position_update: row.get(11)?,
        abs_progress_synced_at: row.get(12)?,
        sleep_at: row.get(13)?,
    })
}

const PLAYBACK_COLUMNS: &str = "id, session_id, item_id, sonos_uuid, stream_token, position_sec, \
     duration_sec, current_segment, segment_duration_sec, is_playing, \
     started_at, last_position_update, abs_progress_synced_at, sleep_at";

impl Store {
    pub fn insert_playback(&self, ps: &PlaybackSession) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO playback_sessions (id, session_id, item_id, sonos_uuid,
                 stream_token, position_sec, duration_sec, current_segment,
                 segment_duration_sec, is_playing, started_at, last_position_update,
                 abs_progress_synced_at, sleep_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                ps.id,
                ps.session_id,
                ps.item_id,
                ps.sonos_uuid,
                ps.stream_token,
                ps.position_sec,
                ps.duration_sec,
                ps.current_segment,
                ps.segment_duration_sec,
                ps.is_playing as i64,
                ps.started_at,
                ps.last_position_update,
                ps.abs_progress_synced_at,
                ps.sleep_at,
            ],
        )?;
        Ok(())
    }

    /// Writes back every mutable field of the session.
    pub fn update_playback(&self, ps: &PlaybackSession) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE playback_sessions SET sonos_uuid = ?2, stream_token = ?3,
                 position_sec = ?4, current_segment = ?5, is_playing = ?6,
                 last_position_update = ?7, abs_progress_synced_at = ?8, sleep_at = ?9
             WHERE id = ?1",
            params![
                ps.id,
                ps.sonos_uuid,
                ps.stream_token,
                ps.position_sec,
                ps.current_segment,
                ps.is_playing as i64,
                ps.last_position_update,
                ps.abs_progress_synced_at,
                ps.sleep_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_playback(&self, id: &str) -> rusqlite::Result<Option<PlaybackSession>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM playback_sessions WHERE id = ?1", PLAYBACK_COLUMNS),
            [id],
            row_to_playback,
        )
        .optional()
    }

    /// The one playback session of a browser session, if any.
    pub fn get_playback_by_session(
        &self,
        session_id: &str,
    ) -> rusqlite::Result<Option<PlaybackSession>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {} FROM playback_sessions WHERE session_id = ?1
                 ORDER BY started_at DESC LIMIT 1",
                PLAYBACK_COLUMNS
            ),
            [session_id],
            row_to_playback,
        )
        .optional()
    }

    pub fn get_playback_by_token(
        &self,
        stream_token: &str,
    ) -> rusqlite::Result<Option<PlaybackSession>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {} FROM playback_sessions WHERE stream_token = ?1",
                PLAYBACK_COLUMNS
            ),
            [stream_token],
            row_to_playback,
        )
        .optional()
    }

    pub fn list_playback_sessions(&self) -> rusqlite::Result<Vec<PlaybackSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM playback_sessions",
            PLAYBACK_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], row_to_playback)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn delete_playback(&self, id: &str) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM playback_sessions WHERE id = ?1", [id])?;
        Ok(())
    }
}

/// Fresh playback session with timestamps set to now.
pub fn new_playback_session(
    id: impl Into<String>,
    session_id: impl Into<String>,
    item_id: impl Into<String>,
    sonos_uuid: impl Into<String>,
    stream_token: impl Into<String>,
    position_sec: f64,
    duration_sec: f64,
    current_segment: u32,
    segment_duration_sec: u32,
) -> PlaybackSession {
    let now = now_rfc3339();
    PlaybackSession {
        id: id.into(),
        session_id: session_id.into(),
        item_id: item_id.into(),
        sonos_uuid: sonos_uuid.into(),
        stream_token: stream_token.into(),
        position_sec,
        duration_sec,
        current_segment,
        segment_duration_sec,
        is_playing: true,
        started_at: now.clone(),
        last_position_update: now,
        abs_progress_synced_at: None,
        sleep_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PlaybackSession {
        new_playback_session(
            "pb-1", "sess-1", "item-1", "RINCON_1", "tok-1", 1000.0, 9000.0, 0, 7200,
        )
    }

    #[test]
    fn insert_and_secondary_lookups() {
        let store = Store::open_in_memory().unwrap();
        store.insert_playback(&sample()).unwrap();

        assert!(store.get_playback("pb-1").unwrap().is_some());
        assert_eq!(
            store
                .get_playback_by_session("sess-1")
                .unwrap()
                .unwrap()
                .id,
            "pb-1"
        );
        assert_eq!(
            store.get_playback_by_token("tok-1").unwrap().unwrap().id,
            "pb-1"
        );
    }

    #[test]
    fn update_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut ps = sample();
        store.insert_playback(&ps).unwrap();

        ps.position_sec = 7500.0;
        ps.current_segment = 1;
        ps.is_playing = false;
        ps.sonos_uuid = "RINCON_2".to_string();
        ps.stream_token = "tok-2".to_string();
        ps.sleep_at = Some("2026-01-01T00:00:00+00:00".to_string());
        store.update_playback(&ps).unwrap();

        let loaded = store.get_playback("pb-1").unwrap().unwrap();
        assert_eq!(loaded.position_sec, 7500.0);
        assert_eq!(loaded.current_segment, 1);
        assert!(!loaded.is_playing);
        assert_eq!(loaded.sonos_uuid, "RINCON_2");
        assert_eq!(loaded.sleep_at.as_deref(), Some("2026-01-01T00:00:00+00:00"));
    }

    #[test]
    fn delete_removes_row() {
        let store = Store::open_in_memory().unwrap();
        store.insert_playback(&sample()).unwrap();
        store.delete_playback("pb-1").unwrap();
        assert!(store.get_playback("pb-1").unwrap().is_none());
        assert!(store.list_playback_sessions().unwrap().is_empty());
    }
}
