//! `sessions` table: one row per logged-in browser session. The ABS token
//! is stored encrypted; decryption lives in sabconfig.

use crate::{now_rfc3339, Store};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub encrypted_token: String,
    pub user_id: String,
    pub username: String,
    pub created_at: String,
    pub last_used_at: String,
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        encrypted_token: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        created_at: row.get(4)?,
        last_used_at: row.get(5)?,
    })
}

const SESSION_COLUMNS: &str =
    "session_id, encrypted_token, user_id, username, created_at, last_used_at";

impl Store {
    pub fn insert_session(
        &self,
        session_id: &str,
        encrypted_token: &str,
        user_id: &str,
        username: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO sessions (session_id, encrypted_token, user_id, username,
                 created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![session_id, encrypted_token, user_id, username, now],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> rusqlite::Result<Option<Session>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS),
            [session_id],
            row_to_session,
        )
        .optional()
    }

    pub fn touch_session(&self, session_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sessions SET last_used_at = ?2 WHERE session_id = ?1",
            params![session_id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, session_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        Ok(())
    }

    /// Most recently used first; warm-up picks the head.
    pub fn list_sessions_recent(&self) -> rusqlite::Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY last_used_at DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_delete() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_session("sess-1", "enc-blob", "user-1", "alice")
            .unwrap();

        let session = store.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(session.encrypted_token, "enc-blob");

        store.delete_session("sess-1").unwrap();
        assert!(store.get_session("sess-1").unwrap().is_none());
    }

    #[test]
    fn recent_ordering_follows_touch() {
        let store = Store::open_in_memory().unwrap();
        store.insert_session("s1", "t1", "u1", "alice").unwrap();
        store.insert_session("s2", "t2", "u2", "bob").unwrap();

        // Force distinct timestamps
        store
            .conn()
            .execute(
                "UPDATE sessions SET last_used_at = '2020-01-01T00:00:00+00:00' WHERE session_id = 's1'",
                [],
            )
            .unwrap();

        let sessions = store.list_sessions_recent().unwrap();
        assert_eq!(sessions[0].session_id, "s2");
    }
}
