//! Durable session store
//!
//! Uses SQLite to persist session records and their archival output URLs

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// A recording session row
///
/// The consolidation pipeline only ever attaches the three output URLs;
/// everything else is owned by the session lifecycle collaborator.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub title: String,
    pub host_name: String,
    /// Empty until a guest accepts the invitation
    pub guest_name: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub is_live: bool,
    pub host_track_url: Option<String>,
    pub guest_track_url: Option<String>,
    pub merged_url: Option<String>,
}

/// Database connection wrapper
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize database tables
    fn init(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                host_name TEXT NOT NULL,
                guest_name TEXT,
                scheduled_at TEXT,
                is_live INTEGER NOT NULL DEFAULT 0,
                host_track_url TEXT,
                guest_track_url TEXT,
                merged_url TEXT
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert a new session row
    pub fn create_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions
             (session_id, title, host_name, guest_name, scheduled_at, is_live,
              host_track_url, guest_track_url, merged_url)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                session.session_id,
                session.title,
                session.host_name,
                session.guest_name,
                session.scheduled_at.map(|t| t.to_rfc3339()),
                session.is_live,
                session.host_track_url,
                session.guest_track_url,
                session.merged_url,
            ],
        )?;
        Ok(())
    }

    /// Fetch a session by id
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, title, host_name, guest_name, scheduled_at,
                    is_live, host_track_url, guest_track_url, merged_url
             FROM sessions WHERE session_id = ?",
        )?;

        let session = stmt
            .query_row([session_id], |row| {
                let scheduled: Option<String> = row.get(4)?;
                Ok(Session {
                    session_id: row.get(0)?,
                    title: row.get(1)?,
                    host_name: row.get(2)?,
                    guest_name: row.get(3)?,
                    scheduled_at: scheduled
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    is_live: row.get(5)?,
                    host_track_url: row.get(6)?,
                    guest_track_url: row.get(7)?,
                    merged_url: row.get(8)?,
                })
            })
            .optional()?;

        Ok(session)
    }

    /// Attach all three archival URLs to a session in one write
    ///
    /// The live flag is cleared at the same time; a session therefore shows
    /// either no consolidated output or a fully consistent set.
    pub fn update_recording_urls(
        &self,
        session_id: &str,
        host_url: &str,
        guest_url: &str,
        merged_url: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions
             SET host_track_url = ?, guest_track_url = ?, merged_url = ?, is_live = 0
             WHERE session_id = ?",
            params![host_url, guest_url, merged_url, session_id],
        )?;

        if updated == 0 {
            return Err(DatabaseError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}
