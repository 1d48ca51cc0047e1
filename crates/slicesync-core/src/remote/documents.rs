//! Server-side document storage
//!
//! Documents served by [`DocumentServer`](super::DocumentServer) live in a
//! single SQLite table keyed by `(session, slice)`. The body column holds the
//! whole document as a JSON object, so fields written by other clients
//! survive a write-merge.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::{merge_fields, write_payload, DocumentKey};
use crate::keys::{SessionId, SliceKey};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    session TEXT NOT NULL,
    slice TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (session, slice)
);
"#;

/// SQLite-backed document table
pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open or create the document database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open document database at {:?}", path))?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize document schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full document, or `None` if it does not exist
    pub fn get(&self, key: &DocumentKey) -> Result<Option<Map<String, Value>>> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM documents WHERE session = ?1 AND slice = ?2",
                params![key.session.as_str(), key.slice.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|body| parse_body(key, &body)).transpose()
    }

    /// Upsert the `value` field of a document, keeping its other fields
    ///
    /// Returns the document as stored.
    pub fn merge(&self, key: &DocumentKey, value: Value) -> Result<Map<String, Value>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT body FROM documents WHERE session = ?1 AND slice = ?2",
                params![key.session.as_str(), key.slice.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let mut document = match existing {
            Some(body) => parse_body(key, &body)?,
            None => Map::new(),
        };
        merge_fields(&mut document, write_payload(value));

        let body = serde_json::to_string(&document)?;
        tx.execute(
            "INSERT INTO documents (session, slice, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session, slice) DO UPDATE
             SET body = excluded.body, updated_at = excluded.updated_at",
            params![
                key.session.as_str(),
                key.slice.as_str(),
                body,
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;

        Ok(document)
    }

    /// Delete a document; returns whether it existed
    pub fn delete(&self, key: &DocumentKey) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM documents WHERE session = ?1 AND slice = ?2",
            params![key.session.as_str(), key.slice.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Slices stored for a session
    pub fn list(&self, session: &SessionId) -> Result<Vec<SliceKey>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT slice FROM documents WHERE session = ?1 ORDER BY slice")?;
        let names = stmt
            .query_map(params![session.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        names
            .into_iter()
            .map(|name| {
                SliceKey::new(name.as_str())
                    .with_context(|| format!("Invalid slice key {:?} in document table", name))
            })
            .collect()
    }
}

fn parse_body(key: &DocumentKey, body: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(body)
        .with_context(|| format!("Failed to parse document {}", key))?
    {
        Value::Object(document) => Ok(document),
        other => bail!("Document {} is not an object: {}", key, other),
    }
}
