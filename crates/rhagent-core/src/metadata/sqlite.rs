//! `SQLite`-backed metadata store.

use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension, params};

use super::{MetadataRecord, MetadataSession, MetadataStore, StoreError};

const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS templates (
    name TEXT PRIMARY KEY,
    id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS containers (
    name TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (name, key)
);
";

/// Metadata store in a single `SQLite` file. Every [`MetadataStore::open`]
/// makes a new connection.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    path: PathBuf,
}

impl SqliteMetadataStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Record that template `name` is backed by `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be written.
    pub fn register_template(&self, name: &str, id: &str) -> Result<(), StoreError> {
        self.connect()?.execute(
            "INSERT OR REPLACE INTO templates (name, id) VALUES (?1, ?2)",
            params![name, id],
        )?;
        Ok(())
    }

    /// Read back the record stored for container `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn container_record(&self, name: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key, value FROM containers WHERE name = ?1")?;
        let record = stmt
            .query_map(params![name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<MetadataRecord, _>>()?;

        Ok((!record.is_empty()).then_some(record))
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn open(&self) -> Result<Box<dyn MetadataSession + '_>, StoreError> {
        Ok(Box::new(SqliteSession {
            conn: self.connect()?,
        }))
    }
}

struct SqliteSession {
    conn: Connection,
}

impl MetadataSession for SqliteSession {
    fn template_id(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM templates WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_container(&mut self, name: &str, record: &MetadataRecord) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM containers WHERE name = ?1", params![name])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO containers (name, key, value) VALUES (?1, ?2, ?3)")?;
            for (key, value) in record.iter() {
                insert.execute(params![name, key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        let Self { conn } = *self;
        conn.close().map_err(|(_, e)| StoreError::Database(e))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::metadata::{KEY_PARENT, KEY_UID};

    #[test]
    fn test_template_lookup() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::new(dir.path().join("agent.db"));
        store.register_template("base", "4f2c0e").unwrap();

        let session = store.open().unwrap();
        assert_eq!(session.template_id("base").unwrap().as_deref(), Some("4f2c0e"));
        assert_eq!(session.template_id("other").unwrap(), None);
        session.close().unwrap();
    }

    #[test]
    fn test_put_container_replaces_record() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::new(dir.path().join("db").join("agent.db"));

        let first: MetadataRecord = [(KEY_PARENT, "base"), (KEY_UID, "65536"), ("ip", "10.0.0.2")]
            .into_iter()
            .collect();
        let second: MetadataRecord = [(KEY_PARENT, "base"), (KEY_UID, "131072")]
            .into_iter()
            .collect();

        let mut session = store.open().unwrap();
        session.put_container("c1", &first).unwrap();
        session.put_container("c1", &second).unwrap();
        session.close().unwrap();

        assert_eq!(store.container_record("c1").unwrap(), Some(second));
        assert_eq!(store.container_record("c2").unwrap(), None);
    }

    #[test]
    fn test_sessions_are_independent_connections() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::new(dir.path().join("agent.db"));

        let mut a = store.open().unwrap();
        a.put_container("c1", &[(KEY_UID, "1")].into_iter().collect())
            .unwrap();
        a.close().unwrap();

        let mut b = store.open().unwrap();
        b.put_container("c2", &[(KEY_UID, "2")].into_iter().collect())
            .unwrap();
        b.close().unwrap();

        assert!(store.container_record("c1").unwrap().is_some());
        assert!(store.container_record("c2").unwrap().is_some());
    }
}
