//! Container metadata records and the store they are persisted in.
//!
//! The clone pipeline talks to the store through [`MetadataStore`], opening
//! a fresh [`MetadataSession`] for each use and closing it immediately
//! afterwards. The store itself serializes concurrent writers; nothing here
//! holds a connection across calls.

use std::collections::BTreeMap;

use thiserror::Error;

mod sqlite;

pub use sqlite::SqliteMetadataStore;

/// Template the container was cloned from (resolved id).
pub const KEY_PARENT: &str = "parent";
/// Owning environment.
pub const KEY_ENVIRONMENT: &str = "environment";
/// Static address (without prefix length).
pub const KEY_IP: &str = "ip";
/// VLAN tag of a statically addressed container.
pub const KEY_VLAN: &str = "vlan";
/// Base of the mapped UID range.
pub const KEY_UID: &str = "uid";
/// Host-side veth interface.
pub const KEY_INTERFACE: &str = "interface";

/// Provisioning-time attributes of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord(BTreeMap<String, String>);

impl MetadataRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetadataRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Metadata store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The database directory could not be prepared.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// A source of metadata sessions.
pub trait MetadataStore: Send + Sync {
    /// Open a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn open(&self) -> Result<Box<dyn MetadataSession + '_>, StoreError>;
}

/// One open connection to the metadata store.
pub trait MetadataSession {
    /// Backing id of the template registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails. An unknown name is
    /// `Ok(None)`.
    fn template_id(&self, name: &str) -> Result<Option<String>, StoreError>;

    /// Replace the record stored for container `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn put_container(&mut self, name: &str, record: &MetadataRecord) -> Result<(), StoreError>;

    /// Close the session, reporting any error the backend raises on close.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to close cleanly.
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keys_are_sorted() {
        let mut record = MetadataRecord::new();
        record.insert(KEY_UID, "65536");
        record.insert(KEY_PARENT, "base");
        record.insert(KEY_INTERFACE, "veth0a1b2c3d");

        let keys: Vec<_> = record.keys().collect();
        assert_eq!(keys, vec!["interface", "parent", "uid"]);
        assert_eq!(record.get(KEY_UID), Some("65536"));
        assert!(!record.contains_key(KEY_IP));
    }

    #[test]
    fn test_insert_replaces() {
        let mut record: MetadataRecord = [(KEY_VLAN, "1")].into_iter().collect();
        record.insert(KEY_VLAN, "42");
        assert_eq!(record.len(), 1);
        assert_eq!(record.get(KEY_VLAN), Some("42"));
    }
}
