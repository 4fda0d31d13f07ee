//! Named advisory file locks.
//!
//! Four pieces of host state are shared between concurrent agent
//! invocations without any other coordination:
//!
//! - the set of container names (`container-<name>`), checked for duplicates
//!   before a clone;
//! - the VLAN gateway registry (`vlan-<id>`), read and extended by gateway
//!   election;
//! - a container's keyring directory (`keyring-<name>`), populated by key
//!   generation;
//! - the host UID ranges handed to containers (`uid-registry`), read and
//!   extended by UID assignment.
//!
//! Each is guarded by an exclusive `flock` on a file under the lock
//! directory. Locks are advisory: they only exclude other holders of the same
//! name.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock name would escape the lock directory.
    #[error("invalid lock name: {0:?}")]
    InvalidName(String),

    /// Creating or locking the lock file failed.
    #[error("failed to lock {path}: {source}")]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Directory in which named locks are created.
#[derive(Debug, Clone)]
pub struct LockDir {
    root: PathBuf,
}

impl LockDir {
    /// Use `root` as the lock directory. It is created on first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Block until the exclusive lock `name` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unusable or the lock file cannot be
    /// created or locked.
    pub fn acquire(&self, name: &str) -> Result<NamedLock, LockError> {
        if name.is_empty() || name.contains('/') || name.contains('\0') || name.starts_with('.') {
            return Err(LockError::InvalidName(name.to_string()));
        }

        let path = self.root.join(format!("{name}.lock"));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.root).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;
        file.lock_exclusive().map_err(io_err)?;

        debug!(lock = %name, "Acquired lock");
        Ok(NamedLock {
            name: name.to_string(),
            file,
        })
    }

    /// Lock guarding a container name.
    ///
    /// # Errors
    ///
    /// See [`LockDir::acquire`].
    pub fn container(&self, name: &str) -> Result<NamedLock, LockError> {
        self.acquire(&format!("container-{name}"))
    }

    /// Lock guarding gateway election on a VLAN.
    ///
    /// # Errors
    ///
    /// See [`LockDir::acquire`].
    pub fn vlan(&self, vlan: &str) -> Result<NamedLock, LockError> {
        self.acquire(&format!("vlan-{vlan}"))
    }

    /// Lock guarding generation of one keyring.
    ///
    /// # Errors
    ///
    /// See [`LockDir::acquire`].
    pub fn keyring(&self, name: &str) -> Result<NamedLock, LockError> {
        self.acquire(&format!("keyring-{name}"))
    }

    /// Lock guarding allocation of host UID ranges.
    ///
    /// # Errors
    ///
    /// See [`LockDir::acquire`].
    pub fn uid_map(&self) -> Result<NamedLock, LockError> {
        self.acquire("uid-registry")
    }
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    file: File,
}

impl NamedLock {
    /// Name the lock was acquired under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock as well.
        let _ = FileExt::unlock(&self.file);
        debug!(lock = %self.name, "Released lock");
    }
}
