//! Per-container and host keypairs.
//!
//! A container's keyring lives in its own directory as `public.pub` and
//! `secret.sec`, with identity `<name>@<key_domain>`. A name that is not a
//! container gets a host identity instead: the keypair is generated into
//! the host keyring directory with the bare name as its email field and then
//! imported into the host's default keyring.
//!
//! Keypair generation is serialized per name through the `keyring-<name>`
//! lock and skipped when `secret.sec` already exists.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AgentSection;
use crate::engine::ContainerEngine;
use crate::lock::{LockDir, LockError};

mod gpg;
pub mod parse;

pub use gpg::{Gpg, GpgArgs, GpgCommand, GpgOutput};

const PUBLIC_KEYRING: &str = "public.pub";
const SECRET_KEYRING: &str = "secret.sec";
const BATCH_FILE: &str = "defaults";

/// Identity manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// gpg could not be started or its pipes failed.
    #[error("failed to run {binary}: {source}")]
    Spawn {
        /// Executable.
        binary: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// gpg exited unsuccessfully.
    #[error("gpg {operation} failed (exit code {code:?}): {stderr}")]
    Gpg {
        /// What gpg was asked to do.
        operation: &'static str,
        /// Exit code, if any.
        code: Option<i32>,
        /// Captured diagnostics.
        stderr: String,
    },

    /// Filesystem access failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The keyring lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Exporting a public key produced nothing.
    #[error("no public key available for {0}")]
    EmptyExport(String),
}

/// Where a name's keypair lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringPaths {
    /// Directory holding the keyring files.
    pub dir: PathBuf,
    /// Public keyring file.
    pub public: PathBuf,
    /// Secret keyring file.
    pub secret: PathBuf,
    /// Email field of the generated key.
    pub email: String,
    /// Whether this is a host (not container-scoped) identity.
    pub host: bool,
}

/// Outcome of [`IdentityManager::generate_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    /// A new keypair was created.
    Created,
    /// A secret keyring already existed.
    Existing,
}

/// Identity Manager.
pub struct IdentityManager<'a> {
    config: &'a AgentSection,
    engine: &'a dyn ContainerEngine,
    gpg: &'a dyn Gpg,
    locks: &'a LockDir,
}

impl<'a> IdentityManager<'a> {
    #[must_use]
    pub fn new(
        config: &'a AgentSection,
        engine: &'a dyn ContainerEngine,
        gpg: &'a dyn Gpg,
        locks: &'a LockDir,
    ) -> Self {
        Self {
            config,
            engine,
            gpg,
            locks,
        }
    }

    /// Keyring location for `name`, container-scoped when `name` is an
    /// existing container.
    #[must_use]
    pub fn keyring_paths(&self, name: &str) -> KeyringPaths {
        let (dir, email, host) = if self.engine.container_exists(name) {
            (
                self.config.container_dir(name),
                self.config.container_email(name),
                false,
            )
        } else {
            (self.config.gpg_home(), name.to_string(), true)
        };
        KeyringPaths {
            public: dir.join(PUBLIC_KEYRING),
            secret: dir.join(SECRET_KEYRING),
            dir,
            email,
            host,
        }
    }

    /// Container-scoped public keyring, regardless of whether the container
    /// exists.
    #[must_use]
    pub fn container_keyring(&self, name: &str) -> PathBuf {
        self.config.container_dir(name).join(PUBLIC_KEYRING)
    }

    /// Container-scoped secret keyring.
    #[must_use]
    pub fn container_secret_keyring(&self, name: &str) -> PathBuf {
        self.config.container_dir(name).join(SECRET_KEYRING)
    }

    /// Create the keypair for `name` unless its secret keyring exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring lock, the batch file or key
    /// generation itself fails. Importing a host key into the default
    /// keyring only logs on failure.
    pub fn generate_key(&self, name: &str) -> Result<KeyGeneration, IdentityError> {
        let _guard = self.locks.keyring(name)?;
        let paths = self.keyring_paths(name);

        create_keyring_dir(&paths.dir, paths.host)?;

        let outcome = if paths.secret.exists() {
            debug!(
                name = %name,
                keyring = %paths.secret.display(),
                "Secret key exists, skipping generation"
            );
            KeyGeneration::Existing
        } else {
            self.run_batch_generation(name, &paths)?;
            info!(name = %name, email = %paths.email, "Generated keypair");
            KeyGeneration::Created
        };

        if paths.host {
            self.import_host_keys(&paths);
        }
        Ok(outcome)
    }

    fn run_batch_generation(&self, name: &str, paths: &KeyringPaths) -> Result<(), IdentityError> {
        let batch = paths.dir.join(BATCH_FILE);
        let _cleanup = RemoveOnDrop(&batch);

        let contents = format!(
            "%echo Generating default keys\n\
             Key-Type: RSA\n\
             Key-Length: 2048\n\
             Name-Real: {name}\n\
             Name-Comment: {name} GPG key\n\
             Name-Email: {email}\n\
             Expire-Date: 0\n\
             Passphrase: {pass}\n\
             %pubring {public}\n\
             %secring {secret}\n\
             %commit\n\
             %echo Done\n",
            email = paths.email,
            pass = self.config.gpg_password.expose_secret(),
            public = paths.public.display(),
            secret = paths.secret.display(),
        );
        write_private(&batch, contents.as_bytes())?;

        self.gpg
            .run(&GpgArgs::new().arg("--batch").arg("--gen-key").path(&batch), None)?
            .require_success("key generation")?;
        Ok(())
    }

    fn import_host_keys(&self, paths: &KeyringPaths) {
        let imports = [
            (
                GpgArgs::new()
                    .arg("--batch")
                    .arg("--allow-secret-key-import")
                    .arg("--import")
                    .path(&paths.secret),
                "secret",
            ),
            (
                GpgArgs::new().arg("--batch").arg("--import").path(&paths.public),
                "public",
            ),
        ];
        for (args, kind) in imports {
            match self.gpg.run(&args, None) {
                Ok(out) if out.success() => debug!(kind, "Imported host key"),
                Ok(out) => warn!(kind, stderr = %out.stderr_text().trim(), "Importing host key"),
                Err(e) => warn!(kind, error = %e, "Importing host key"),
            }
        }
        remove_lock_files(&paths.dir);
    }

    /// Fingerprint of the key for `name`.
    ///
    /// The configured host identity is looked up in the default keyring;
    /// every other name in its container keyring. `None` when gpg reports no
    /// parsable fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error only if gpg cannot be run.
    pub fn fingerprint(&self, name: &str) -> Result<Option<String>, IdentityError> {
        let args = self.fingerprint_args(name);
        let out = self.gpg.run(&args, None)?;
        if !out.success() {
            debug!(name = %name, stderr = %out.stderr_text().trim(), "gpg --fingerprint failed");
        }

        let fingerprint = parse::fingerprint(&out.stdout_text());
        if fingerprint.is_none() {
            warn!(name = %name, "No fingerprint found");
        }
        Ok(fingerprint)
    }

    /// Arguments used by [`IdentityManager::fingerprint`].
    #[must_use]
    pub fn fingerprint_args(&self, name: &str) -> GpgArgs {
        let args = GpgArgs::new().arg("--fingerprint");
        if name == self.config.gpg_user {
            args.arg(name)
        } else {
            args.arg("--keyring")
                .path(&self.container_keyring(name))
                .arg(name)
        }
    }

    /// Armored public key of `name` from the default keyring, generating a
    /// keypair first if none is exported.
    ///
    /// # Errors
    ///
    /// Returns an error if gpg fails to run, generation fails, or the export
    /// is still empty afterwards.
    pub fn public_key(&self, name: &str) -> Result<String, IdentityError> {
        let export = GpgArgs::new().arg("--export").arg("-a").arg(name);

        let key = self.gpg.run(&export, None)?.stdout_text();
        if !key.trim().is_empty() {
            return Ok(key);
        }

        warn!(name = %name, "Public key not found, generating a new one");
        self.generate_key(name)?;

        let key = self.gpg.run(&export, None)?.stdout_text();
        if key.trim().is_empty() {
            return Err(IdentityError::EmptyExport(name.to_string()));
        }
        Ok(key)
    }

    /// Armored public key of container `name` from its own keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if gpg fails or exports nothing.
    pub fn container_public_key(&self, name: &str) -> Result<String, IdentityError> {
        let out = self
            .gpg
            .run(
                &GpgArgs::new()
                    .keyring(&self.container_keyring(name))
                    .arg("--export")
                    .arg("--armor")
                    .arg(self.config.container_email(name)),
                None,
            )?
            .require_success("export")?;
        let key = out.stdout_text();
        if key.trim().is_empty() {
            return Err(IdentityError::EmptyExport(name.to_string()));
        }
        Ok(key)
    }

    /// Import an armored public key into the default keyring, returning
    /// gpg's combined output.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be staged or gpg fails.
    pub fn import_public_key(&self, key: &[u8]) -> Result<String, IdentityError> {
        let staged = stage(key)?;
        let out = self
            .gpg
            .run(&GpgArgs::new().arg("--batch").arg("--import").path(staged.path()), None)?
            .require_success("import")?;
        Ok(format!("{}{}", out.stdout_text(), out.stderr_text()))
    }

    /// Key id of a bare public key.
    ///
    /// # Errors
    ///
    /// Returns an error only if gpg cannot be run.
    pub fn extract_key_id(&self, key: &[u8]) -> Result<Option<String>, IdentityError> {
        let out = self.gpg.run(&GpgArgs::new(), Some(key))?;
        let id = parse::packet_key_id(&out.stdout_text());
        if id.is_none() {
            warn!("Could not extract key id");
        }
        Ok(id)
    }
}

fn create_keyring_dir(dir: &Path, private: bool) -> Result<(), IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    if private {
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(io_err)?;
    }
    Ok(())
}

/// Write `contents` to a new file readable only by the owner.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<(), IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    // An existing file keeps its old mode on open.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(io_err)?;
    file.write_all(contents).map_err(io_err)
}

fn stage(contents: &[u8]) -> Result<NamedTempFile, IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: std::env::temp_dir(),
        source,
    };
    let mut file = tempfile::Builder::new()
        .prefix("rhagent-key")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(file)
}

fn remove_lock_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|e| e.path()) {
        if path.extension().is_some_and(|ext| ext == "lock") {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Removing keyring lock");
            }
        }
    }
}

struct RemoveOnDrop<'p>(&'p Path);

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Removing file");
            }
        }
    }
}
