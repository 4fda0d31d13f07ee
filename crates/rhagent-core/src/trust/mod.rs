//! Registration of a container's identity with the management authority.
//!
//! The exchange installs the authority's public key into the container
//! keyring, then sends the authority a payload made of the registration
//! token, the container fingerprint and the container's exported public
//! key. The payload only ever leaves the host signed by the container key
//! and encrypted to the authority key. Its plaintext and ciphertext files
//! exist only for the duration of one exchange.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AgentSection;
use crate::identity::{Gpg, GpgArgs, IdentityError, IdentityManager, parse, write_private};
use crate::severity::Severity;

mod https;

pub use https::HttpsAuthority;

const AUTHORITY_KEY_FILE: &str = "mgn.key";
const PLAINTEXT_FILE: &str = "stdin.txt";
const CIPHERTEXT_FILE: &str = "stdin.txt.asc";

/// Trust exchange errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrustError {
    /// The authority could not be reached or returned an unusable response.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// The authority answered the verification request with a failure
    /// status.
    #[error("authority rejected the key exchange with status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The imported authority key id could not be read from gpg's output.
    #[error("key id parsing error in gpg import output: {stderr:?}")]
    KeyIdParse {
        /// Diagnostics that failed to parse.
        stderr: String,
    },

    /// The container has no fingerprint to send.
    #[error("no fingerprint for container {0}")]
    MissingFingerprint(String),

    /// A gpg or keyring operation failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Filesystem access failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl TrustError {
    /// Only a rejection by a reachable authority is recoverable; everything
    /// else means the exchange could not be carried out.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Rejected { .. } => Severity::Error,
            _ => Severity::Fatal,
        }
    }
}

/// The management authority as seen by the exchange.
pub trait AuthorityTransport: Send + Sync {
    /// Download the authority's armored public key.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Transport`] on any transport failure.
    fn fetch_public_key(&self) -> Result<Vec<u8>, TrustError>;

    /// Post the encrypted token and return the response status.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Transport`] if no response was received.
    fn submit_token(&self, ciphertext: Vec<u8>) -> Result<u16, TrustError>;
}

/// Trust Exchange Protocol.
pub struct TrustExchange<'a> {
    config: &'a AgentSection,
    identity: &'a IdentityManager<'a>,
    gpg: &'a dyn Gpg,
    authority: &'a dyn AuthorityTransport,
}

impl<'a> TrustExchange<'a> {
    #[must_use]
    pub fn new(
        config: &'a AgentSection,
        identity: &'a IdentityManager<'a>,
        gpg: &'a dyn Gpg,
        authority: &'a dyn AuthorityTransport,
    ) -> Self {
        Self {
            config,
            identity,
            gpg,
            authority,
        }
    }

    /// Register `container`'s key with the authority using `token`.
    ///
    /// The plaintext and ciphertext token files are removed once the
    /// verification request has been attempted, and on every earlier
    /// failure after they were created.
    ///
    /// # Errors
    ///
    /// See [`TrustError`] and [`TrustError::severity`].
    pub fn exchange_and_encrypt(
        &self,
        container: &str,
        token: &SecretString,
    ) -> Result<(), TrustError> {
        let dir = self.config.container_dir(container);
        let keyring = self.identity.container_keyring(container);

        let authority_key = self.install_authority_key(&dir, &keyring)?;
        debug!(container = %container, key_id = %authority_key, "Installed authority key");

        let export = self
            .gpg
            .run(
                &GpgArgs::new()
                    .keyring(&keyring)
                    .arg("--export")
                    .arg("--armor")
                    .arg(self.config.container_email(container)),
                None,
            )?
            .require_success("export")?;

        let fingerprint = self
            .identity
            .fingerprint(container)?
            .ok_or_else(|| TrustError::MissingFingerprint(container.to_string()))?;

        let files = TokenFiles::prepare(&dir)?;
        let mut payload = format!("{}\n{fingerprint}\n", token.expose_secret()).into_bytes();
        payload.extend_from_slice(&export.stdout);
        payload.extend_from_slice(&export.stderr);
        write_private(&files.plaintext, &payload)?;
        drop(payload);

        self.encrypt(container, &keyring, &authority_key, &files)?;

        let ciphertext = std::fs::read(&files.ciphertext).map_err(|source| TrustError::Io {
            path: files.ciphertext.clone(),
            source,
        })?;
        let response = self.authority.submit_token(ciphertext);
        drop(files);

        match response? {
            200 | 202 => {
                info!(container = %container, "Exchanged keys with the management authority");
                Ok(())
            },
            status => Err(TrustError::Rejected { status }),
        }
    }

    /// Fetch, persist and import the authority key; return its key id.
    fn install_authority_key(&self, dir: &Path, keyring: &Path) -> Result<String, TrustError> {
        let key = self.authority.fetch_public_key()?;
        let key_file = dir.join(AUTHORITY_KEY_FILE);
        std::fs::write(&key_file, key).map_err(|source| TrustError::Io {
            path: key_file.clone(),
            source,
        })?;

        let import = self
            .gpg
            .run(
                &GpgArgs::new()
                    .arg("-v")
                    .arg("--batch")
                    .keyring(keyring)
                    .arg("--import")
                    .path(&key_file),
                None,
            )?
            .require_success("import")?;

        let stderr = import.stderr_text();
        parse::import_key_id(&stderr).ok_or(TrustError::KeyIdParse { stderr })
    }

    fn encrypt(
        &self,
        container: &str,
        keyring: &Path,
        recipient: &str,
        files: &TokenFiles,
    ) -> Result<(), TrustError> {
        let args = GpgArgs::new()
            .arg("--batch")
            .arg("--no-tty")
            .arg("--yes")
            .keyring(keyring)
            .arg("--secret-keyring")
            .path(&self.identity.container_secret_keyring(container))
            .arg("--trust-model")
            .arg("always")
            .arg("--armor")
            .arg("--passphrase-fd")
            .arg("0")
            .arg("-u")
            .arg(self.config.container_email(container))
            .arg("-r")
            .arg(recipient)
            .arg("--output")
            .path(&files.ciphertext)
            .arg("--sign")
            .arg("--encrypt")
            .path(&files.plaintext);

        let mut passphrase = self.config.gpg_password.expose_secret().as_bytes().to_vec();
        passphrase.push(b'\n');
        let result = self.gpg.run(&args, Some(&passphrase));
        passphrase.fill(0);

        result?.require_success("encrypt")?;
        Ok(())
    }
}

/// Plaintext and ciphertext token files of one exchange. Both are removed on
/// construction (stale leftovers) and on drop.
struct TokenFiles {
    plaintext: PathBuf,
    ciphertext: PathBuf,
}

impl TokenFiles {
    fn prepare(dir: &Path) -> Result<Self, TrustError> {
        let files = Self {
            plaintext: dir.join(PLAINTEXT_FILE),
            ciphertext: dir.join(CIPHERTEXT_FILE),
        };
        files.remove();
        if !dir.is_dir() {
            return Err(TrustError::Io {
                path: dir.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "container directory does not exist",
                ),
            });
        }
        Ok(files)
    }

    fn remove(&self) {
        for path in [&self.ciphertext, &self.plaintext] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed token file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), error = %e, "Removing token file"),
            }
        }
    }
}

impl Drop for TokenFiles {
    fn drop(&mut self) {
        self.remove();
    }
}
