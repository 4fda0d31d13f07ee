//! Agent configuration parsing and management.
//!
//! The agent reads a single TOML file (by default `/etc/rhagent/agent.toml`)
//! describing where containers and keyrings live, how to reach the
//! management authority and the CDN, and which values the post-clone
//! hardening writes into new containers.
//!
//! The binary constructs one [`AgentConfig`] at startup and hands a reference
//! to every component. Nothing in this crate reads configuration from
//! ambient state.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

/// Top-level agent configuration.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Host-side settings: paths, keyring identity, passphrase.
    #[serde(default)]
    pub agent: AgentSection,

    /// Management authority endpoint.
    #[serde(default)]
    pub management: ManagementSection,

    /// Content distribution network endpoint.
    #[serde(default)]
    pub cdn: CdnSection,

    /// Values written into containers by post-clone hardening.
    #[serde(default)]
    pub hardening: HardeningSection,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// Missing sections and keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at `path`, or write the defaults there when it does not
    /// exist yet.
    ///
    /// Failing to persist the defaults is logged and does not prevent the
    /// agent from running with them.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }

        let config = Self::default();
        if let Err(e) = config.save(path) {
            warn!(path = %path.display(), error = %e, "Saving default configuration file");
        }
        Ok(config)
    }

    /// Atomically write this configuration to `path`, readable by the owner
    /// only, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        // The file carries the key passphrase; the temp file is created 0600
        // and keeps that mode once renamed into place.
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.lxc_prefix.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "agent.lxc_prefix must not be empty".to_string(),
            ));
        }
        if self.agent.gpg_binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agent.gpg_binary must not be empty".to_string(),
            ));
        }
        if self.management.verify_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "management.verify_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Host-side agent settings.
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Primary identity of this resource host in the default keyring.
    #[serde(default = "default_gpg_user")]
    pub gpg_user: String,

    /// Passphrase protecting every generated secret key.
    #[serde(
        default = "default_gpg_password",
        serialize_with = "secret_serde::serialize",
        deserialize_with = "secret_serde::deserialize"
    )]
    pub gpg_password: SecretString,

    /// Name or path of the gpg executable.
    #[serde(default = "default_gpg_binary")]
    pub gpg_binary: String,

    /// Mail domain appended to container names to form their key identity.
    #[serde(default = "default_key_domain")]
    pub key_domain: String,

    /// Root of agent-owned state.
    #[serde(default = "default_data_prefix")]
    pub data_prefix: PathBuf,

    /// Directory holding one subdirectory per container or template.
    #[serde(default = "default_lxc_prefix")]
    pub lxc_prefix: PathBuf,

    /// Host keyring directory. Defaults to `<data_prefix>/.gnupg`.
    #[serde(default)]
    pub gpg_home: Option<PathBuf>,

    /// Metadata database file. Defaults to `<data_prefix>/agent.db`.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Directory for advisory lock files. Defaults to `<data_prefix>/locks`.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,

    /// External program invoked to import a missing template.
    #[serde(default)]
    pub import_command: Option<PathBuf>,
}

impl AgentSection {
    /// Host keyring directory.
    #[must_use]
    pub fn gpg_home(&self) -> PathBuf {
        self.gpg_home
            .clone()
            .unwrap_or_else(|| self.data_prefix.join(".gnupg"))
    }

    /// Metadata database path.
    #[must_use]
    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_prefix.join("agent.db"))
    }

    /// Lock directory.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.data_prefix.join("locks"))
    }

    /// Directory of a single container or template.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.lxc_prefix.join(name)
    }

    /// Key identity (`name@domain`) of a container.
    #[must_use]
    pub fn container_email(&self, name: &str) -> String {
        format!("{name}@{}", self.key_domain)
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            gpg_user: default_gpg_user(),
            gpg_password: default_gpg_password(),
            gpg_binary: default_gpg_binary(),
            key_domain: default_key_domain(),
            data_prefix: default_data_prefix(),
            lxc_prefix: default_lxc_prefix(),
            gpg_home: None,
            database: None,
            lock_dir: None,
            import_command: None,
        }
    }
}

/// Management authority endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ManagementSection {
    /// Authority host name or address. Empty until the host is registered.
    #[serde(default)]
    pub host: String,

    /// Port serving the authority's public key.
    #[serde(default = "default_management_port")]
    pub port: u16,

    /// Port serving the container-token verification endpoint.
    #[serde(default = "default_verify_port")]
    pub verify_port: u16,

    /// Path of the authority public key resource.
    #[serde(default = "default_rest_public_key")]
    pub rest_public_key: String,

    /// Accept self-signed authority certificates.
    #[serde(default = "default_true")]
    pub allow_insecure: bool,

    /// Timeout for fetching the authority key.
    #[serde(default = "default_key_timeout")]
    pub key_timeout_secs: u64,

    /// Timeout for posting the encrypted token.
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
}

impl ManagementSection {
    /// URL of the authority public key.
    #[must_use]
    pub fn public_key_url(&self) -> String {
        format!("https://{}:{}{}", self.host, self.port, self.rest_public_key)
    }

    /// URL of the container-token verification endpoint.
    #[must_use]
    pub fn verify_url(&self) -> String {
        format!(
            "https://{}:{}/rest/v1/registration/verify/container-token",
            self.host, self.verify_port
        )
    }

    #[must_use]
    pub const fn key_timeout(&self) -> Duration {
        Duration::from_secs(self.key_timeout_secs)
    }

    #[must_use]
    pub const fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

impl Default for ManagementSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_management_port(),
            verify_port: default_verify_port(),
            rest_public_key: default_rest_public_key(),
            allow_insecure: true,
            key_timeout_secs: default_key_timeout(),
            verify_timeout_secs: default_verify_timeout(),
        }
    }
}

/// Content distribution network endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CdnSection {
    /// CDN host name.
    #[serde(default = "default_cdn_url")]
    pub url: String,

    /// CDN TLS port.
    #[serde(default = "default_cdn_port")]
    pub ssl_port: u16,

    /// Accept self-signed CDN certificates.
    #[serde(default)]
    pub allow_insecure: bool,

    /// Request timeout.
    #[serde(default = "default_cdn_timeout")]
    pub timeout_secs: u64,
}

impl CdnSection {
    /// Base URL of the CDN REST API.
    #[must_use]
    pub fn kurjun_url(&self) -> String {
        format!("https://{}:{}/kurjun/rest", self.url, self.ssl_port)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CdnSection {
    fn default() -> Self {
        Self {
            url: default_cdn_url(),
            ssl_port: default_cdn_port(),
            allow_insecure: false,
            timeout_secs: default_cdn_timeout(),
        }
    }
}

/// Values applied to every new container after cloning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardeningSection {
    /// Nameserver written to the guest `resolv.conf`.
    #[serde(default = "default_nameserver")]
    pub nameserver: String,

    /// Search domain written to the guest `resolv.conf`.
    #[serde(default = "default_search_domain")]
    pub search_domain: String,

    /// Optional HTTP proxy for the guest package manager.
    #[serde(default)]
    pub apt_proxy: Option<String>,
}

impl Default for HardeningSection {
    fn default() -> Self {
        Self {
            nameserver: default_nameserver(),
            search_domain: default_search_domain(),
            apt_proxy: None,
        }
    }
}

fn default_gpg_user() -> String {
    "rh@subutai.io".to_string()
}

fn default_gpg_password() -> SecretString {
    SecretString::from("12345678".to_string())
}

fn default_gpg_binary() -> String {
    "gpg1".to_string()
}

fn default_key_domain() -> String {
    "subutai.io".to_string()
}

fn default_data_prefix() -> PathBuf {
    PathBuf::from("/var/lib/subutai/")
}

fn default_lxc_prefix() -> PathBuf {
    PathBuf::from("/var/lib/lxc/")
}

const fn default_management_port() -> u16 {
    8443
}

const fn default_verify_port() -> u16 {
    8444
}

fn default_rest_public_key() -> String {
    "/rest/v1/security/keyman/getpublickeyring".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_key_timeout() -> u64 {
    5
}

const fn default_verify_timeout() -> u64 {
    15
}

fn default_cdn_url() -> String {
    "cdn.subutai.io".to_string()
}

const fn default_cdn_port() -> u16 {
    8338
}

const fn default_cdn_timeout() -> u64 {
    15
}

fn default_nameserver() -> String {
    "10.10.10.1".to_string()
}

fn default_search_domain() -> String {
    "intra.lan".to_string()
}

/// Serde helpers for secret fields.
///
/// Secrets are written back out only when the agent persists its own default
/// configuration file.
mod secret_serde {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::from)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading or writing the configuration file.
    #[error("failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
