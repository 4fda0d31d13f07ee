//! Container engine interface.
//!
//! The clone pipeline drives the container runtime exclusively through
//! [`ContainerEngine`]. [`LxcEngine`] implements it over the LXC userspace
//! tools and the per-container `config` file; tests substitute in-memory
//! engines.

use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockError;

mod conf;
mod lxc;

pub use conf::LxcConfig;
pub use lxc::LxcEngine;

/// Static IPv4 address (CIDR form) of a container.
pub const KEY_IPV4: &str = "lxc.network.ipv4";
/// Default gateway of a container with static networking.
pub const KEY_GATEWAY: &str = "lxc.network.ipv4.gateway";
/// VLAN tag recorded for gateway election.
pub const KEY_VLAN: &str = "#vlan_id";
/// Host-side name of the container's veth pair.
pub const KEY_VETH_PAIR: &str = "lxc.network.veth.pair";
/// Marker present only in template configs.
pub const KEY_TEMPLATE: &str = "#template";
/// User/group id mapping entries.
pub const KEY_ID_MAP: &str = "lxc.id_map";

/// Fixed post-clone adjustments applied to every new container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardeningStep {
    /// Package manager configuration.
    PackageManager,
    /// Resolver configuration.
    Dns,
    /// Console/tty settings required for checkpoint and restore.
    CheckpointCompat,
    /// Disable password logins over ssh.
    DisableSshPassword,
}

impl HardeningStep {
    /// Every step, in application order.
    pub const ALL: [Self; 4] = [
        Self::PackageManager,
        Self::Dns,
        Self::CheckpointCompat,
        Self::DisableSshPassword,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PackageManager => "package-manager",
            Self::Dns => "dns",
            Self::CheckpointCompat => "checkpoint-compat",
            Self::DisableSshPassword => "disable-ssh-password",
        }
    }
}

/// Errors emitted by container engines.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The named container or template does not exist.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Filesystem access failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An engine command could not be run or exited unsuccessfully.
    #[error("{command} failed (exit code {code:?}): {stderr}")]
    Command {
        /// Command line that failed.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A container config value could not be interpreted.
    #[error("invalid container config: {0}")]
    InvalidConfig(String),

    /// A host-wide engine lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Operations the clone pipeline needs from the container runtime.
///
/// Every method targets one container (or template) by name and is expected
/// to be idempotent where the pipeline may repeat it.
pub trait ContainerEngine: Send + Sync {
    /// Whether a template with this id is deployed locally.
    fn template_exists(&self, id: &str) -> bool;

    /// Whether an instance with this name exists.
    fn container_exists(&self, name: &str) -> bool;

    /// Create `child` as a clone of the template `parent_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone could not be created.
    fn clone_container(&self, parent_id: &str, child: &str) -> Result<(), EngineError>;

    /// Write network-related config entries. An empty value removes the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be updated.
    fn set_network_config(&self, name: &str, entries: &[(&str, &str)]) -> Result<(), EngineError>;

    /// Switch the guest from DHCP to the statically configured address.
    ///
    /// # Errors
    ///
    /// Returns an error if the guest configuration cannot be written.
    fn set_static_networking(&self, name: &str) -> Result<(), EngineError>;

    /// Assign an unused UID range to the container and return its base.
    ///
    /// Concurrent calls for different containers must not hand out the same
    /// range.
    ///
    /// # Errors
    ///
    /// Returns an error if existing mappings cannot be read or the new one
    /// cannot be written.
    fn assign_uid(&self, name: &str) -> Result<String, EngineError>;

    /// Apply one post-clone hardening step.
    ///
    /// # Errors
    ///
    /// Returns an error if the step cannot be applied.
    fn apply_hardening(&self, name: &str, step: HardeningStep) -> Result<(), EngineError>;

    /// Start the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container fails to start.
    fn start(&self, name: &str) -> Result<(), EngineError>;

    /// Read a single value from the container's live configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read.
    fn read_config_value(&self, name: &str, key: &str) -> Result<Option<String>, EngineError>;

    /// Names of all existing containers (templates excluded), in no
    /// particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the container directory cannot be listed.
    fn list_containers(&self) -> Result<Vec<String>, EngineError>;

    /// CPU quota in percent of one core, if a quota is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or holds
    /// non-numeric quota values.
    fn query_quota(&self, name: &str) -> Result<Option<u32>, EngineError>;
}
