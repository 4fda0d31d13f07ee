//! Subcommand implementations.

use anyhow::{Context, Result};
use rhagent_core::AgentConfig;
use rhagent_core::clone::Collaborators;
use rhagent_core::engine::LxcEngine;
use rhagent_core::identity::{GpgCommand, IdentityManager};
use rhagent_core::import::CommandImporter;
use rhagent_core::lock::LockDir;
use rhagent_core::metadata::SqliteMetadataStore;
use rhagent_core::trust::HttpsAuthority;

pub mod clone;
pub mod keys;

/// Exit codes for agent commands.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// The operation failed; the host is otherwise fine.
    pub const ERROR: u8 = 1;
    /// The operation failed part-way; state may need manual attention.
    pub const FATAL: u8 = 2;
}

/// Production collaborators, built once from the loaded configuration.
pub struct Agent {
    pub config: AgentConfig,
    pub engine: LxcEngine,
    pub store: SqliteMetadataStore,
    pub importer: CommandImporter,
    pub gpg: GpgCommand,
    pub authority: HttpsAuthority,
    pub locks: LockDir,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let authority =
            HttpsAuthority::new(&config.management).context("building management client")?;
        Ok(Self {
            engine: LxcEngine::new(&config),
            store: SqliteMetadataStore::new(config.agent.database()),
            importer: CommandImporter::new(config.agent.import_command.clone()),
            gpg: GpgCommand::new(config.agent.gpg_binary.clone(), config.agent.gpg_home()),
            locks: LockDir::new(config.agent.lock_dir()),
            authority,
            config,
        })
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            engine: &self.engine,
            store: &self.store,
            importer: &self.importer,
            gpg: &self.gpg,
            authority: &self.authority,
        }
    }

    pub fn identity(&self) -> IdentityManager<'_> {
        IdentityManager::new(&self.config.agent, &self.engine, &self.gpg, &self.locks)
    }
}
