//! rhagent - resource host agent
//!
//! Provisions containers from templates and manages their identities.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rhagent_core::AgentConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// rhagent - resource host agent
#[derive(Parser, Debug)]
#[command(name = "rhagent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to agent configuration file
    #[arg(short, long, default_value = "/etc/rhagent/agent.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins if set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clone a container from a template
    Clone(commands::clone::CloneArgs),

    /// Print the key fingerprint of a container or the host
    Fingerprint {
        /// Container name, or the host identity
        name: String,
    },

    /// Print the armored public key of a container or the host
    PublicKey {
        /// Container name, or the host identity
        name: String,
    },

    /// Verify a clearsigned message against a public key
    Verify {
        /// Armored public key of the signer
        #[arg(long)]
        key: PathBuf,

        /// Signed message
        #[arg(long)]
        signature: PathBuf,
    },

    /// Import a public key into the host keyring and print its key id
    ImportKey {
        /// Armored or binary public key
        file: PathBuf,
    },

    /// List the public keys the CDN holds for an owner
    UserKeys {
        /// Owner name
        owner: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = AgentConfig::load_or_init(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Clone(args) => {
            // Clone failures carry a severity; map it to a precise exit code
            // instead of going through anyhow.
            let agent = commands::Agent::new(config)?;
            let exit_code = commands::clone::run(&agent, args);
            std::process::exit(i32::from(exit_code));
        },
        Commands::Fingerprint { name } => {
            commands::keys::fingerprint(&commands::Agent::new(config)?, &name)
        },
        Commands::PublicKey { name } => {
            commands::keys::public_key(&commands::Agent::new(config)?, &name)
        },
        Commands::Verify { key, signature } => {
            commands::keys::verify(&commands::Agent::new(config)?, &key, &signature)
        },
        Commands::ImportKey { file } => {
            commands::keys::import_key(&commands::Agent::new(config)?, &file)
        },
        Commands::UserKeys { owner } => commands::keys::user_keys(&config, &owner),
    }
}
