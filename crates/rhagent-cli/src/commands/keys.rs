//! Key inspection and verification commands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use rhagent_core::AgentConfig;
use rhagent_core::cdn::{CdnClient, verify_signature};
use tracing::{debug, warn};

use super::Agent;

/// Print the fingerprint of `name`.
pub fn fingerprint(agent: &Agent, name: &str) -> Result<()> {
    match agent.identity().fingerprint(name)? {
        Some(fp) => {
            println!("{fp}");
            Ok(())
        },
        None => bail!("no fingerprint found for {name}"),
    }
}

/// Print the armored public key of `name`, generating one if needed.
pub fn public_key(agent: &Agent, name: &str) -> Result<()> {
    let key = agent
        .identity()
        .public_key(name)
        .with_context(|| format!("exporting public key of {name}"))?;
    print!("{key}");
    Ok(())
}

/// Print the verified plaintext of `signature`.
pub fn verify(agent: &Agent, key: &Path, signature: &Path) -> Result<()> {
    let key = std::fs::read_to_string(key)
        .with_context(|| format!("reading {}", key.display()))?;
    let signed = std::fs::read_to_string(signature)
        .with_context(|| format!("reading {}", signature.display()))?;

    match verify_signature(&agent.gpg, &key, &signed)? {
        Some(plaintext) => {
            print!("{plaintext}");
            Ok(())
        },
        None => bail!("signature verification failed"),
    }
}

/// Import a public key into the host keyring and print its key id.
pub fn import_key(agent: &Agent, path: &Path) -> Result<()> {
    let key = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let identity = agent.identity();
    let id = identity.extract_key_id(&key)?;
    let report = identity
        .import_public_key(&key)
        .with_context(|| format!("importing {}", path.display()))?;
    debug!(key = %path.display(), "{}", report.trim_end());
    match id {
        Some(id) => println!("{id}"),
        None => warn!(key = %path.display(), "Imported key has no readable key id"),
    }
    Ok(())
}

/// Print the CDN keys of `owner`, one per line.
pub fn user_keys(config: &AgentConfig, owner: &str) -> Result<()> {
    let client = CdnClient::new(&config.cdn).context("building CDN client")?;
    for key in client.user_public_keys(owner)? {
        println!("{key}");
    }
    Ok(())
}
