//! Clear-signed message verification against a single supplied key.

use tempfile::TempDir;
use tracing::{debug, warn};

use super::CdnError;
use crate::identity::{Gpg, GpgArgs, parse};

/// Verify the clear-signed `signed` message against the armored public
/// `key` and return the signed text.
///
/// Verification runs in a throwaway gpg home that holds only `key`, so no
/// other key on the host can vouch for the message. Returns `Ok(None)` when
/// the key cannot be imported or the signature does not verify.
///
/// # Errors
///
/// Returns an error if the scratch directory cannot be prepared or gpg
/// cannot be run.
pub fn verify_signature(
    gpg: &dyn Gpg,
    key: &str,
    signed: &str,
) -> Result<Option<String>, CdnError> {
    let home = TempDir::new()?;
    let key_file = home.path().join("signer.asc");
    let message_file = home.path().join("message.asc");
    let output_file = home.path().join("message.txt");
    std::fs::write(&key_file, key)?;
    std::fs::write(&message_file, signed)?;

    let isolated = || GpgArgs::new().arg("--homedir").path(home.path()).arg("--batch");

    let import = gpg.run(&isolated().arg("--import").path(&key_file), None)?;
    if !import.success() {
        warn!(stderr = %import.stderr_text().trim(), "Reading user public key");
        return Ok(None);
    }

    let verify = gpg.run(
        &isolated()
            .arg("--status-fd")
            .arg("2")
            .arg("--trust-model")
            .arg("always")
            .arg("--output")
            .path(&output_file)
            .arg("--decrypt")
            .path(&message_file),
        None,
    )?;
    if !verify.success() || !parse::signature_is_valid(&verify.stderr_text()) {
        debug!("Signature check failed");
        return Ok(None);
    }

    Ok(Some(std::fs::read_to_string(&output_file)?))
}
