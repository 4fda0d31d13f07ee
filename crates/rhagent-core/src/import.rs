//! Triggering the import of a template that is not deployed locally.
//!
//! How a template is fetched and unpacked is up to the importer; the clone
//! pipeline only decides that one is needed and waits for it.

use std::path::PathBuf;
use std::process::Command;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::info;

/// Environment variable through which [`CommandImporter`] passes the
/// build-authorization token.
pub const IMPORT_TOKEN_ENV: &str = "RHAGENT_IMPORT_TOKEN";

/// Template import errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImportError {
    /// No import mechanism is configured.
    #[error("template {0} is not deployed and no import command is configured")]
    NotConfigured(String),

    /// The import command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// Command path.
        command: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The import command exited unsuccessfully.
    #[error("import of template {id} failed (exit code {code:?}): {stderr}")]
    Failed {
        /// Template id.
        id: String,
        /// Exit code, if any.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

/// Imports templates by id.
pub trait TemplateImporter: Send + Sync {
    /// Make template `id` available locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the template could not be imported.
    fn import(&self, id: &str, token: Option<&SecretString>) -> Result<(), ImportError>;
}

/// Runs an external program as `<command> id:<id>`.
#[derive(Debug, Clone, Default)]
pub struct CommandImporter {
    command: Option<PathBuf>,
}

impl CommandImporter {
    #[must_use]
    pub fn new(command: Option<PathBuf>) -> Self {
        Self { command }
    }
}

impl TemplateImporter for CommandImporter {
    fn import(&self, id: &str, token: Option<&SecretString>) -> Result<(), ImportError> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| ImportError::NotConfigured(id.to_string()))?;

        info!(template = %id, command = %command.display(), "Importing template");
        let mut cmd = Command::new(command);
        cmd.arg(format!("id:{id}"));
        if let Some(token) = token {
            cmd.env(IMPORT_TOKEN_ENV, token.expose_secret());
        }

        let output = cmd.output().map_err(|source| ImportError::Spawn {
            command: command.clone(),
            source,
        })?;
        if output.status.success() {
            return Ok(());
        }
        Err(ImportError::Failed {
            id: id.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("import.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_unconfigured_importer() {
        let err = CommandImporter::default().import("4f2c0e", None).unwrap_err();
        assert!(matches!(err, ImportError::NotConfigured(id) if id == "4f2c0e"));
    }

    #[test]
    fn test_command_receives_id_and_token_via_env() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("record");
        let cmd = script(
            &dir,
            &format!("echo \"$1 ${IMPORT_TOKEN_ENV}\" > {}", record.display()),
        );

        CommandImporter::new(Some(cmd))
            .import("4f2c0e", Some(&SecretString::from("build-tok".to_string())))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&record).unwrap(),
            "id:4f2c0e build-tok\n"
        );
    }

    #[test]
    fn test_failing_command() {
        let dir = TempDir::new().unwrap();
        let cmd = script(&dir, "echo 'no such template' >&2\nexit 3");

        let err = CommandImporter::new(Some(cmd)).import("x", None).unwrap_err();
        assert!(matches!(
            err,
            ImportError::Failed { code: Some(3), ref stderr, .. } if stderr == "no such template"
        ));
    }
}
