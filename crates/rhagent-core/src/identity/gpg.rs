//! Invocation of the gpg executable.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use super::IdentityError;

/// Argument list for one gpg invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpgArgs(Vec<String>);

impl GpgArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: &Path) -> Self {
        self.0.push(path.to_string_lossy().into_owned());
        self
    }

    /// Restrict the public keyring to `keyring`.
    #[must_use]
    pub fn keyring(self, keyring: &Path) -> Self {
        self.arg("--no-default-keyring").arg("--keyring").path(keyring)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Whether `arg` appears verbatim.
    #[must_use]
    pub fn contains(&self, arg: &str) -> bool {
        self.0.iter().any(|a| a == arg)
    }
}

/// Captured result of a gpg invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpgOutput {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl GpgOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turn an unsuccessful exit into [`IdentityError::Gpg`].
    ///
    /// # Errors
    ///
    /// Returns an error if the exit code is not zero.
    pub fn require_success(self, operation: &'static str) -> Result<Self, IdentityError> {
        if self.success() {
            return Ok(self);
        }
        Err(IdentityError::Gpg {
            operation,
            code: self.code,
            stderr: self.stderr_text().trim().to_string(),
        })
    }
}

/// Runs gpg.
///
/// A non-zero exit is reported through [`GpgOutput::code`], not as an error;
/// only failing to run the program at all is an error.
pub trait Gpg: Send + Sync {
    /// Run gpg with `args`, feeding `stdin` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or its pipes fail.
    fn run(&self, args: &GpgArgs, stdin: Option<&[u8]>) -> Result<GpgOutput, IdentityError>;
}

/// [`Gpg`] backed by the configured executable.
///
/// `home` becomes `GNUPGHOME`, so it is the "default keyring" of every call
/// that does not pass its own `--homedir`.
#[derive(Debug, Clone)]
pub struct GpgCommand {
    binary: String,
    home: PathBuf,
}

impl GpgCommand {
    #[must_use]
    pub fn new(binary: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            home: home.into(),
        }
    }
}

impl Gpg for GpgCommand {
    fn run(&self, args: &GpgArgs, stdin: Option<&[u8]>) -> Result<GpgOutput, IdentityError> {
        debug!(binary = %self.binary, args = ?args.as_slice(), "Running gpg");

        let mut child = Command::new(&self.binary)
            .args(args.as_slice())
            .env("GNUPGHOME", &self.home)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| IdentityError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        // The pipe is closed before waiting; the child is reaped even when
        // the write fails.
        let written = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => pipe.write_all(input),
            _ => Ok(()),
        };

        let spawn_err = |source| IdentityError::Spawn {
            binary: self.binary.clone(),
            source,
        };
        let output = child.wait_with_output().map_err(spawn_err)?;
        written.map_err(spawn_err)?;
        Ok(GpgOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
