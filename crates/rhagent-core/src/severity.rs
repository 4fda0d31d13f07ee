//! Failure severities shared by every agent operation.

use std::fmt;

/// How far a failure propagates.
///
/// - `Warn`: logged, the operation continues in a degraded state.
/// - `Error`: the current request is aborted and reported; unrelated work may
///   continue.
/// - `Fatal`: an unrecoverable precondition failed; the invoking process is
///   expected to terminate. Side effects performed before the failure are not
///   rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Logged and tolerated.
    Warn,
    /// Aborts the request.
    Error,
    /// Aborts the process.
    Fatal,
}

impl Severity {
    /// Returns the severity as a lowercase identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Whether a failure of this severity stops the current operation.
    #[must_use]
    pub const fn aborts(self) -> bool {
        !matches!(self, Self::Warn)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
