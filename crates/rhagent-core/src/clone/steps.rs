//! The ordered steps of a clone and what a failure of each one means.
//!
//! | Step                | On failure |
//! |---------------------|------------|
//! | `resolve-parent`    | warn, fall back to the reference as given |
//! | `ensure-template`   | fatal |
//! | `check-duplicate`   | error |
//! | `clone`             | fatal |
//! | `generate-key`      | fatal |
//! | `exchange-trust`    | fatal, or error when the authority rejects |
//! | `record-environment`| cannot fail |
//! | `configure-network` | fatal |
//! | `assign-uid`        | warn, `uid` left out of the record |
//! | `harden`            | warn per hardening step |
//! | `start`             | error |
//! | `read-interface`    | warn, `interface` left out of the record |
//! | `persist-metadata`  | warn, container stays running |
//!
//! A warn-level failure is logged and the next step runs; any other stops
//! the clone. Nothing is rolled back: whatever ran before a failing step
//! stays in effect.

use std::fmt;

use crate::severity::Severity;

/// One step of the clone pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloneStep {
    ResolveParent,
    EnsureTemplate,
    CheckDuplicate,
    Clone,
    GenerateKey,
    ExchangeTrust,
    RecordEnvironment,
    ConfigureNetwork,
    AssignUid,
    Harden,
    Start,
    ReadInterface,
    PersistMetadata,
}

impl CloneStep {
    /// Every step, in execution order.
    pub const PIPELINE: [Self; 13] = [
        Self::ResolveParent,
        Self::EnsureTemplate,
        Self::CheckDuplicate,
        Self::Clone,
        Self::GenerateKey,
        Self::ExchangeTrust,
        Self::RecordEnvironment,
        Self::ConfigureNetwork,
        Self::AssignUid,
        Self::Harden,
        Self::Start,
        Self::ReadInterface,
        Self::PersistMetadata,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResolveParent => "resolve-parent",
            Self::EnsureTemplate => "ensure-template",
            Self::CheckDuplicate => "check-duplicate",
            Self::Clone => "clone",
            Self::GenerateKey => "generate-key",
            Self::ExchangeTrust => "exchange-trust",
            Self::RecordEnvironment => "record-environment",
            Self::ConfigureNetwork => "configure-network",
            Self::AssignUid => "assign-uid",
            Self::Harden => "harden",
            Self::Start => "start",
            Self::ReadInterface => "read-interface",
            Self::PersistMetadata => "persist-metadata",
        }
    }

    /// Default severity of a failure in this step.
    #[must_use]
    pub const fn failure_severity(self) -> Severity {
        match self {
            Self::ResolveParent
            | Self::RecordEnvironment
            | Self::AssignUid
            | Self::Harden
            | Self::ReadInterface
            | Self::PersistMetadata => Severity::Warn,
            Self::CheckDuplicate | Self::Start => Severity::Error,
            Self::EnsureTemplate
            | Self::Clone
            | Self::GenerateKey
            | Self::ExchangeTrust
            | Self::ConfigureNetwork => Severity::Fatal,
        }
    }
}

impl fmt::Display for CloneStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
