//! Clone Orchestrator: template to running, registered container.
//!
//! [`CloneOrchestrator::run`] walks [`CloneStep::PIPELINE`] in order,
//! dispatching each step and letting the failure severity decide whether the
//! walk goes on. The `container-<name>` lock is held from the duplicate check
//! to the end, so two concurrent clones of one name cannot both pass the
//! check.

use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::engine::{ContainerEngine, EngineError, HardeningStep, KEY_VETH_PAIR};
use crate::identity::{Gpg, IdentityError, IdentityManager};
use crate::import::{ImportError, TemplateImporter};
use crate::lock::{LockDir, LockError, NamedLock};
use crate::metadata::{
    KEY_ENVIRONMENT, KEY_INTERFACE, KEY_IP, KEY_PARENT, KEY_UID, KEY_VLAN, MetadataRecord,
    MetadataStore, StoreError,
};
use crate::network::{NetworkAssignment, NetworkError, NetworkResolver, NetworkSpec};
use crate::severity::Severity;
use crate::trust::{AuthorityTransport, TrustError, TrustExchange};

mod steps;

pub use steps::CloneStep;

/// Clone failures. Warn-level failures are logged by [`CloneOrchestrator::run`],
/// never returned.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloneError {
    /// The requested name cannot be used as a container name.
    #[error("invalid container name {0:?}")]
    InvalidName(String),

    /// The network specification was rejected before anything was changed.
    #[error(transparent)]
    InvalidNetwork(NetworkError),

    /// A container with the requested name already exists.
    #[error("container {0} already exists")]
    AlreadyExists(String),

    /// The per-name clone lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The parent template could not be imported.
    #[error("importing template {id}: {source}")]
    Import {
        /// Template id.
        id: String,
        /// Underlying error.
        #[source]
        source: ImportError,
    },

    /// The container engine failed in `step`.
    #[error("{step}: {source}")]
    Engine {
        /// Failing step.
        step: CloneStep,
        /// Underlying error.
        #[source]
        source: EngineError,
    },

    /// Keypair generation failed.
    #[error("generating key: {0}")]
    Identity(#[source] IdentityError),

    /// The trust exchange failed.
    #[error("trust exchange: {0}")]
    Trust(#[source] TrustError),

    /// Static network configuration failed.
    #[error("configuring network: {0}")]
    Network(#[source] NetworkError),

    /// The container record could not be written.
    #[error("writing container data to metadata store: {0}")]
    Store(#[source] StoreError),
}

impl CloneError {
    /// Step in which the failure happened.
    #[must_use]
    pub const fn step(&self) -> CloneStep {
        match self {
            Self::InvalidName(_) | Self::AlreadyExists(_) | Self::Lock(_) => {
                CloneStep::CheckDuplicate
            },
            Self::InvalidNetwork(_) | Self::Network(_) => CloneStep::ConfigureNetwork,
            Self::Import { .. } => CloneStep::EnsureTemplate,
            Self::Engine { step, .. } => *step,
            Self::Identity(_) => CloneStep::GenerateKey,
            Self::Trust(_) => CloneStep::ExchangeTrust,
            Self::Store(_) => CloneStep::PersistMetadata,
        }
    }

    /// How far this failure propagates.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Trust(e) => e.severity(),
            // Rejected up front; nothing has been touched yet.
            Self::InvalidName(_) | Self::InvalidNetwork(_) => Severity::Error,
            _ => self.step().failure_severity(),
        }
    }
}

/// Reference to the parent template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    /// Literal template id, written `id:<id>`.
    Id(String),
    /// Symbolic name resolved through the metadata store.
    Name(String),
}

impl TemplateRef {
    #[must_use]
    pub fn parse(reference: &str) -> Self {
        match reference.strip_prefix("id:") {
            Some(id) => Self::Id(id.to_string()),
            None => Self::Name(reference.to_string()),
        }
    }
}

/// Parameters of one clone.
#[derive(Debug)]
pub struct CloneRequest {
    pub parent: TemplateRef,
    pub name: String,
    pub environment: Option<String>,
    /// `"<address>/<prefix> <vlan>"`; absent keeps the default NAT address.
    pub network: Option<String>,
    /// Registration token; triggers the trust exchange.
    pub token: Option<SecretString>,
    /// Build-authorization token forwarded to the template importer.
    pub build_token: Option<SecretString>,
}

impl CloneRequest {
    #[must_use]
    pub fn new(parent: TemplateRef, name: impl Into<String>) -> Self {
        Self {
            parent,
            name: name.into(),
            environment: None,
            network: None,
            token: None,
            build_token: None,
        }
    }
}

/// Result of a completed clone.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub name: String,
    /// Fingerprint of the container key, if it could be read.
    pub fingerprint: Option<String>,
    /// Record handed to the metadata store.
    pub record: MetadataRecord,
    pub network: Option<NetworkAssignment>,
}

/// External collaborators of the pipeline.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub engine: &'a dyn ContainerEngine,
    pub store: &'a dyn MetadataStore,
    pub importer: &'a dyn TemplateImporter,
    pub gpg: &'a dyn Gpg,
    pub authority: &'a dyn AuthorityTransport,
}

/// Clone Orchestrator.
pub struct CloneOrchestrator<'a> {
    config: &'a AgentConfig,
    locks: &'a LockDir,
    deps: Collaborators<'a>,
}

impl<'a> CloneOrchestrator<'a> {
    #[must_use]
    pub fn new(config: &'a AgentConfig, locks: &'a LockDir, deps: Collaborators<'a>) -> Self {
        Self {
            config,
            locks,
            deps,
        }
    }

    fn identity(&self) -> IdentityManager<'_> {
        IdentityManager::new(&self.config.agent, self.deps.engine, self.deps.gpg, self.locks)
    }

    /// Run the full pipeline for `request`.
    ///
    /// Each step of [`CloneStep::PIPELINE`] runs in turn; a failure whose
    /// severity is warn is logged and the next step runs.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a step whose failure severity is error
    /// or fatal. See [`CloneError::severity`].
    pub fn run(&self, request: &CloneRequest) -> Result<CloneOutcome, CloneError> {
        let name = request.name.as_str();
        if !valid_container_name(name) {
            return Err(CloneError::InvalidName(name.to_string()));
        }
        let mut state = CloneRun {
            request,
            network: network_spec(request)?,
            parent: String::new(),
            record: MetadataRecord::new(),
            _claim: None,
            assignment: None,
        };

        for step in CloneStep::PIPELINE {
            if let Err(e) = self.execute(step, &mut state) {
                if e.severity().aborts() {
                    return Err(e);
                }
                warn!(container = %name, step = step.as_str(), error = %e, "Clone step failed");
            }
        }

        let fingerprint = self.identity().fingerprint(name).unwrap_or_else(|e| {
            warn!(container = %name, error = %e, "Reading fingerprint");
            None
        });
        info!(
            "{name} with ID {} successfully cloned",
            fingerprint.as_deref().unwrap_or_default()
        );

        Ok(CloneOutcome {
            name: name.to_string(),
            fingerprint,
            record: state.record,
            network: state.assignment,
        })
    }

    fn execute(&self, step: CloneStep, state: &mut CloneRun<'_>) -> Result<(), CloneError> {
        let engine = self.deps.engine;
        let request = state.request;
        let name = request.name.as_str();
        let engine_err = |source| CloneError::Engine { step, source };

        match step {
            CloneStep::ResolveParent => {
                state.parent = self.resolve_parent(&request.parent);
                state.record.insert(KEY_PARENT, state.parent.as_str());
            },
            CloneStep::EnsureTemplate => {
                let parent = &state.parent;
                if !engine.template_exists(parent) {
                    info!(template = %parent, "Template not deployed, importing");
                    self.deps
                        .importer
                        .import(parent, request.build_token.as_ref())
                        .map_err(|source| CloneError::Import {
                            id: parent.clone(),
                            source,
                        })?;
                }
            },
            CloneStep::CheckDuplicate => {
                // Held until the pipeline finishes.
                state._claim = Some(self.locks.container(name)?);
                if engine.container_exists(name) {
                    return Err(CloneError::AlreadyExists(name.to_string()));
                }
            },
            CloneStep::Clone => engine.clone_container(&state.parent, name).map_err(engine_err)?,
            CloneStep::GenerateKey => {
                self.identity().generate_key(name).map_err(CloneError::Identity)?;
            },
            CloneStep::ExchangeTrust => {
                if let Some(token) = &request.token {
                    let identity = self.identity();
                    TrustExchange::new(
                        &self.config.agent,
                        &identity,
                        self.deps.gpg,
                        self.deps.authority,
                    )
                    .exchange_and_encrypt(name, token)
                    .map_err(CloneError::Trust)?;
                }
            },
            CloneStep::RecordEnvironment => {
                if let Some(environment) = &request.environment {
                    state.record.insert(KEY_ENVIRONMENT, environment.as_str());
                }
            },
            CloneStep::ConfigureNetwork => {
                if let Some(spec) = &state.network {
                    let assignment = NetworkResolver::new(engine, self.locks)
                        .configure(name, spec)
                        .map_err(CloneError::Network)?;
                    state.record.insert(KEY_IP, assignment.address.address().to_string());
                    state.record.insert(KEY_VLAN, assignment.vlan.as_str());
                    state.assignment = Some(assignment);
                }
            },
            CloneStep::AssignUid => {
                let uid = engine.assign_uid(name).map_err(engine_err)?;
                state.record.insert(KEY_UID, uid);
            },
            CloneStep::Harden => {
                for hardening in HardeningStep::ALL {
                    if let Err(e) = engine.apply_hardening(name, hardening) {
                        warn!(
                            container = %name,
                            step = step.as_str(),
                            hardening = hardening.as_str(),
                            error = %e,
                            "Hardening step failed"
                        );
                    }
                }
            },
            CloneStep::Start => engine.start(name).map_err(engine_err)?,
            CloneStep::ReadInterface => {
                match engine.read_config_value(name, KEY_VETH_PAIR).map_err(engine_err)? {
                    Some(interface) => state.record.insert(KEY_INTERFACE, interface),
                    None => warn!(
                        container = %name,
                        step = step.as_str(),
                        "No veth pair configured"
                    ),
                }
            },
            CloneStep::PersistMetadata => {
                let mut session = self.deps.store.open().map_err(CloneError::Store)?;
                let written = session.put_container(name, &state.record);
                let closed = session.close();
                written.and(closed).map_err(CloneError::Store)?;
            },
        }
        Ok(())
    }

    /// Literal ids pass through; names are looked up, falling back to the
    /// name itself when the store cannot answer.
    fn resolve_parent(&self, parent: &TemplateRef) -> String {
        let name = match parent {
            TemplateRef::Id(id) => return id.clone(),
            TemplateRef::Name(name) => name,
        };
        let step = CloneStep::ResolveParent.as_str();

        let session = match self.deps.store.open() {
            Ok(session) => session,
            Err(e) => {
                warn!(step, template = %name, error = %e, "Opening metadata store");
                return name.clone();
            },
        };
        let resolved = match session.template_id(name) {
            Ok(Some(id)) => {
                debug!(template = %name, id = %id, "Resolved template");
                id
            },
            Ok(None) => {
                warn!(step, template = %name, "Template not registered, using name as id");
                name.clone()
            },
            Err(e) => {
                warn!(step, template = %name, error = %e, "Looking up template");
                name.clone()
            },
        };
        if let Err(e) = session.close() {
            warn!(step, error = %e, "Closing metadata store");
        }
        resolved
    }
}

/// Mutable state threaded through the pipeline steps.
struct CloneRun<'r> {
    request: &'r CloneRequest,
    network: Option<NetworkSpec>,
    parent: String,
    record: MetadataRecord,
    /// Per-name clone lock, released when the run ends.
    _claim: Option<NamedLock>,
    assignment: Option<NetworkAssignment>,
}

/// A network argument without a VLAN keeps the default address; a two-field
/// one must parse before anything is touched.
fn network_spec(request: &CloneRequest) -> Result<Option<NetworkSpec>, CloneError> {
    let Some(raw) = request.network.as_deref() else {
        return Ok(None);
    };
    if raw.split_whitespace().count() < 2 {
        warn!(
            container = %request.name,
            network = raw,
            "Network argument has no VLAN, keeping default address"
        );
        return Ok(None);
    }
    NetworkSpec::parse(raw).map(Some).map_err(CloneError::InvalidNetwork)
}

fn valid_container_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
