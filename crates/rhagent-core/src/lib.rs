//! # rhagent-core
//!
//! Container provisioning and identity for a resource host agent.
//!
//! The core is the clone pipeline in [`clone`]: a container is derived from
//! a template, given a keypair ([`identity`]), optionally registered with
//! the management authority ([`trust`]), given a static address on a VLAN
//! ([`network`]), hardened, started and recorded in the metadata store
//! ([`metadata`]).
//!
//! Everything outside the process is reached through a narrow trait:
//!
//! - [`engine::ContainerEngine`] for the container runtime
//! - [`metadata::MetadataStore`] for container and template records
//! - [`identity::Gpg`] for key management
//! - [`trust::AuthorityTransport`] for the management authority
//! - [`import::TemplateImporter`] for fetching templates
//!
//! Production implementations of each live next to the trait. All of them
//! are configured from one [`config::AgentConfig`] passed in by the caller.
//!
//! Failures carry a [`severity::Severity`]. The library reports it and never
//! exits the process.

pub mod cdn;
pub mod clone;
pub mod config;
pub mod engine;
pub mod identity;
pub mod import;
pub mod lock;
pub mod metadata;
pub mod network;
pub mod severity;
pub mod trust;

pub use config::AgentConfig;
pub use severity::Severity;
