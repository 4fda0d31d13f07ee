//! `rhagent clone`.
//!
//! # Exit Codes
//!
//! - 0: Container cloned and started
//! - 1: Clone refused or container left stopped
//! - 2: Clone aborted part-way

use clap::Args;
use rhagent_core::Severity;
use rhagent_core::clone::{CloneOrchestrator, CloneRequest, TemplateRef};
use secrecy::SecretString;
use tracing::error;

use super::{Agent, exit_codes};

/// Arguments of `rhagent clone`.
#[derive(Debug, Args)]
pub struct CloneArgs {
    /// Parent template name, or `id:<id>`
    pub parent: String,

    /// Name of the new container
    pub child: String,

    /// Environment id to record
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Static address and VLAN, as `"<ip>/<prefix> <vlan>"`
    #[arg(short = 'i', long)]
    pub network: Option<String>,

    /// Registration token for the management authority
    #[arg(short, long)]
    pub token: Option<String>,

    /// Build-authorization token for template import
    #[arg(short = 'k', long)]
    pub build_token: Option<String>,
}

impl CloneArgs {
    fn into_request(self) -> CloneRequest {
        let mut request = CloneRequest::new(TemplateRef::parse(&self.parent), self.child);
        request.environment = self.environment;
        request.network = self.network;
        request.token = self.token.map(SecretString::from);
        request.build_token = self.build_token.map(SecretString::from);
        request
    }
}

/// Run a clone and return the process exit code.
pub fn run(agent: &Agent, args: CloneArgs) -> u8 {
    let request = args.into_request();
    let orchestrator = CloneOrchestrator::new(&agent.config, &agent.locks, agent.collaborators());

    match orchestrator.run(&request) {
        Ok(_) => exit_codes::SUCCESS,
        Err(e) => {
            let severity = e.severity();
            error!(
                container = %request.name,
                step = e.step().as_str(),
                severity = severity.as_str(),
                "{e}"
            );
            exit_code(severity)
        },
    }
}

const fn exit_code(severity: Severity) -> u8 {
    match severity {
        Severity::Warn => exit_codes::SUCCESS,
        Severity::Error => exit_codes::ERROR,
        Severity::Fatal => exit_codes::FATAL,
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn test_exit_codes_follow_severity() {
        assert_eq!(exit_code(Severity::Warn), exit_codes::SUCCESS);
        assert_eq!(exit_code(Severity::Error), exit_codes::ERROR);
        assert_eq!(exit_code(Severity::Fatal), exit_codes::FATAL);
    }

    #[test]
    fn test_request_from_args() {
        let request = CloneArgs {
            parent: "id:4f2c0e".to_string(),
            child: "c1".to_string(),
            environment: None,
            network: Some("10.0.5.7/24 42".to_string()),
            token: Some("reg".to_string()),
            build_token: None,
        }
        .into_request();

        assert_eq!(request.parent, TemplateRef::Id("4f2c0e".to_string()));
        assert_eq!(request.name, "c1");
        assert_eq!(request.token.as_ref().unwrap().expose_secret(), "reg");
        assert!(request.build_token.is_none());
    }
}
