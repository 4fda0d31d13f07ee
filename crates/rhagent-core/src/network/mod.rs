//! Static network identity for containers joining a VLAN.
//!
//! Every VLAN has at most one gateway. The first container configured on a
//! VLAN gets a synthetic gateway derived from its address; later containers
//! on the same VLAN adopt whatever gateway an existing member recorded.
//! The set of recorded `#vlan_id`/gateway pairs across all container configs
//! is the VLAN gateway registry, and election plus the config write run under
//! the `vlan-<id>` lock.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, EngineError, KEY_GATEWAY, KEY_IPV4, KEY_VLAN};
use crate::lock::{LockDir, LockError};

mod cidr;

pub use cidr::Ipv4Cidr;

/// Network resolver errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetworkError {
    /// The network specification is not `"<cidr> <vlan>"`.
    #[error("invalid network specification {0:?}: expected \"<address>/<prefix> <vlan>\"")]
    InvalidSpec(String),

    /// The address part is not IPv4 CIDR notation.
    #[error("invalid CIDR {input:?}: {reason}")]
    InvalidCidr {
        /// Offending input.
        input: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The container engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The VLAN lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// A requested static address on a VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Address and prefix length.
    pub address: Ipv4Cidr,
    /// VLAN tag.
    pub vlan: String,
}

impl NetworkSpec {
    /// Parse the whitespace-separated `"<address>/<prefix> <vlan>"` form.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidSpec`] if either field is missing and
    /// [`NetworkError::InvalidCidr`] if the address does not parse.
    pub fn parse(spec: &str) -> Result<Self, NetworkError> {
        let mut fields = spec.split_whitespace();
        let (Some(address), Some(vlan)) = (fields.next(), fields.next()) else {
            return Err(NetworkError::InvalidSpec(spec.to_string()));
        };
        Ok(Self {
            address: address.parse()?,
            vlan: vlan.to_string(),
        })
    }
}

/// Result of configuring a container's static network identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAssignment {
    /// Address written to the container config.
    pub address: Ipv4Cidr,
    /// Gateway written to the container config.
    pub gateway: Ipv4Addr,
    /// VLAN tag written to the container config.
    pub vlan: String,
}

/// Network Identity Resolver.
pub struct NetworkResolver<'a> {
    engine: &'a dyn ContainerEngine,
    locks: &'a LockDir,
}

impl<'a> NetworkResolver<'a> {
    #[must_use]
    pub fn new(engine: &'a dyn ContainerEngine, locks: &'a LockDir) -> Self {
        Self { engine, locks }
    }

    /// Gateway already recorded by a container on `vlan`, if any.
    ///
    /// `exclude` is skipped so a container never elects itself. Containers
    /// are visited in name order and the first usable entry wins.
    /// Unreadable configs and unparsable gateways are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the container list cannot be read.
    pub fn existing_gateway(
        &self,
        vlan: &str,
        exclude: &str,
    ) -> Result<Option<Ipv4Addr>, NetworkError> {
        let mut names = self.engine.list_containers()?;
        names.sort();

        for name in names.iter().filter(|n| n.as_str() != exclude) {
            let recorded_vlan = match self.engine.read_config_value(name, KEY_VLAN) {
                Ok(v) => v,
                Err(e) => {
                    warn!(container = %name, error = %e, "Skipping unreadable container config");
                    continue;
                },
            };
            if recorded_vlan.as_deref() != Some(vlan) {
                continue;
            }

            match self.engine.read_config_value(name, KEY_GATEWAY) {
                Ok(Some(gateway)) => match gateway.parse() {
                    Ok(addr) => {
                        debug!(
                            vlan = %vlan,
                            container = %name,
                            gateway = %addr,
                            "Reusing VLAN gateway"
                        );
                        return Ok(Some(addr));
                    },
                    Err(_) => {
                        warn!(container = %name, gateway = %gateway, "Ignoring unparsable gateway");
                    },
                },
                Ok(None) => {},
                Err(e) => {
                    warn!(container = %name, error = %e, "Skipping unreadable container config");
                },
            }
        }
        Ok(None)
    }

    /// Elect a gateway for `spec` on behalf of `container`.
    ///
    /// Callers that go on to record the result must hold the VLAN lock;
    /// [`NetworkResolver::configure`] does.
    ///
    /// # Errors
    ///
    /// Returns an error if the container list cannot be read.
    pub fn elect_gateway(
        &self,
        container: &str,
        spec: &NetworkSpec,
    ) -> Result<Ipv4Addr, NetworkError> {
        if let Some(existing) = self.existing_gateway(&spec.vlan, container)? {
            return Ok(existing);
        }
        let gateway = spec.address.synthetic_gateway();
        if !spec.address.contains(gateway) {
            warn!(
                address = %spec.address,
                gateway = %gateway,
                "Synthetic gateway lies outside the subnet"
            );
        }
        Ok(gateway)
    }

    /// Elect the gateway, write address, gateway and VLAN into the container
    /// config and switch the guest to static networking.
    ///
    /// # Errors
    ///
    /// Returns an error if the VLAN lock cannot be taken or the engine fails.
    pub fn configure(
        &self,
        container: &str,
        spec: &NetworkSpec,
    ) -> Result<NetworkAssignment, NetworkError> {
        let _registry = self.locks.vlan(&spec.vlan)?;

        let gateway = self.elect_gateway(container, spec)?;
        let address = spec.address.to_string();
        let gateway_text = gateway.to_string();
        self.engine.set_network_config(
            container,
            &[
                (KEY_IPV4, address.as_str()),
                (KEY_GATEWAY, gateway_text.as_str()),
                (KEY_VLAN, spec.vlan.as_str()),
            ],
        )?;
        self.engine.set_static_networking(container)?;

        info!(
            container = %container,
            address = %spec.address,
            gateway = %gateway,
            vlan = %spec.vlan,
            "Configured static network"
        );
        Ok(NetworkAssignment {
            address: spec.address,
            gateway,
            vlan: spec.vlan.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::engine::HardeningStep;

    #[derive(Default)]
    struct ConfigOnlyEngine {
        configs: Mutex<HashMap<String, HashMap<String, String>>>,
        static_networking: Mutex<Vec<String>>,
    }

    impl ConfigOnlyEngine {
        fn add(&self, name: &str, entries: &[(&str, &str)]) {
            let map = entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect();
            self.configs.lock().unwrap().insert(name.to_string(), map);
        }
    }

    impl ContainerEngine for ConfigOnlyEngine {
        fn template_exists(&self, _id: &str) -> bool {
            false
        }

        fn container_exists(&self, name: &str) -> bool {
            self.configs.lock().unwrap().contains_key(name)
        }

        fn clone_container(&self, _parent_id: &str, child: &str) -> Result<(), EngineError> {
            self.add(child, &[]);
            Ok(())
        }

        fn set_network_config(
            &self,
            name: &str,
            entries: &[(&str, &str)],
        ) -> Result<(), EngineError> {
            let mut configs = self.configs.lock().unwrap();
            let conf = configs
                .get_mut(name)
                .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
            for (k, v) in entries {
                conf.insert((*k).to_string(), (*v).to_string());
            }
            Ok(())
        }

        fn set_static_networking(&self, name: &str) -> Result<(), EngineError> {
            self.static_networking.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn assign_uid(&self, _name: &str) -> Result<String, EngineError> {
            Ok("65536".to_string())
        }

        fn apply_hardening(&self, _name: &str, _step: HardeningStep) -> Result<(), EngineError> {
            Ok(())
        }

        fn start(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }

        fn read_config_value(&self, name: &str, key: &str) -> Result<Option<String>, EngineError> {
            let configs = self.configs.lock().unwrap();
            let conf = configs
                .get(name)
                .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
            Ok(conf.get(key).cloned())
        }

        fn list_containers(&self) -> Result<Vec<String>, EngineError> {
            Ok(self.configs.lock().unwrap().keys().cloned().collect())
        }

        fn query_quota(&self, _name: &str) -> Result<Option<u32>, EngineError> {
            Ok(None)
        }
    }

    #[test]
    fn test_parse_network_spec() {
        let spec = NetworkSpec::parse("10.0.5.7/24 42").unwrap();
        assert_eq!(spec.address.to_string(), "10.0.5.7/24");
        assert_eq!(spec.vlan, "42");

        let spaced = NetworkSpec::parse("  10.0.5.7/24   42 ").unwrap();
        assert_eq!(spaced, spec);
    }

    #[test]
    fn test_parse_network_spec_requires_both_fields() {
        assert!(matches!(
            NetworkSpec::parse("10.0.5.7/24"),
            Err(NetworkError::InvalidSpec(_))
        ));
        assert!(matches!(NetworkSpec::parse(""), Err(NetworkError::InvalidSpec(_))));
        assert!(matches!(
            NetworkSpec::parse("10.0.5.300/24 42"),
            Err(NetworkError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_fresh_vlan_gets_synthetic_gateway() {
        let dir = TempDir::new().unwrap();
        let locks = LockDir::new(dir.path());
        let engine = ConfigOnlyEngine::default();
        engine.add("c1", &[]);

        let resolver = NetworkResolver::new(&engine, &locks);
        let spec = NetworkSpec::parse("192.168.50.10/24 7").unwrap();
        let assignment = resolver.configure("c1", &spec).unwrap();

        assert_eq!(assignment.gateway, Ipv4Addr::new(192, 168, 50, 245));
        assert_eq!(
            engine.read_config_value("c1", KEY_IPV4).unwrap().as_deref(),
            Some("192.168.50.10/24")
        );
        assert_eq!(
            engine.read_config_value("c1", KEY_GATEWAY).unwrap().as_deref(),
            Some("192.168.50.245")
        );
        assert_eq!(
            engine.read_config_value("c1", KEY_VLAN).unwrap().as_deref(),
            Some("7")
        );
        assert_eq!(*engine.static_networking.lock().unwrap(), vec!["c1"]);
    }

    #[test]
    fn test_occupied_vlan_reuses_gateway() {
        let dir = TempDir::new().unwrap();
        let locks = LockDir::new(dir.path());
        let engine = ConfigOnlyEngine::default();
        engine.add("c1", &[]);
        engine.add("c2", &[]);
        engine.add("c3", &[]);

        let resolver = NetworkResolver::new(&engine, &locks);
        let first = resolver
            .configure("c1", &NetworkSpec::parse("10.0.5.7/24 42").unwrap())
            .unwrap();
        let second = resolver
            .configure("c2", &NetworkSpec::parse("10.0.5.99/24 42").unwrap())
            .unwrap();
        let third = resolver
            .configure("c3", &NetworkSpec::parse("10.9.9.9/16 42").unwrap())
            .unwrap();

        assert_eq!(first.gateway, Ipv4Addr::new(10, 0, 5, 248));
        assert_eq!(second.gateway, first.gateway);
        assert_eq!(third.gateway, first.gateway);
    }

    #[test]
    fn test_other_vlans_do_not_share_gateway() {
        let dir = TempDir::new().unwrap();
        let locks = LockDir::new(dir.path());
        let engine = ConfigOnlyEngine::default();
        engine.add(
            "existing",
            &[(KEY_VLAN, "1"), (KEY_GATEWAY, "10.0.0.1")],
        );
        engine.add("c1", &[]);

        let resolver = NetworkResolver::new(&engine, &locks);
        let spec = NetworkSpec::parse("10.0.5.7/24 2").unwrap();
        assert_eq!(
            resolver.elect_gateway("c1", &spec).unwrap(),
            Ipv4Addr::new(10, 0, 5, 248)
        );
    }

    #[test]
    fn test_container_does_not_elect_itself() {
        let dir = TempDir::new().unwrap();
        let locks = LockDir::new(dir.path());
        let engine = ConfigOnlyEngine::default();
        engine.add("c1", &[]);

        let resolver = NetworkResolver::new(&engine, &locks);
        resolver
            .configure("c1", &NetworkSpec::parse("10.0.5.7/24 42").unwrap())
            .unwrap();
        // Only member of the VLAN: its own entry is excluded, so the
        // synthetic rule applies again to the new address.
        let again = resolver
            .configure("c1", &NetworkSpec::parse("10.0.5.8/24 42").unwrap())
            .unwrap();
        assert_eq!(again.gateway, Ipv4Addr::new(10, 0, 5, 247));
    }

    #[test]
    fn test_unparsable_recorded_gateway_is_skipped() {
        let dir = TempDir::new().unwrap();
        let locks = LockDir::new(dir.path());
        let engine = ConfigOnlyEngine::default();
        engine.add("a", &[(KEY_VLAN, "42"), (KEY_GATEWAY, "garbage")]);
        engine.add("b", &[(KEY_VLAN, "42"), (KEY_GATEWAY, "10.0.5.1")]);

        let resolver = NetworkResolver::new(&engine, &locks);
        assert_eq!(
            resolver.existing_gateway("42", "c9").unwrap(),
            Some(Ipv4Addr::new(10, 0, 5, 1))
        );
    }
}
