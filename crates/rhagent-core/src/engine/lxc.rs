//! [`ContainerEngine`] over the LXC userspace tools.
//!
//! Every instance lives in `<lxc_prefix>/<name>/` with its `config` file and
//! `rootfs/` tree. Templates are instances whose config carries the
//! [`KEY_TEMPLATE`] marker.

use std::path::PathBuf;
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{
    ContainerEngine, EngineError, HardeningStep, KEY_ID_MAP, KEY_TEMPLATE, KEY_VETH_PAIR,
    LxcConfig,
};
use crate::config::{AgentConfig, HardeningSection};
use crate::lock::LockDir;

/// Width of the UID/GID range mapped into each container.
const ID_RANGE: u32 = 65536;

const KEY_CPU_QUOTA: &str = "lxc.cgroup.cpu.cfs_quota_us";
const KEY_CPU_PERIOD: &str = "lxc.cgroup.cpu.cfs_period_us";
const DEFAULT_CPU_PERIOD: i64 = 100_000;

const STATIC_INTERFACES: &str = "\
auto lo
iface lo inet loopback

auto eth0
iface eth0 inet manual
";

/// LXC-backed container engine.
#[derive(Debug, Clone)]
pub struct LxcEngine {
    lxc_prefix: PathBuf,
    hardening: HardeningSection,
    locks: LockDir,
}

impl LxcEngine {
    /// Create an engine rooted at the configured container directory.
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            lxc_prefix: config.agent.lxc_prefix.clone(),
            hardening: config.hardening.clone(),
            locks: LockDir::new(config.agent.lock_dir()),
        }
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.lxc_prefix.join(name).join("config")
    }

    fn rootfs(&self, name: &str) -> PathBuf {
        self.lxc_prefix.join(name).join("rootfs")
    }

    fn load(&self, name: &str) -> Result<LxcConfig, EngineError> {
        let path = self.config_path(name);
        LxcConfig::load(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(name.to_string())
            } else {
                EngineError::Io { path, source }
            }
        })
    }

    fn store(&self, name: &str, conf: &LxcConfig) -> Result<(), EngineError> {
        let path = self.config_path(name);
        conf.save(&path)
            .map_err(|source| EngineError::Io { path, source })
    }

    fn update(
        &self,
        name: &str,
        edit: impl FnOnce(&mut LxcConfig),
    ) -> Result<(), EngineError> {
        let mut conf = self.load(name)?;
        edit(&mut conf);
        self.store(name, &conf)
    }

    /// Every instance directory with a readable config, templates included.
    fn instances(&self) -> Result<Vec<(String, LxcConfig)>, EngineError> {
        let entries = std::fs::read_dir(&self.lxc_prefix).map_err(|source| EngineError::Io {
            path: self.lxc_prefix.clone(),
            source,
        })?;

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Ok(conf) = LxcConfig::load(&entry.path().join("config")) {
                out.push((name, conf));
            }
        }
        Ok(out)
    }

    /// Write `contents` to `relative` inside the guest rootfs.
    ///
    /// A symlink at the target is replaced rather than followed, so a guest
    /// cannot redirect the write onto the host.
    fn write_guest_file(
        &self,
        name: &str,
        relative: &str,
        contents: &str,
    ) -> Result<(), EngineError> {
        let path = self.rootfs(name).join(relative);
        let io_err = |source| EngineError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        if std::fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink()) {
            std::fs::remove_file(&path).map_err(io_err)?;
        }
        std::fs::write(&path, contents).map_err(io_err)
    }

    fn disable_ssh_password(&self, name: &str) -> Result<(), EngineError> {
        let path = self.rootfs(name).join("etc/ssh/sshd_config");
        let current = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(container = %name, "No sshd_config in guest");
                return Ok(());
            },
            Err(source) => return Err(EngineError::Io { path, source }),
        };

        self.write_guest_file(name, "etc/ssh/sshd_config", &disable_password_auth(&current))
    }
}

/// Rewrite every (possibly commented) `PasswordAuthentication` directive to
/// `no`, appending one if none is present.
fn disable_password_auth(sshd_config: &str) -> String {
    let mut found = false;
    let mut out: Vec<String> = sshd_config
        .lines()
        .map(|line| {
            let directive = line.trim_start().trim_start_matches('#').trim_start();
            if directive.starts_with("PasswordAuthentication") {
                found = true;
                "PasswordAuthentication no".to_string()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        out.push("PasswordAuthentication no".to_string());
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Host-side veth name: `veth` plus eight hex digits of the name's digest,
/// inside the 15-byte interface name limit.
fn veth_name(container: &str) -> String {
    let digest = Sha256::digest(container.as_bytes());
    format!("veth{}", &hex::encode(digest)[..8])
}

/// Base host UID of an `lxc.id_map` user entry (`u <guest> <host> <count>`).
fn mapped_uid(entry: &str) -> Option<u32> {
    let mut fields = entry.split_whitespace();
    if fields.next()? != "u" {
        return None;
    }
    fields.nth(1)?.parse().ok()
}

fn run(program: &str, args: &[&str]) -> Result<(), EngineError> {
    let command = format!("{program} {}", args.join(" "));
    debug!(%command, "Running engine command");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| EngineError::Command {
            command: command.clone(),
            code: None,
            stderr: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(EngineError::Command {
        command,
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

impl ContainerEngine for LxcEngine {
    fn template_exists(&self, id: &str) -> bool {
        self.load(id)
            .is_ok_and(|conf| conf.get(KEY_TEMPLATE).is_some())
    }

    fn container_exists(&self, name: &str) -> bool {
        !name.is_empty() && self.config_path(name).is_file()
    }

    fn clone_container(&self, parent_id: &str, child: &str) -> Result<(), EngineError> {
        run("lxc-copy", &["-n", parent_id, "-N", child, "-s"])?;
        let veth = veth_name(child);
        self.update(child, |conf| {
            conf.remove(KEY_TEMPLATE);
            conf.set(KEY_VETH_PAIR, &veth);
        })?;
        info!(parent = %parent_id, container = %child, "Cloned container");
        Ok(())
    }

    fn set_network_config(&self, name: &str, entries: &[(&str, &str)]) -> Result<(), EngineError> {
        self.update(name, |conf| {
            for (key, value) in entries {
                conf.set(key, value);
            }
        })
    }

    fn set_static_networking(&self, name: &str) -> Result<(), EngineError> {
        self.write_guest_file(name, "etc/network/interfaces", STATIC_INTERFACES)
    }

    fn assign_uid(&self, name: &str) -> Result<String, EngineError> {
        let _registry = self.locks.uid_map()?;
        let highest = self
            .instances()?
            .iter()
            .filter(|(instance, _)| instance != name)
            .flat_map(|(_, conf)| {
                conf.get_all(KEY_ID_MAP)
                    .into_iter()
                    .filter_map(mapped_uid)
                    .collect::<Vec<_>>()
            })
            .max();
        let uid = highest.map_or(ID_RANGE, |h| h.saturating_add(ID_RANGE));

        let user = format!("u 0 {uid} {ID_RANGE}");
        let group = format!("g 0 {uid} {ID_RANGE}");
        self.update(name, |conf| conf.set_all(KEY_ID_MAP, &[&user, &group]))?;
        Ok(uid.to_string())
    }

    fn apply_hardening(&self, name: &str, step: HardeningStep) -> Result<(), EngineError> {
        match step {
            HardeningStep::PackageManager => match &self.hardening.apt_proxy {
                Some(proxy) => self.write_guest_file(
                    name,
                    "etc/apt/apt.conf.d/01proxy",
                    &format!("Acquire::http::Proxy \"{proxy}\";\n"),
                ),
                None => Ok(()),
            },
            HardeningStep::Dns => {
                let domain = &self.hardening.search_domain;
                self.write_guest_file(
                    name,
                    "etc/resolv.conf",
                    &format!(
                        "domain {domain}\nsearch {domain}\nnameserver {}\n",
                        self.hardening.nameserver
                    ),
                )
            },
            HardeningStep::CheckpointCompat => self.update(name, |conf| {
                conf.set("lxc.console", "none");
                conf.set("lxc.tty", "0");
                conf.set("lxc.cgroup.devices.deny", "c 5:1 rwm");
            }),
            HardeningStep::DisableSshPassword => self.disable_ssh_password(name),
        }
    }

    fn start(&self, name: &str) -> Result<(), EngineError> {
        run("lxc-start", &["-n", name, "-d"])
    }

    fn read_config_value(&self, name: &str, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.load(name)?.get(key).map(str::to_string))
    }

    fn list_containers(&self) -> Result<Vec<String>, EngineError> {
        Ok(self
            .instances()?
            .into_iter()
            .filter(|(_, conf)| conf.get(KEY_TEMPLATE).is_none())
            .map(|(name, _)| name)
            .collect())
    }

    fn query_quota(&self, name: &str) -> Result<Option<u32>, EngineError> {
        let conf = self.load(name)?;
        let parse = |key: &str| -> Result<Option<i64>, EngineError> {
            conf.get(key)
                .map(|v| {
                    v.parse::<i64>().map_err(|_| {
                        EngineError::InvalidConfig(format!("{key} is not a number: {v}"))
                    })
                })
                .transpose()
        };

        let Some(quota) = parse(KEY_CPU_QUOTA)? else {
            return Ok(None);
        };
        if quota <= 0 {
            return Ok(None);
        }
        let period = parse(KEY_CPU_PERIOD)?
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_CPU_PERIOD);
        Ok(u32::try_from(quota.saturating_mul(100) / period).ok())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::engine::{KEY_GATEWAY, KEY_VLAN};

    fn engine(dir: &TempDir) -> LxcEngine {
        let mut config = AgentConfig::default();
        config.agent.lxc_prefix = dir.path().to_path_buf();
        config.agent.lock_dir = Some(dir.path().join("locks"));
        LxcEngine::new(&config)
    }

    fn write_instance(dir: &TempDir, name: &str, config: &str) {
        let root = dir.path().join(name);
        std::fs::create_dir_all(root.join("rootfs")).unwrap();
        std::fs::write(root.join("config"), config).unwrap();
    }

    #[test]
    fn test_template_and_container_detection() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "base", "#template = true\nlxc.utsname = base\n");
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        let engine = engine(&dir);

        assert!(engine.template_exists("base"));
        assert!(!engine.template_exists("c1"));
        assert!(!engine.template_exists("missing"));
        assert!(engine.container_exists("c1"));
        assert!(engine.container_exists("base"));
        assert!(!engine.container_exists("missing"));
        assert!(!engine.container_exists(""));
    }

    #[test]
    fn test_list_containers_excludes_templates() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "base", "#template = true\n");
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        write_instance(&dir, "c2", "lxc.utsname = c2\n");
        std::fs::create_dir_all(dir.path().join("not-an-instance")).unwrap();

        let mut names = engine(&dir).list_containers().unwrap();
        names.sort();
        assert_eq!(names, vec!["c1", "c2"]);
    }

    #[test]
    fn test_set_network_config_and_read_back() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        let engine = engine(&dir);

        engine
            .set_network_config(
                "c1",
                &[(KEY_GATEWAY, "10.0.5.248"), (KEY_VLAN, "42")],
            )
            .unwrap();
        assert_eq!(
            engine.read_config_value("c1", KEY_GATEWAY).unwrap().as_deref(),
            Some("10.0.5.248")
        );
        assert_eq!(
            engine.read_config_value("c1", KEY_VLAN).unwrap().as_deref(),
            Some("42")
        );
    }

    #[test]
    fn test_read_config_value_of_missing_container() {
        let dir = TempDir::new().unwrap();
        let err = engine(&dir).read_config_value("ghost", KEY_VLAN).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(name) if name == "ghost"));
    }

    #[test]
    fn test_assign_uid_picks_next_free_range() {
        let dir = TempDir::new().unwrap();
        write_instance(
            &dir,
            "c1",
            "lxc.id_map = u 0 65536 65536\nlxc.id_map = g 0 65536 65536\n",
        );
        write_instance(&dir, "c2", "lxc.id_map = u 0 196608 65536\n");
        write_instance(&dir, "c3", "lxc.utsname = c3\n");
        let engine = engine(&dir);

        assert_eq!(engine.assign_uid("c3").unwrap(), "262144");
        let conf = LxcConfig::load(&dir.path().join("c3").join("config")).unwrap();
        assert_eq!(
            conf.get_all(KEY_ID_MAP),
            vec!["u 0 262144 65536", "g 0 262144 65536"]
        );
    }

    #[test]
    fn test_concurrent_assign_uid_hands_out_distinct_ranges() {
        let dir = TempDir::new().unwrap();
        let names: Vec<String> = (0..16).map(|i| format!("c{i}")).collect();
        for name in &names {
            write_instance(&dir, name, &format!("lxc.utsname = {name}\n"));
        }
        let engine = engine(&dir);
        let barrier = std::sync::Barrier::new(names.len());

        let mut uids: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let (engine, barrier) = (&engine, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        engine.assign_uid(name).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), names.len());
    }

    #[test]
    fn test_assign_uid_first_container() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        assert_eq!(engine(&dir).assign_uid("c1").unwrap(), "65536");
    }

    #[test]
    fn test_static_networking_writes_interfaces() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        engine(&dir).set_static_networking("c1").unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("c1/rootfs/etc/network/interfaces")).unwrap();
        assert!(text.contains("iface eth0 inet manual"));
    }

    #[test]
    fn test_dns_hardening_replaces_symlink() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        let etc = dir.path().join("c1/rootfs/etc");
        std::fs::create_dir_all(&etc).unwrap();
        let outside = dir.path().join("host-resolv.conf");
        std::fs::write(&outside, "nameserver 1.1.1.1\n").unwrap();
        std::os::unix::fs::symlink(&outside, etc.join("resolv.conf")).unwrap();

        engine(&dir).apply_hardening("c1", HardeningStep::Dns).unwrap();

        let guest = std::fs::read_to_string(etc.join("resolv.conf")).unwrap();
        assert!(guest.contains("nameserver 10.10.10.1"));
        assert!(guest.contains("search intra.lan"));
        assert_eq!(
            std::fs::read_to_string(&outside).unwrap(),
            "nameserver 1.1.1.1\n"
        );
    }

    #[test]
    fn test_package_manager_hardening_without_proxy_is_noop() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        engine(&dir)
            .apply_hardening("c1", HardeningStep::PackageManager)
            .unwrap();
        assert!(!dir.path().join("c1/rootfs/etc/apt").exists());
    }

    #[test]
    fn test_checkpoint_compat_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        let engine = engine(&dir);

        engine
            .apply_hardening("c1", HardeningStep::CheckpointCompat)
            .unwrap();
        engine
            .apply_hardening("c1", HardeningStep::CheckpointCompat)
            .unwrap();
        let conf = LxcConfig::load(&dir.path().join("c1/config")).unwrap();
        assert_eq!(conf.get_all("lxc.console"), vec!["none"]);
        assert_eq!(conf.get("lxc.tty"), Some("0"));
    }

    #[test]
    fn test_disable_password_auth_rewrites_directives() {
        let input =
            "Port 22\n#PasswordAuthentication yes\nPasswordAuthentication yes\nUsePAM yes\n";
        let out = disable_password_auth(input);
        assert_eq!(
            out,
            "Port 22\nPasswordAuthentication no\nPasswordAuthentication no\nUsePAM yes\n"
        );
    }

    #[test]
    fn test_disable_password_auth_appends_when_missing() {
        let out = disable_password_auth("Port 22\n");
        assert_eq!(out, "Port 22\nPasswordAuthentication no\n");
    }

    #[test]
    fn test_ssh_hardening_without_sshd_config_is_noop() {
        let dir = TempDir::new().unwrap();
        write_instance(&dir, "c1", "lxc.utsname = c1\n");
        engine(&dir)
            .apply_hardening("c1", HardeningStep::DisableSshPassword)
            .unwrap();
    }

    #[test]
    fn test_query_quota() {
        let dir = TempDir::new().unwrap();
        write_instance(
            &dir,
            "c1",
            "lxc.cgroup.cpu.cfs_quota_us = 50000\nlxc.cgroup.cpu.cfs_period_us = 100000\n",
        );
        write_instance(&dir, "c2", "lxc.cgroup.cpu.cfs_quota_us = -1\n");
        write_instance(&dir, "c3", "lxc.cgroup.cpu.cfs_quota_us = lots\n");
        let engine = engine(&dir);

        assert_eq!(engine.query_quota("c1").unwrap(), Some(50));
        assert_eq!(engine.query_quota("c2").unwrap(), None);
        assert!(matches!(
            engine.query_quota("c3"),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_veth_name_fits_interface_limit() {
        let name = veth_name("a-rather-long-container-name");
        assert!(name.len() <= 15);
        assert!(name.starts_with("veth"));
        assert_eq!(name, veth_name("a-rather-long-container-name"));
        assert_ne!(name, veth_name("other"));
    }

    #[test]
    fn test_mapped_uid() {
        assert_eq!(mapped_uid("u 0 65536 65536"), Some(65536));
        assert_eq!(mapped_uid("g 0 65536 65536"), None);
        assert_eq!(mapped_uid("u 0"), None);
    }
}
