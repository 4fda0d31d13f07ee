//! Line-preserving model of an LXC `config` file.
//!
//! Entries are `key = value` lines. Comment-style keys such as `#vlan_id`
//! are ordinary entries as far as this model is concerned; lines without an
//! `=` are kept verbatim and never matched.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// An LXC container config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LxcConfig {
    lines: Vec<String>,
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

impl LxcConfig {
    /// Parse config text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    /// Read and parse the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        std::fs::read_to_string(path).map(|text| Self::parse(&text))
    }

    /// Atomically replace the file at `path` with this config.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Render back to config text.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// First value recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|line| split_entry(line))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Every value recorded for `key`, in file order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| split_entry(line))
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .collect()
    }

    /// Set `key` to a single value.
    ///
    /// The first existing entry is rewritten in place and any further
    /// entries for the key are dropped. An empty value removes the key.
    pub fn set(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.remove(key);
            return;
        }
        self.set_all(key, &[value]);
    }

    /// Replace every entry for `key` with `values`, keeping the position of
    /// the first existing entry.
    pub fn set_all(&mut self, key: &str, values: &[&str]) {
        let position = self
            .lines
            .iter()
            .position(|line| split_entry(line).is_some_and(|(k, _)| k == key));
        self.remove(key);

        let rendered = values.iter().map(|v| format!("{key} = {v}"));
        match position {
            Some(at) => {
                let tail = self.lines.split_off(at);
                self.lines.extend(rendered);
                self.lines.extend(tail);
            },
            None => self.lines.extend(rendered),
        }
    }

    /// Remove every entry for `key`.
    pub fn remove(&mut self, key: &str) {
        self.lines
            .retain(|line| !split_entry(line).is_some_and(|(k, _)| k == key));
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    const SAMPLE: &str = "\
# Template used to create this container: /usr/share/lxc/templates/lxc-download
lxc.rootfs = /var/lib/lxc/c1/rootfs
lxc.utsname = c1
lxc.network.type = veth
lxc.network.veth.pair = vethc1
#vlan_id = 42
lxc.id_map = u 0 65536 65536
lxc.id_map = g 0 65536 65536
";

    #[test]
    fn test_get_values() {
        let conf = LxcConfig::parse(SAMPLE);
        assert_eq!(conf.get("lxc.utsname"), Some("c1"));
        assert_eq!(conf.get(crate::engine::KEY_VETH_PAIR), Some("vethc1"));
        assert_eq!(conf.get("#vlan_id"), Some("42"));
        assert_eq!(conf.get("lxc.network.ipv4"), None);
    }

    #[test]
    fn test_comment_lines_without_equals_are_ignored() {
        let conf = LxcConfig::parse(SAMPLE);
        assert_eq!(conf.get("# Template used to create this container"), None);
        assert!(conf.render().starts_with("# Template used"));
    }

    #[test]
    fn test_get_all_keeps_order() {
        let conf = LxcConfig::parse(SAMPLE);
        assert_eq!(
            conf.get_all("lxc.id_map"),
            vec!["u 0 65536 65536", "g 0 65536 65536"]
        );
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut conf = LxcConfig::parse(SAMPLE);
        conf.set("lxc.utsname", "c2");
        assert_eq!(conf.get("lxc.utsname"), Some("c2"));
        let rendered = conf.render();
        let rootfs = rendered.find("lxc.rootfs").unwrap();
        let uts = rendered.find("lxc.utsname").unwrap();
        assert!(rootfs < uts);
    }

    #[test]
    fn test_set_appends_missing_key() {
        let mut conf = LxcConfig::parse(SAMPLE);
        conf.set("lxc.network.ipv4", "10.0.5.7/24");
        assert!(conf.render().ends_with("lxc.network.ipv4 = 10.0.5.7/24\n"));
    }

    #[test]
    fn test_set_empty_removes() {
        let mut conf = LxcConfig::parse(SAMPLE);
        conf.set("#vlan_id", "");
        assert_eq!(conf.get("#vlan_id"), None);
    }

    #[test]
    fn test_set_all_replaces_multi_valued_key() {
        let mut conf = LxcConfig::parse(SAMPLE);
        conf.set_all("lxc.id_map", &["u 0 131072 65536", "g 0 131072 65536"]);
        assert_eq!(
            conf.get_all("lxc.id_map"),
            vec!["u 0 131072 65536", "g 0 131072 65536"]
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        let mut conf = LxcConfig::parse(SAMPLE);
        conf.set("lxc.network.ipv4.gateway", "10.0.5.248");
        conf.save(&path).unwrap();

        let loaded = LxcConfig::load(&path).unwrap();
        assert_eq!(loaded, conf);
        assert_eq!(loaded.get("lxc.network.ipv4.gateway"), Some("10.0.5.248"));
    }

    proptest! {
        #[test]
        fn prop_set_then_get(
            key in "[a-z#][a-z0-9._]{0,20}",
            value in "[A-Za-z0-9./:]{1,30}",
        ) {
            let mut conf = LxcConfig::parse(SAMPLE);
            conf.set(&key, &value);
            conf.set(&key, &value);
            prop_assert_eq!(conf.get(&key), Some(value.as_str()));
            prop_assert_eq!(conf.get_all(&key).len(), 1);
        }
    }
}
