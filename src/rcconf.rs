//! rc.conf style file editing
//!
//! Minimal sysrc-like model for `key="value"` files. Used to toggle
//! `rtsold_enable` when a jail accepts router advertisements and to write
//! the post-extract defaults into a freshly fetched release.

use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// An rc.conf file held in memory
#[derive(Debug, Clone)]
pub struct RcConf {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    changed: bool,
}

impl RcConf {
    /// Load an rc.conf file; a missing file yields an empty set
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = BTreeMap::new();

        if path.is_file() {
            let content = fs::read_to_string(&path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    entries.insert(key.trim().to_string(), value.to_string());
                }
            }
        }

        Ok(Self {
            path,
            entries,
            changed: false,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// True if the value reads as enabled (`YES`, `yes`, `1`, ...)
    pub fn is_enabled(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(str::to_ascii_lowercase).as_deref(),
            Some("yes") | Some("true") | Some("on") | Some("1")
        )
    }

    /// Set a key; booleans are conventionally written as YES/NO
    pub fn set(&mut self, key: &str, value: &str) {
        let previous = self.entries.insert(key.to_string(), value.to_string());
        if previous.as_deref() != Some(value) {
            self.changed = true;
        }
    }

    pub fn set_enabled(&mut self, key: &str, enabled: bool) {
        self.set(key, if enabled { "YES" } else { "NO" });
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.changed = true;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the file back if anything changed. The whole file is replaced
    /// in one write.
    pub fn save(&mut self) -> Result<()> {
        if !self.changed {
            log::debug!("{} unchanged - skipping write", self.path.display());
            return Ok(());
        }

        let mut output = String::new();
        for (key, value) in &self.entries {
            output.push_str(&format!("{}=\"{}\"\n", key, value));
        }
        fs::write(&self.path, output)?;
        self.changed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.conf");
        fs::write(&path, "# comment\nsendmail_enable=\"NO\"\nhostname=\"web01\"\n").unwrap();

        let mut conf = RcConf::load(&path).unwrap();
        assert_eq!(conf.get("hostname"), Some("web01"));
        assert!(!conf.is_enabled("sendmail_enable"));

        conf.set_enabled("rtsold_enable", true);
        conf.save().unwrap();

        let reread = RcConf::load(&path).unwrap();
        assert!(reread.is_enabled("rtsold_enable"));
        assert_eq!(reread.get("hostname"), Some("web01"));
    }

    #[test]
    fn test_unchanged_save_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.conf");
        fs::write(&path, "cron_flags=\"-J 15\"\n").unwrap();

        let mut conf = RcConf::load(&path).unwrap();
        conf.set("cron_flags", "-J 15");
        assert!(!conf.changed);
        conf.save().unwrap();
    }

    #[test]
    fn test_missing_file_is_empty() {
        let conf = RcConf::load("/nonexistent/rc.conf").unwrap();
        assert_eq!(conf.get("anything"), None);
    }
}
