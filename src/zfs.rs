//! ZFS dataset and snapshot operations
//!
//! Thin facade over zfs(8) used by every storage-touching part of the
//! library: dataset trees for jails and releases, patchlevel snapshots,
//! clones for jail roots, and send/receive streams for backups.

use crate::error::{Error, Result};
use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// ZFS command wrapper
///
/// All methods take full dataset names (`pool/path/to/dataset`); snapshot
/// identifiers are `dataset@name`.
#[derive(Debug, Clone, Default)]
pub struct Zfs;

/// A parsed `dataset@snapshot` identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotId {
    pub dataset: String,
    pub name: String,
}

impl SnapshotId {
    /// Split a full snapshot identifier
    pub fn parse(full: &str) -> Result<Self> {
        match full.split_once('@') {
            Some((dataset, name)) if !dataset.is_empty() && !name.is_empty() => Ok(Self {
                dataset: dataset.to_string(),
                name: name.to_string(),
            }),
            _ => Err(Error::InvalidSnapshotIdentifier(full.to_string())),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

impl Zfs {
    pub fn new() -> Self {
        Zfs
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("zfs")
            .args(args)
            .output()
            .map_err(|e| Error::Zfs(format!("Failed to run zfs {}: {}", args[0], e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Zfs(format!(
                "zfs {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn run_status(&self, args: &[&str]) -> Result<()> {
        self.run(args).map(|_| ())
    }

    // Datasets

    /// Check if a dataset exists
    pub fn dataset_exists(&self, dataset: &str) -> bool {
        Command::new("zfs")
            .args(["list", "-H", "-o", "name", dataset])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Create a dataset (and any missing ancestors)
    pub fn create_dataset(&self, dataset: &str) -> Result<()> {
        if self.dataset_exists(dataset) {
            return Err(Error::DatasetExists(dataset.to_string()));
        }
        self.run_status(&["create", "-p", dataset])
    }

    /// Create a dataset if it is not already there
    pub fn ensure_dataset(&self, dataset: &str) -> Result<()> {
        if self.dataset_exists(dataset) {
            return Ok(());
        }
        self.run_status(&["create", "-p", dataset])
    }

    /// Recursively destroy a dataset subtree. Missing datasets are fine.
    pub fn destroy_recursive(&self, dataset: &str) -> Result<()> {
        if !self.dataset_exists(dataset) {
            return Ok(());
        }
        self.run_status(&["destroy", "-r", dataset])
    }

    /// List direct child datasets (full names)
    pub fn list_children(&self, dataset: &str) -> Result<Vec<String>> {
        let out = self.run(&["list", "-H", "-o", "name", "-d", "1", dataset])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != dataset)
            .map(String::from)
            .collect())
    }

    /// List all descendant datasets (full names, the dataset excluded)
    pub fn list_descendants(&self, dataset: &str) -> Result<Vec<String>> {
        let out = self.run(&["list", "-H", "-o", "name", "-r", dataset])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != dataset)
            .map(String::from)
            .collect())
    }

    /// Rename a dataset (children move with it)
    pub fn rename_dataset(&self, from: &str, to: &str) -> Result<()> {
        self.run_status(&["rename", from, to])
    }

    /// Get the mountpoint of a dataset
    pub fn mountpoint(&self, dataset: &str) -> Result<PathBuf> {
        let out = self.run(&["get", "-H", "-o", "value", "mountpoint", dataset])?;
        let value = out.trim();
        if value == "none" || value == "legacy" || value == "-" {
            return Err(Error::DatasetNotMounted(dataset.to_string()));
        }
        Ok(PathBuf::from(value))
    }

    /// Mount a dataset if not already mounted
    pub fn mount(&self, dataset: &str) -> Result<()> {
        let mounted = self.run(&["get", "-H", "-o", "value", "mounted", dataset])?;
        if mounted.trim() == "yes" {
            return Ok(());
        }
        self.run_status(&["mount", dataset])
    }

    /// Get a property value; `-` (unset) maps to None
    pub fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let out = self.run(&["get", "-H", "-o", "value", property, dataset])?;
        let value = out.trim();
        if value == "-" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    /// Set a property
    pub fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", property, value);
        self.run_status(&["set", &assignment, dataset])
    }

    /// Inherit (clear) a property
    pub fn inherit_property(&self, dataset: &str, property: &str) -> Result<()> {
        self.run_status(&["inherit", property, dataset])
    }

    /// Locally set user properties of a dataset whose names start with
    /// `prefix`, with the prefix stripped from the returned keys
    pub fn user_properties(
        &self,
        dataset: &str,
        prefix: &str,
    ) -> Result<Vec<(String, String)>> {
        let out = self.run(&["get", "-H", "-s", "local", "-o", "property,value", "all", dataset])?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter_map(|(property, value)| {
                property
                    .strip_prefix(prefix)
                    .map(|key| (key.to_string(), value.trim().to_string()))
            })
            .collect())
    }

    /// The origin snapshot of a cloned dataset, if any
    pub fn origin(&self, dataset: &str) -> Result<Option<SnapshotId>> {
        match self.get_property(dataset, "origin")? {
            Some(origin) => Ok(Some(SnapshotId::parse(&origin)?)),
            None => Ok(None),
        }
    }

    // Snapshots

    /// Take a snapshot
    pub fn snapshot(&self, dataset: &str, name: &str, recursive: bool) -> Result<()> {
        let full = format!("{}@{}", dataset, name);
        let result = if recursive {
            self.run_status(&["snapshot", "-r", &full])
        } else {
            self.run_status(&["snapshot", &full])
        };
        result.map_err(|e| Error::SnapshotCreation(e.to_string()))
    }

    /// Check if a snapshot exists
    pub fn snapshot_exists(&self, dataset: &str, name: &str) -> bool {
        let full = format!("{}@{}", dataset, name);
        Command::new("zfs")
            .args(["list", "-H", "-t", "snapshot", "-o", "name", &full])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// List snapshot names of a dataset (without the `dataset@` prefix)
    pub fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let out = self.run(&[
            "list", "-H", "-t", "snapshot", "-o", "name", "-d", "1", dataset,
        ])?;
        Ok(out
            .lines()
            .filter_map(|line| line.trim().split_once('@'))
            .map(|(_, name)| name.to_string())
            .collect())
    }

    /// Destroy a snapshot, recursively over child datasets if asked
    pub fn destroy_snapshot(&self, dataset: &str, name: &str, recursive: bool) -> Result<()> {
        let full = format!("{}@{}", dataset, name);
        let result = if recursive {
            self.run_status(&["destroy", "-r", &full])
        } else {
            self.run_status(&["destroy", &full])
        };
        result.map_err(|e| Error::SnapshotDeletion(e.to_string()))
    }

    /// Rename a snapshot
    pub fn rename_snapshot(&self, dataset: &str, from: &str, to: &str) -> Result<()> {
        let old = format!("{}@{}", dataset, from);
        let new = format!("{}@{}", dataset, to);
        self.run_status(&["rename", &old, &new])
    }

    /// Roll a dataset back to a snapshot
    ///
    /// With `force`, snapshots newer than the target are destroyed.
    pub fn rollback(&self, dataset: &str, name: &str, force: bool) -> Result<()> {
        if !self.snapshot_exists(dataset, name) {
            return Err(Error::SnapshotNotFound(format!("{}@{}", dataset, name)));
        }
        let full = format!("{}@{}", dataset, name);
        let result = if force {
            self.run_status(&["rollback", "-r", &full])
        } else {
            self.run_status(&["rollback", &full])
        };
        result.map_err(|e| Error::SnapshotRollback(e.to_string()))
    }

    /// Clone a snapshot to a target dataset
    ///
    /// With `destroy_existing`, a dataset already sitting at the target is
    /// recursively destroyed first.
    pub fn clone_snapshot(
        &self,
        snapshot: &SnapshotId,
        target: &str,
        destroy_existing: bool,
    ) -> Result<()> {
        if self.dataset_exists(target) {
            if !destroy_existing {
                return Err(Error::DatasetExists(target.to_string()));
            }
            self.destroy_recursive(target)?;
        }
        let full = snapshot.full_name();
        self.run_status(&["clone", "-p", &full, target])
    }

    /// Promote a clone so its origin can be destroyed
    pub fn promote(&self, dataset: &str) -> Result<()> {
        self.run_status(&["promote", dataset])
    }

    // Streams

    /// Write a snapshot stream to a file
    ///
    /// With `replicate`, the full snapshot history is included (`zfs send -R`).
    pub fn send_to_file(&self, snapshot: &SnapshotId, path: &PathBuf, replicate: bool) -> Result<()> {
        let file = File::create(path)?;
        let full = snapshot.full_name();
        let mut args = vec!["send"];
        if replicate {
            args.push("-R");
        }
        args.push(&full);

        let status = Command::new("zfs")
            .args(&args)
            .stdout(Stdio::from(file))
            .status()
            .map_err(|e| Error::Zfs(format!("Failed to run zfs send: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Zfs(format!("zfs send of '{}' failed", full)))
        }
    }

    /// Receive a stream from a file into a dataset
    pub fn receive_from_file(&self, dataset: &str, path: &PathBuf, force: bool) -> Result<()> {
        let file = File::open(path)?;
        let mut args = vec!["receive"];
        if force {
            args.push("-F");
        }
        args.push(dataset);

        let status = Command::new("zfs")
            .args(&args)
            .stdin(Stdio::from(file))
            .status()
            .map_err(|e| Error::Zfs(format!("Failed to run zfs receive: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Zfs(format!("zfs receive into '{}' failed", dataset)))
        }
    }

    // Pools

    /// Check if a pool exists and is usable
    pub fn pool_available(&self, pool: &str) -> Result<()> {
        let output = Command::new("zpool")
            .args(["list", "-H", "-o", "health", pool])
            .output()
            .map_err(|e| Error::Zfs(format!("Failed to run zpool list: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ZfsPoolInvalid(pool.to_string()));
        }

        let health = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if health == "ONLINE" || health == "DEGRADED" {
            Ok(())
        } else {
            Err(Error::ZfsPoolUnavailable(pool.to_string()))
        }
    }

    /// Names of all imported pools
    pub fn pools(&self) -> Result<Vec<String>> {
        let output = Command::new("zpool")
            .args(["list", "-H", "-o", "name"])
            .output()
            .map_err(|e| Error::Zfs(format!("Failed to run zpool list: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Zfs("Failed to list pools".into()));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_parse() {
        let id = SnapshotId::parse("zroot/ioc/releases/13.2-RELEASE/root@p0").unwrap();
        assert_eq!(id.dataset, "zroot/ioc/releases/13.2-RELEASE/root");
        assert_eq!(id.name, "p0");
        assert_eq!(id.full_name(), "zroot/ioc/releases/13.2-RELEASE/root@p0");
    }

    #[test]
    fn test_snapshot_id_rejects_malformed() {
        assert!(SnapshotId::parse("no-at-sign").is_err());
        assert!(SnapshotId::parse("@name").is_err());
        assert!(SnapshotId::parse("dataset@").is_err());
    }
}
