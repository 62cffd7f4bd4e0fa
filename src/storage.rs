//! Jail storage backends
//!
//! A jail root is attached in one of three ways: a standalone clone of the
//! release, a NullFS basejail (system directories mounted read-only from
//! the release snapshot by fstab auto lines) or a ZFS basejail (per-basedir
//! datasets cloned below the jail root). All backends share the rename
//! path that moves the jail dataset and its origin snapshot.

use crate::error::{Error, Result};
use crate::events::{EventType, Scope};
use crate::paths::require_no_symlink;
use crate::zfs::{SnapshotId, Zfs};
use std::fs;
use std::path::PathBuf;

/// How a jail's root filesystem is provided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Standalone,
    NullfsBasejail,
    ZfsBasejail,
}

impl StorageBackend {
    /// Select the backend from the `basejail`/`basejail_type` properties
    pub fn from_config(basejail: bool, basejail_type: &str) -> Result<Self> {
        if !basejail {
            return Ok(StorageBackend::Standalone);
        }
        match basejail_type {
            // NullFS is the default basejail flavour
            "nullfs" | "" => Ok(StorageBackend::NullfsBasejail),
            "zfs" => Ok(StorageBackend::ZfsBasejail),
            other => Err(Error::InvalidConfigValue {
                property: "basejail_type".into(),
                reason: format!("unknown basejail type '{}'", other),
            }),
        }
    }
}

/// Dataset coordinates of one jail's storage
#[derive(Debug, Clone)]
pub struct Storage<'a> {
    pub zfs: &'a Zfs,
    /// `<source>/jails/<id>`
    pub jail_dataset: String,
    /// Mountpoint of the root dataset
    pub root_path: PathBuf,
    pub backend: StorageBackend,
    /// Shared system directories of the release
    pub basedirs: Vec<String>,
}

impl<'a> Storage<'a> {
    pub fn root_dataset(&self) -> String {
        format!("{}/root", self.jail_dataset)
    }

    /// Populate the root dataset by cloning a release snapshot once
    ///
    /// Every backend bootstraps this way; basejails additionally prepare
    /// their mountpoints in [`Storage::apply`].
    pub fn setup(&self, release_snapshot: &SnapshotId) -> Result<()> {
        log::debug!(
            "Cloning {} to {}",
            release_snapshot.full_name(),
            self.root_dataset()
        );
        self.zfs
            .clone_snapshot(release_snapshot, &self.root_dataset(), false)?;

        if self.backend != StorageBackend::Standalone {
            self.apply(None)?;
        }
        Ok(())
    }

    /// Attach the storage before start
    ///
    /// - Standalone: nothing to do
    /// - NullFS: recreate the empty mountpoint directories (the actual
    ///   mounts come from the fstab basejail lines)
    /// - ZFS: clone each release base dataset below the jail root
    pub fn apply(&self, release_base_dataset: Option<&str>) -> Result<()> {
        match self.backend {
            StorageBackend::Standalone => Ok(()),
            StorageBackend::NullfsBasejail => {
                for basedir in self.basedirs.iter().map(String::as_str).chain(["dev", "etc"]) {
                    self.create_jail_mountpoint(basedir)?;
                }
                Ok(())
            }
            StorageBackend::ZfsBasejail => {
                for basedir in ["dev", "etc"] {
                    self.create_jail_mountpoint(basedir)?;
                }
                if let Some(base_dataset) = release_base_dataset {
                    self.clone_base_datasets(base_dataset)?;
                }
                Ok(())
            }
        }
    }

    fn clone_base_datasets(&self, base_dataset: &str) -> Result<()> {
        for basedir in &self.basedirs {
            let source = format!("{}/{}", base_dataset, basedir);
            if !self.zfs.dataset_exists(&source) {
                return Err(Error::DatasetNotAvailable(source));
            }

            // clone from the newest snapshot, creating one on first use
            let snapshot_name = match self.zfs.list_snapshots(&source)?.pop() {
                Some(name) => name,
                None => {
                    self.zfs.snapshot(&source, "base", false)?;
                    "base".to_string()
                }
            };
            let snapshot = SnapshotId {
                dataset: source,
                name: snapshot_name,
            };
            let target = format!("{}/{}", self.root_dataset(), basedir);
            self.zfs.clone_snapshot(&snapshot, &target, true)?;
        }
        Ok(())
    }

    /// Ensure a mountpoint directory exists below the jail root
    ///
    /// An existing symlink at the location is removed first.
    fn create_jail_mountpoint(&self, basedir: &str) -> Result<()> {
        let path = self.root_path.join(basedir);
        if path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            log::debug!("Deleting existing symlink {}", path.display());
            fs::remove_file(&path)?;
        }
        require_no_symlink(&path)?;
        fs::create_dir_all(&path)?;
        Ok(())
    }

    /// Rename the jail dataset and, if the root is a clone, its origin
    /// snapshot
    pub fn rename(&self, scope: &mut Scope, new_jail_dataset: &str, new_id: &str) -> Result<()> {
        scope.run(
            EventType::ZfsDatasetRename,
            Some(self.jail_dataset.clone()),
            |_, _| self.zfs.rename_dataset(&self.jail_dataset, new_jail_dataset),
        )?;

        let new_root = format!("{}/root", new_jail_dataset);
        let origin = self.zfs.origin(&new_root)?;
        match origin {
            Some(origin) => scope.run(
                EventType::ZfsSnapshotRename,
                Some(origin.full_name()),
                |_, _| {
                    self.zfs
                        .rename_snapshot(&origin.dataset, &origin.name, new_id)
                },
            ),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection() {
        assert_eq!(
            StorageBackend::from_config(false, "").unwrap(),
            StorageBackend::Standalone
        );
        assert_eq!(
            StorageBackend::from_config(true, "").unwrap(),
            StorageBackend::NullfsBasejail
        );
        assert_eq!(
            StorageBackend::from_config(true, "nullfs").unwrap(),
            StorageBackend::NullfsBasejail
        );
        assert_eq!(
            StorageBackend::from_config(true, "zfs").unwrap(),
            StorageBackend::ZfsBasejail
        );
        assert!(StorageBackend::from_config(true, "overlay").is_err());
    }

    #[test]
    fn test_root_dataset_name() {
        let zfs = Zfs::new();
        let storage = Storage {
            zfs: &zfs,
            jail_dataset: "zroot/ioc/jails/web01".into(),
            root_path: PathBuf::from("/zroot/ioc/jails/web01/root"),
            backend: StorageBackend::Standalone,
            basedirs: vec![],
        };
        assert_eq!(storage.root_dataset(), "zroot/ioc/jails/web01/root");
    }

    #[test]
    fn test_nullfs_mountpoints_created() {
        let dir = tempfile::tempdir().unwrap();
        let zfs = Zfs::new();
        let storage = Storage {
            zfs: &zfs,
            jail_dataset: "zroot/ioc/jails/web01".into(),
            root_path: dir.path().to_path_buf(),
            backend: StorageBackend::NullfsBasejail,
            basedirs: vec!["bin".into(), "usr/lib".into()],
        };

        storage.apply(None).unwrap();
        assert!(dir.path().join("bin").is_dir());
        assert!(dir.path().join("usr/lib").is_dir());
        assert!(dir.path().join("dev").is_dir());
        assert!(dir.path().join("etc").is_dir());
    }

    #[test]
    fn test_mountpoint_replaces_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = dir.path().join("elsewhere");
        fs::create_dir(&elsewhere).unwrap();
        std::os::unix::fs::symlink(&elsewhere, dir.path().join("etc")).unwrap();

        let zfs = Zfs::new();
        let storage = Storage {
            zfs: &zfs,
            jail_dataset: "zroot/ioc/jails/web01".into(),
            root_path: dir.path().to_path_buf(),
            backend: StorageBackend::NullfsBasejail,
            basedirs: vec![],
        };
        storage.apply(None).unwrap();

        let etc = dir.path().join("etc");
        assert!(etc.is_dir());
        assert!(!etc.symlink_metadata().unwrap().file_type().is_symlink());
    }
}
