//! Jail backup export and import
//!
//! An export contains the jail's config, its fstab with host paths
//! rewritten to `backup:///` URIs, either an rsync delta of the root
//! against the release snapshot or a full `root.zfs` stream, and a stream
//! per additional child dataset. The artifacts land in a directory or are
//! bundled into a tar.zst archive. Imports reverse the process, creating
//! the target jail from its release (differential) or from scratch
//! (standalone).

use crate::error::{Error, Result};
use crate::events::{EventType, Scope};
use crate::fstab::Fstab;
use crate::jail::Jail;
use crate::securetar::{self, Compression};
use crate::zfs::SnapshotId;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Disambiguates work snapshots taken within the same second
static BACKUP_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Layout of an export destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// All artifacts bundled into one tar.zst archive
    Tar,
    /// Artifacts written directly below a directory
    Directory,
}

/// A backup operation bound to one jail
///
/// Only one backup may hold the lock (work directory plus snapshot name)
/// per resource at a time.
pub struct JailBackup<'a, 'b> {
    jail: &'b mut Jail<'a>,
    work_dir: Option<PathBuf>,
    snapshot_name: Option<String>,
    owns_work_dir: bool,
}

impl<'a, 'b> JailBackup<'a, 'b> {
    pub fn new(jail: &'b mut Jail<'a>) -> Self {
        Self {
            jail,
            work_dir: None,
            snapshot_name: None,
            owns_work_dir: false,
        }
    }

    fn locked(&self) -> bool {
        self.work_dir.is_some()
    }

    /// Acquire the backup lock: adopt or create the work directory and
    /// pick the snapshot name
    fn lock(&mut self, work_dir: Option<&Path>) -> Result<()> {
        if self.locked() {
            return Err(Error::BackupInProgress(self.jail.humanreadable_name()));
        }

        let (dir, owned) = match work_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                (dir.to_path_buf(), false)
            }
            None => {
                let dir = std::env::temp_dir().join(format!(
                    "ioc-backup-{}-{}",
                    self.jail.name(),
                    std::process::id()
                ));
                fs::create_dir_all(&dir)?;
                (dir, true)
            }
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        // pid plus sequence keep rapid exports of the same jail (bulk
        // scripts, same-second loops) from colliding on the snapshot name
        let sequence = BACKUP_COUNTER.fetch_add(1, Ordering::SeqCst);
        self.snapshot_name = Some(format!(
            "backup-{}-{}-{}",
            timestamp,
            std::process::id(),
            sequence
        ));
        self.work_dir = Some(dir);
        self.owns_work_dir = owned;
        Ok(())
    }

    fn unlock(&mut self) {
        if self.owns_work_dir {
            if let Some(dir) = &self.work_dir {
                let _ = fs::remove_dir_all(dir);
            }
        }
        self.work_dir = None;
        self.snapshot_name = None;
        self.owns_work_dir = false;
    }

    fn work_dir(&self) -> Result<&PathBuf> {
        self.work_dir
            .as_ref()
            .ok_or_else(|| Error::BackupInProgress("not locked".into()))
    }

    fn snapshot_name(&self) -> Result<&str> {
        self.snapshot_name
            .as_deref()
            .ok_or_else(|| Error::BackupInProgress("not locked".into()))
    }

    // Export

    /// Export the jail
    ///
    /// With `standalone` unset, jails forked from a release export an
    /// rsync delta; standalone exports carry the full root stream and are
    /// independent of any release.
    pub fn export(
        &mut self,
        scope: &mut Scope,
        destination: &Path,
        backup_format: BackupFormat,
        standalone: Option<bool>,
        recursive: bool,
    ) -> Result<()> {
        match backup_format {
            BackupFormat::Tar => self.lock(None)?,
            BackupFormat::Directory => {
                if destination.exists() {
                    return Err(Error::ExportDestinationExists(destination.to_path_buf()));
                }
                self.lock(Some(destination))?;
            }
        }

        let jail_dataset = self.jail.dataset()?;
        let snapshot_name = self.snapshot_name()?.to_string();
        self.jail
            .host
            .zfs
            .snapshot(&jail_dataset, &snapshot_name, true)?;

        let has_release = self.jail.release()?.is_some();
        let is_standalone = standalone.unwrap_or(false) || !has_release;

        let result = scope.run(
            EventType::ResourceBackup,
            Some(self.jail.humanreadable_name()),
            |scope, _| {
                self.export_config(scope)?;
                self.export_fstab(scope)?;
                if !is_standalone {
                    self.export_root_delta(scope)?;
                }
                self.export_other_datasets(scope, is_standalone, recursive)?;
                if backup_format == BackupFormat::Tar {
                    self.bundle(scope, destination)?;
                }
                Ok(())
            },
        );

        let _ = self
            .jail
            .host
            .zfs
            .destroy_snapshot(&jail_dataset, &snapshot_name, true);
        self.unlock();
        result
    }

    fn export_config(&mut self, scope: &mut Scope) -> Result<()> {
        let path = self.work_dir()?.join("config.json");
        scope.run(
            EventType::ExportConfig,
            Some(self.jail.humanreadable_name()),
            |_, _| {
                let mut json = serde_json::Map::new();
                for (key, value) in self.jail.config.to_map() {
                    json.insert(key, value.to_json());
                }
                let rendered =
                    serde_json::to_string_pretty(&serde_json::Value::Object(json))?;
                fs::write(&path, rendered)?;
                Ok(())
            },
        )
    }

    fn export_fstab(&mut self, scope: &mut Scope) -> Result<()> {
        let path = self.work_dir()?.join("fstab");
        let jail_dir = self.jail.dataset_path()?;
        scope.run(
            EventType::ExportFstab,
            Some(self.jail.humanreadable_name()),
            |_, _| {
                let mut fstab = self.jail.fstab()?;
                fstab.replace_path(&jail_dir.to_string_lossy(), "backup://");
                fs::write(&path, fstab.render())?;
                Ok(())
            },
        )
    }

    /// rsync the root against the release snapshot, excluding basedirs
    fn export_root_delta(&mut self, scope: &mut Scope) -> Result<()> {
        let work_root = self.work_dir()?.join("root");
        scope.run(
            EventType::ExportRootDataset,
            Some(self.jail.humanreadable_name()),
            |_, _| {
                let release = self
                    .jail
                    .release()?
                    .ok_or_else(|| Error::DefaultReleaseNotFound)?;
                let snapshot = release.current_snapshot()?;
                let compare_dest = release
                    .root_path()?
                    .join(".zfs/snapshot")
                    .join(&snapshot.name);
                let root_path = self.jail.root_path()?;

                fs::create_dir_all(&work_root)?;

                let mut command = Command::new("rsync");
                command.args([
                    "-av",
                    "--checksum",
                    "--links",
                    "--hard-links",
                    "--safe-links",
                ]);
                for basedir in self.jail.host.distribution.basedirs() {
                    command.arg("--exclude");
                    command.arg(format!("{}/{}", root_path.display(), basedir));
                }
                command.arg(format!("--compare-dest={}/", compare_dest.display()));
                command.arg(format!("{}/", root_path.display()));
                command.arg(&work_root);

                let status = command.status().map_err(|e| Error::CommandFailure {
                    command: "rsync".into(),
                    message: e.to_string(),
                })?;
                if !status.success() {
                    return Err(Error::CommandFailure {
                        command: "rsync".into(),
                        message: "root delta export failed".into(),
                    });
                }
                Ok(())
            },
        )
    }

    /// Stream child datasets (including `root` for standalone exports)
    fn export_other_datasets(
        &mut self,
        scope: &mut Scope,
        standalone: bool,
        recursive: bool,
    ) -> Result<()> {
        let jail_dataset = self.jail.dataset()?;
        let root_dataset = self.jail.root_dataset()?;
        let snapshot_name = self.snapshot_name()?.to_string();
        let work_dir = self.work_dir()?.clone();

        scope.run(
            EventType::ExportOtherDatasets,
            Some(self.jail.humanreadable_name()),
            |scope, _| {
                let mut exported_any = false;
                for dataset in self.jail.host.zfs.list_descendants(&jail_dataset)? {
                    if dataset == root_dataset && !standalone {
                        continue;
                    }
                    exported_any = true;

                    let relative = dataset[jail_dataset.len() + 1..].to_string();
                    let asset = work_dir.join(format!("{}.zfs", relative));
                    if let Some(parent) = asset.parent() {
                        fs::create_dir_all(parent)?;
                    }

                    let zfs = &self.jail.host.zfs;
                    scope.run(
                        EventType::ExportOtherDatasets,
                        Some(dataset.clone()),
                        |_, _| {
                            zfs.send_to_file(
                                &SnapshotId {
                                    dataset: dataset.clone(),
                                    name: snapshot_name.clone(),
                                },
                                &asset,
                                recursive,
                            )
                        },
                    )?;
                }
                if !exported_any {
                    log::debug!("No additional datasets to export");
                }
                Ok(())
            },
        )
    }

    fn bundle(&mut self, scope: &mut Scope, destination: &Path) -> Result<()> {
        if destination.exists() {
            return Err(Error::ExportDestinationExists(destination.to_path_buf()));
        }
        let work_dir = self.work_dir()?.clone();
        scope.run(
            EventType::BackupBundle,
            Some(destination.to_string_lossy().to_string()),
            |_, _| {
                let file = fs::File::create(destination)?;
                let encoder =
                    zstd::stream::Encoder::new(file, 3).map_err(|e| Error::CommandFailure {
                        command: "zstd".into(),
                        message: e.to_string(),
                    })?;
                let mut builder = tar::Builder::new(encoder);
                builder.follow_symlinks(false);
                builder.append_dir_all(".", &work_dir)?;
                let encoder = builder.into_inner()?;
                encoder.finish().map_err(|e| Error::CommandFailure {
                    command: "zstd".into(),
                    message: e.to_string(),
                })?;
                Ok(())
            },
        )
    }

    // Import

    /// Restore an export into this (not yet existing) jail
    pub fn restore(&mut self, scope: &mut Scope, source: &Path) -> Result<()> {
        if !source.exists() {
            return Err(Error::BackupSourceDoesNotExist(source.to_path_buf()));
        }

        let backup_format = if source.is_dir() {
            BackupFormat::Directory
        } else if is_archive_name(source) {
            BackupFormat::Tar
        } else {
            return Err(Error::BackupUnknownFormat(
                source.to_string_lossy().to_string(),
            ));
        };

        match backup_format {
            BackupFormat::Tar => self.lock(None)?,
            BackupFormat::Directory => self.lock(Some(source))?,
        }

        let result = scope.run(
            EventType::ResourceBackup,
            Some(self.jail.humanreadable_name()),
            |scope, event| {
                if backup_format == BackupFormat::Tar {
                    securetar::extract(source, archive_compression(source), self.work_dir()?)?;
                }

                let work_dir = self.work_dir()?.clone();
                let archived_config = read_archived_config(&work_dir)?;
                let is_standalone = work_dir.join("root.zfs").is_file();
                let has_release = archived_config
                    .get("release")
                    .map(|v| !v.is_null())
                    .unwrap_or(false);

                // a failed import never leaves a half-created dataset
                let zfs = self.jail.host.zfs.clone();
                let dataset = self.jail.dataset()?;
                event.add_rollback_step(move || zfs.destroy_recursive(&dataset));

                if has_release && !is_standalone {
                    let release_name = archived_config
                        .get("release")
                        .map(|v| v.to_config_string())
                        .unwrap_or_default();
                    let release = crate::release::Release::new(self.jail.host, &release_name)?;
                    self.jail.create_from_release(scope, &release)?;
                } else {
                    self.jail.create_from_scratch(scope)?;
                }

                if !is_standalone && work_dir.join("root").is_dir() {
                    self.import_root_delta(scope)?;
                }
                self.import_other_datasets(scope)?;
                self.import_config(scope, &archived_config)?;
                self.import_fstab(scope)?;
                Ok(())
            },
        );

        self.unlock();
        result
    }

    fn import_root_delta(&mut self, scope: &mut Scope) -> Result<()> {
        let work_root = self.work_dir()?.join("root");
        scope.run(
            EventType::ImportRootDataset,
            Some(self.jail.humanreadable_name()),
            |_, _| {
                let root_path = self.jail.root_path()?;
                let status = Command::new("rsync")
                    .args(["-av", "--links", "--hard-links", "--safe-links"])
                    .arg(format!("{}/", work_root.display()))
                    .arg(format!("{}/", root_path.display()))
                    .status()
                    .map_err(|e| Error::CommandFailure {
                        command: "rsync".into(),
                        message: e.to_string(),
                    })?;
                if !status.success() {
                    return Err(Error::CommandFailure {
                        command: "rsync".into(),
                        message: "root delta import failed".into(),
                    });
                }
                Ok(())
            },
        )
    }

    fn import_other_datasets(&mut self, scope: &mut Scope) -> Result<()> {
        let work_dir = self.work_dir()?.clone();
        let jail_dataset = self.jail.dataset()?;

        scope.run(
            EventType::ImportOtherDatasets,
            Some(self.jail.humanreadable_name()),
            |scope, _| {
                for relative in list_importable_datasets(&work_dir, &work_dir)? {
                    let asset = work_dir.join(format!("{}.zfs", relative));
                    let target = format!("{}/{}", jail_dataset, relative);
                    let zfs = &self.jail.host.zfs;
                    scope.run(
                        EventType::ImportOtherDatasets,
                        Some(target.clone()),
                        |_, _| zfs.receive_from_file(&target, &asset, true),
                    )?;
                }
                Ok(())
            },
        )
    }

    fn import_config(
        &mut self,
        scope: &mut Scope,
        archived_config: &BTreeMap<String, crate::config::value::Value>,
    ) -> Result<()> {
        scope.run(
            EventType::ImportConfig,
            Some(self.jail.humanreadable_name()),
            |_, _| {
                let id = self.jail.name();
                let mut data = archived_config.clone();
                data.remove("id");
                self.jail.config.clone_data(&data, true)?;
                self.jail.config.set("id", &id)?;
                self.jail.config.save()
            },
        )
    }

    fn import_fstab(&mut self, scope: &mut Scope) -> Result<()> {
        let source_path = self.work_dir()?.join("fstab");
        if !source_path.is_file() {
            return Ok(());
        }
        scope.run(
            EventType::ImportFstab,
            Some(self.jail.humanreadable_name()),
            |_, _| {
                // parsing rewrites backup:/// URIs to the new jail paths
                let content = fs::read_to_string(&source_path)?;
                let mut fstab = Fstab::new(self.jail.dataset_path()?);
                fstab.parse(&content)?;
                fstab.save()
            },
        )
    }
}

fn is_archive_name(source: &Path) -> bool {
    let name = source.to_string_lossy();
    name.ends_with(".tar") || name.ends_with(".tar.zst") || name.ends_with(".txz")
}

fn archive_compression(source: &Path) -> Compression {
    let name = source.to_string_lossy();
    if name.ends_with(".tar.zst") {
        Compression::Zstd
    } else if name.ends_with(".txz") {
        Compression::Xz
    } else {
        Compression::None
    }
}

fn read_archived_config(
    work_dir: &Path,
) -> Result<BTreeMap<String, crate::config::value::Value>> {
    let content = fs::read_to_string(work_dir.join("config.json"))?;
    let json: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)?;
    Ok(json
        .iter()
        .map(|(key, value)| (key.clone(), crate::config::value::Value::from_json(value)))
        .collect())
}

/// Find `<relative>.zfs` assets below the work directory
fn list_importable_datasets(work_dir: &Path, current: &Path) -> Result<Vec<String>> {
    let mut assets = Vec::new();
    if !current.is_dir() {
        return Ok(assets);
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if path == work_dir.join("root") || path == work_dir.join("fstab") {
            continue;
        }
        if path.is_dir() {
            assets.extend(list_importable_datasets(work_dir, &path)?);
        } else if let Some(name) = path.to_string_lossy().strip_suffix(".zfs") {
            let relative = name
                .strip_prefix(&format!("{}/", work_dir.display()))
                .unwrap_or(name)
                .to_string();
            assets.push(relative);
        }
    }
    assets.sort();
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name_detection() {
        assert!(is_archive_name(Path::new("/x/backup.tar")));
        assert!(is_archive_name(Path::new("/x/backup.tar.zst")));
        assert!(is_archive_name(Path::new("/x/backup.txz")));
        assert!(!is_archive_name(Path::new("/x/backup.bin")));
    }

    #[test]
    fn test_archive_compression_selection() {
        assert_eq!(
            archive_compression(Path::new("a.tar.zst")),
            Compression::Zstd
        );
        assert_eq!(archive_compression(Path::new("a.txz")), Compression::Xz);
        assert_eq!(archive_compression(Path::new("a.tar")), Compression::None);
    }

    #[test]
    fn test_list_importable_datasets() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("root")).unwrap();
        fs::write(dir.path().join("fstab"), "").unwrap();
        fs::write(dir.path().join("data.zfs"), "").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/logs.zfs"), "").unwrap();

        let assets = list_importable_datasets(dir.path(), dir.path()).unwrap();
        assert_eq!(assets, vec!["data".to_string(), "nested/logs".to_string()]);
    }

    #[test]
    fn test_read_archived_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"release": "13.2-RELEASE", "vnet": "yes"}"#,
        )
        .unwrap();
        let config = read_archived_config(dir.path()).unwrap();
        assert_eq!(
            config["release"].to_config_string(),
            "13.2-RELEASE".to_string()
        );
    }
}
