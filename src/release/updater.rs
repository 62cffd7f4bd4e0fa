//! Release updaters
//!
//! Pulls the distribution's updater script and config from the release
//! source trunk, fetches updates on the host and applies them inside a
//! throwaway jail rooted at the release dataset. A successful apply ends
//! in a new `@pN` snapshot of the release root; failures roll the updates
//! dataset back to its pre-update snapshot.

use crate::config::value::Value;
use crate::error::{Error, Result};
use crate::events::{EventType, Scope};
use crate::fstab::MountLine;
use crate::host::{Distribution, Host};
use crate::jail::Jail;
use crate::release::fetch::{self, RetryConfig};
use crate::release::Release;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;

/// Distribution specific updater behaviour
pub struct Updater<'a> {
    host: &'a Host,
    release: &'a Release<'a>,
    retry: RetryConfig,
}

impl<'a> Updater<'a> {
    pub fn for_host(host: &'a Host, release: &'a Release<'a>) -> Self {
        Self {
            host,
            release,
            retry: RetryConfig::default(),
        }
    }

    fn update_name(&self) -> &'static str {
        match self.host.distribution {
            Distribution::FreeBSD => "freebsd-update",
            Distribution::HardenedBSD => "hbsd-update",
        }
    }

    fn update_script_name(&self) -> &'static str {
        match self.host.distribution {
            Distribution::FreeBSD => "freebsd-update.sh",
            Distribution::HardenedBSD => "hbsd-update",
        }
    }

    fn update_conf_name(&self) -> &'static str {
        match self.host.distribution {
            Distribution::FreeBSD => "freebsd-update.conf",
            Distribution::HardenedBSD => "hbsd-update.conf",
        }
    }

    /// Updater directory as seen from inside the jail
    fn local_updates_dir(&self) -> String {
        format!("/var/db/{}", self.update_name())
    }

    fn host_updates_dir(&self) -> Result<PathBuf> {
        let dataset = self.release.updates_dataset()?;
        self.host.zfs.ensure_dataset(&dataset)?;
        self.host.zfs.mountpoint(&dataset)
    }

    /// Symlink FreeBSD's updater resolves the pristine base through
    fn base_release_symlink(&self) -> String {
        format!("/tmp/ioc-release-{}-p0", self.release.full_name())
    }

    /// The patch version the fetched updates correspond to
    pub fn patch_version(&self) -> Result<u32> {
        match self.host.distribution {
            Distribution::FreeBSD => {
                // parsed from the updated root's /bin/freebsd-version
                let path = self.release.root_path()?.join("bin/freebsd-version");
                let content = fs::read_to_string(&path)?;
                for line in content.lines() {
                    if let Some(value) = line.strip_prefix("USERLAND_VERSION=") {
                        let value = value.trim_matches('"');
                        if let Some(index) = value.rfind("-p") {
                            if let Ok(patch) = value[index + 2..].parse() {
                                return Ok(patch);
                            }
                        }
                        return Ok(0);
                    }
                }
                Ok(0)
            }
            Distribution::HardenedBSD => {
                let path = self.host_updates_dir()?.join("update-latest.txt");
                if !path.is_file() {
                    return Ok(0);
                }
                let content = fs::read_to_string(&path)?;
                let version = content
                    .split('|')
                    .nth(1)
                    .and_then(|field| field.split('-').nth(1))
                    .and_then(|tag| tag.strip_prefix('v').or(Some(tag)))
                    .and_then(|v| v.trim_start_matches(|c: char| !c.is_ascii_digit()).parse().ok())
                    .unwrap_or(0);
                Ok(version)
            }
        }
    }

    /// Download the updater script and its config into the updates dataset
    fn pull_updater(&self) -> Result<()> {
        let updates_dir = self.host_updates_dir()?;
        fs::create_dir_all(&updates_dir)?;

        let script_remote = format!(
            "usr.sbin/{}/{}",
            self.update_name(),
            self.update_script_name()
        );
        let script_local = updates_dir.join(self.update_script_name());
        self.download_trunk_asset(&script_remote, &script_local, 0o744)?;

        // releases before 12 shipped the config under etc/
        let release_major: u32 = self
            .release
            .name
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .unwrap_or(0);
        let conf_remote = if self.host.distribution == Distribution::FreeBSD && release_major < 12
        {
            format!("etc/{}", self.update_conf_name())
        } else {
            format!("usr.sbin/{}/{}", self.update_name(), self.update_conf_name())
        };
        let conf_local = updates_dir.join(self.update_conf_name());
        self.download_trunk_asset(&conf_remote, &conf_local, 0o644)?;

        if self.host.distribution == Distribution::FreeBSD {
            // only the world component is updated inside jails
            let content = fs::read_to_string(&conf_local)?;
            let rewritten: Vec<String> = content
                .lines()
                .map(|line| {
                    if line.trim_start().starts_with("Components") {
                        "Components world".to_string()
                    } else {
                        line.to_string()
                    }
                })
                .collect();
            fs::write(&conf_local, rewritten.join("\n") + "\n")?;
        }

        if self.host.distribution == Distribution::HardenedBSD {
            let url = format!(
                "https://updates.hardenedbsd.org/pub/HardenedBSD/updates/hardened/{}/master/{}/update-latest.txt",
                self.host.os_version.release_name().to_lowercase(),
                self.host.processor
            );
            let local = updates_dir.join("update-latest.txt");
            self.download_url(&url, &local, 0o744)?;
        }

        Ok(())
    }

    fn download_trunk_asset(&self, remote: &str, local: &PathBuf, mode: u32) -> Result<()> {
        let url = match self.host.distribution {
            Distribution::HardenedBSD => {
                let branch = self.release.hbsd_release_branch()?;
                format!(
                    "https://raw.githubusercontent.com/HardenedBSD/hardenedBSD/{}/{}",
                    branch, remote
                )
            }
            Distribution::FreeBSD => self
                .host
                .distribution
                .release_trunk_file_url(&self.release.name, remote),
        };
        self.download_url(&url, local, mode)
    }

    fn download_url(&self, url: &str, local: &PathBuf, mode: u32) -> Result<()> {
        if local.is_file() {
            fs::remove_file(local)?;
        }
        fetch::download_file(url, local, &self.retry)?;
        let mut permissions = fs::metadata(local)?.permissions();
        permissions.set_mode(mode);
        fs::set_permissions(local, permissions)?;
        Ok(())
    }

    /// The host-side fetch command line
    fn fetch_command(&self) -> Result<String> {
        let updates_dir = self.host_updates_dir()?;
        let command = match self.host.distribution {
            Distribution::FreeBSD => vec![
                format!("{}/{}", updates_dir.display(), self.update_script_name()),
                "-d".into(),
                format!("{}/temp", updates_dir.display()),
                "--currently-running".into(),
                self.release.name.clone(),
                "-b".into(),
                format!("{}/", self.base_release_symlink()),
                "-f".into(),
                format!("{}/{}", updates_dir.display(), self.update_conf_name()),
                "--not-running-from-cron".into(),
                "fetch".into(),
            ],
            Distribution::HardenedBSD => vec![
                format!("{}/{}", updates_dir.display(), self.update_script_name()),
                "-k".into(),
                self.release.name.clone(),
                "-f".into(),
                "-c".into(),
                format!("{}/{}", updates_dir.display(), self.update_conf_name()),
                "-V".into(),
                "-T".into(),
                "-t".into(),
                format!("{}/temp", updates_dir.display()),
                "-r".into(),
                self.release.root_path()?.to_string_lossy().to_string(),
            ],
        };
        Ok(command.join(" "))
    }

    /// The in-jail install command line
    fn update_command(&self) -> Result<String> {
        let local_dir = self.local_updates_dir();
        let command = match self.host.distribution {
            Distribution::FreeBSD => vec![
                format!("{}/{}", local_dir, self.update_script_name()),
                "--not-running-from-cron".into(),
                "-d".into(),
                format!("{}/temp", local_dir),
                "-b".into(),
                format!("{}/", self.base_release_symlink()),
                "--currently-running".into(),
                self.release.name.clone(),
                "-r".into(),
                self.release.name.clone(),
                "-f".into(),
                format!("{}/{}", local_dir, self.update_conf_name()),
                "install".into(),
            ],
            Distribution::HardenedBSD => vec![
                format!("{}/{}", local_dir, self.update_script_name()),
                "-c".into(),
                format!("{}/{}", local_dir, self.update_conf_name()),
                "-i".into(),
                "-v".into(),
                self.patch_version()?.to_string(),
                "-U".into(),
                "-n".into(),
                "-V".into(),
                "-D".into(),
                "-T".into(),
                "-t".into(),
                format!("{}/temp", local_dir),
            ],
        };
        Ok(command.join(" "))
    }

    /// Wrap a command so a tolerated message does not fail the run
    fn wrap_command(&self, command: &str, tolerated: &str) -> String {
        [
            "set +e".to_string(),
            format!("OUTPUT=\"$({})\"", command),
            "RC=$?".to_string(),
            "echo $OUTPUT".to_string(),
            "if [ $RC -gt 0 ]; then".to_string(),
            format!(
                "echo $OUTPUT | grep -c '{}' >> /dev/null || exit $RC",
                tolerated
            ),
            "fi".to_string(),
        ]
        .join("\n")
    }

    /// Fetch updates on the host
    pub fn fetch(&self, scope: &mut Scope) -> Result<()> {
        if !self.release.name.contains("RELEASE")
            && self.host.distribution == Distribution::FreeBSD
        {
            return Err(Error::NonReleaseUpdateFetch(self.release.name.clone()));
        }

        scope.run(
            EventType::ReleaseUpdatePull,
            Some(self.release.name.clone()),
            |_, _| self.pull_updater(),
        )?;

        scope.run(
            EventType::ReleaseUpdateDownload,
            Some(self.release.name.clone()),
            |_, _| match self.host.distribution {
                Distribution::HardenedBSD => {
                    // hbsd-update fetches during install
                    Ok(())
                }
                Distribution::FreeBSD => {
                    fs::create_dir_all(self.host_updates_dir()?.join("temp"))?;
                    self.with_base_symlink(|| {
                        // EOL releases still update from the archive
                        let script = self.wrap_command(
                            &self.fetch_command()?,
                            "HAS PASSED ITS END-OF-LIFE DATE",
                        );
                        run_shell(&script)
                    })
                }
            },
        )
    }

    /// Apply fetched updates inside a throwaway jail
    pub fn apply(&self, scope: &mut Scope) -> Result<()> {
        let updates_dataset = self.release.updates_dataset()?;
        let snapshot_name = format!("pre-update-{}", std::process::id());

        scope.run(
            EventType::ReleaseUpdate,
            Some(self.release.name.clone()),
            |scope, event| {
                self.host
                    .zfs
                    .snapshot(&updates_dataset, &snapshot_name, true)?;

                let zfs = self.host.zfs.clone();
                let rollback_dataset = updates_dataset.clone();
                let rollback_snapshot = snapshot_name.clone();
                event.add_rollback_step(move || {
                    zfs.rollback(&rollback_dataset, &rollback_snapshot, true)?;
                    zfs.destroy_snapshot(&rollback_dataset, &rollback_snapshot, true)
                });

                self.run_update_jail(scope)?;

                // restore the updates dataset and version the release
                self.host
                    .zfs
                    .rollback(&updates_dataset, &snapshot_name, true)?;
                self.host
                    .zfs
                    .destroy_snapshot(&updates_dataset, &snapshot_name, true)?;

                let patch_version = self.patch_version()?;
                self.release
                    .snapshot(&format!("p{}", patch_version), false)?;
                Ok(())
            },
        )
    }

    fn run_update_jail(&self, scope: &mut Scope) -> Result<()> {
        let temporary_name = format!(
            "{}_u",
            self.release.name.replace('.', "-").to_lowercase()
        );
        let mut jail =
            Jail::with_dataset(self.host, &temporary_name, &self.release.dataset()?)?;

        // mount the updater directory read-write into the jail
        let root_path = jail.root_path()?;
        let destination = root_path.join(self.local_updates_dir().trim_start_matches('/'));
        fs::create_dir_all(&destination)?;
        let mut fstab = jail.fstab()?;
        fstab.add_line(
            MountLine {
                source: self.host_updates_dir()?,
                destination,
                fs_type: "nullfs".into(),
                options: "rw".into(),
                dump: "0".into(),
                passnum: "0".into(),
                comment: None,
            },
            true,
            false,
        )?;
        fstab.save()?;

        let mut overrides: BTreeMap<String, Value> = BTreeMap::new();
        overrides.insert("basejail".into(), Value::Bool(false));
        overrides.insert("release".into(), Value::String(self.release.name.clone()));
        overrides.insert("allow_mount_nullfs".into(), Value::Bool(true));
        overrides.insert("allow_chflags".into(), Value::Bool(true));
        overrides.insert("securelevel".into(), Value::Int(0));
        overrides.insert("vnet".into(), Value::Bool(false));
        overrides.insert("ip4_addr".into(), Value::Null);
        overrides.insert("ip6_addr".into(), Value::Null);
        overrides.insert("defaultrouter".into(), Value::Null);
        overrides.insert("mount_devfs".into(), Value::Bool(true));
        overrides.insert("mount_fdescfs".into(), Value::Bool(false));
        overrides.insert("exec_start".into(), Value::Null);

        let command = match self.host.distribution {
            Distribution::FreeBSD => self.wrap_command(
                &self.update_command()?,
                "No updates are available to install.",
            ),
            Distribution::HardenedBSD => self.update_command()?,
        };

        self.with_jail_base_symlink(&root_path, || {
            jail.fork_exec(scope, &command, &overrides)
        })
    }

    /// FreeBSD's updater needs `-b` pointing at the pristine p0 bits
    fn with_base_symlink(&self, body: impl FnOnce() -> Result<()>) -> Result<()> {
        if self.host.distribution != Distribution::FreeBSD {
            return body();
        }

        let link = PathBuf::from(self.base_release_symlink());
        let mut target = self.release.root_path()?;
        if self.release.version_snapshots()?.contains(&0) {
            target = target.join(".zfs/snapshot/p0");
        }
        if link.exists() {
            let _ = fs::remove_file(&link);
        }
        std::os::unix::fs::symlink(&target, &link)?;

        let result = body();
        let _ = fs::remove_file(&link);
        result
    }

    /// Inside the update jail the same symlink points at `/`
    fn with_jail_base_symlink(
        &self,
        root_path: &PathBuf,
        body: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        if self.host.distribution != Distribution::FreeBSD {
            return body();
        }

        let link = PathBuf::from(format!(
            "{}{}",
            root_path.display(),
            self.base_release_symlink()
        ));
        crate::paths::require_relative_path(root_path, &link)?;
        if link
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            fs::remove_file(&link)?;
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink("/", &link)?;

        let result = body();
        let _ = fs::remove_file(&link);
        result
    }
}

fn run_shell(script: &str) -> Result<()> {
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .status()
        .map_err(|e| Error::CommandFailure {
            command: "sh".into(),
            message: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailure {
            command: "sh".into(),
            message: format!("update script exited with {}", status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_command_tolerates_message() {
        let host = test_host();
        let release = Release::new(&host, "13.2-RELEASE").unwrap();
        let updater = Updater::for_host(&host, &release);

        let wrapped = updater.wrap_command("/usr/bin/false", "NOTHING TO DO");
        assert!(wrapped.contains("set +e"));
        assert!(wrapped.contains("grep -c 'NOTHING TO DO'"));
        assert!(wrapped.contains("exit $RC"));
    }

    #[test]
    fn test_updater_names_per_distribution() {
        let host = test_host();
        let release = Release::new(&host, "13.2-RELEASE").unwrap();
        let updater = Updater::for_host(&host, &release);
        assert_eq!(updater.update_name(), "freebsd-update");
        assert_eq!(updater.local_updates_dir(), "/var/db/freebsd-update");
        assert!(updater
            .base_release_symlink()
            .starts_with("/tmp/ioc-release-13.2-RELEASE"));
    }

    fn test_host() -> Host {
        use crate::host::{Datasets, Distribution, OsVersion, RootDatasets};
        let mut datasets = Datasets::new();
        datasets
            .attach("zroot", RootDatasets::new("zroot/ioc"))
            .unwrap();
        Host {
            os_version: OsVersion::parse("13.2-RELEASE").unwrap(),
            distribution: Distribution::FreeBSD,
            processor: "amd64".into(),
            zfs: crate::zfs::Zfs::new(),
            datasets,
        }
    }
}
