//! Release management
//!
//! A release is a distribution snapshot (e.g. `13.2-RELEASE`) living as a
//! dataset pair under `releases/` with per-patchlevel snapshots `@pN` of
//! its root. Fetch downloads the assets from the distribution mirror,
//! verifies them against the hash manifest, extracts them with the member
//! checks and applies quiet defaults to the fresh root. Updates run inside
//! a throwaway jail and end in a new patchlevel snapshot.

pub mod fetch;
pub mod updater;

use crate::config::ucl;
use crate::error::{Error, Result};
use crate::events::{EventType, Scope};
use crate::host::Host;
use crate::paths::require_no_symlink;
use crate::rcconf::RcConf;
use crate::release::fetch::RetryConfig;
use crate::securetar::{self, Compression};
use crate::zfs::SnapshotId;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

/// rc.conf defaults written into a freshly extracted release
const DEFAULT_RC_CONF: &[(&str, &str)] = &[
    ("netif_enable", "NO"),
    ("sendmail_enable", "NO"),
    ("sendmail_submit_enable", "NO"),
    ("sendmail_msp_queue_enable", "NO"),
    ("sendmail_outbound_enable", "NO"),
    ("cron_flags", "-m ''"),
    ("syslogd_flags", "-ss"),
];

const DEFAULT_PERIODIC_CONF: &[(&str, &str)] = &[
    ("daily_clean_hoststat_enable", "NO"),
    ("daily_status_mail_rejects_enable", "NO"),
    ("daily_status_include_submit_mailq", "NO"),
    ("daily_submit_queuerun", "NO"),
];

const DEFAULT_SYSCTL_CONF: &[(&str, &str)] = &[("net.inet.ip.fw.enable", "0")];

/// What `Release::fetch` should do beyond download and extract
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Also download lib32 (FreeBSD only)
    pub fetch_lib32: bool,
    /// Pull the updater and fetch updates
    pub fetch_updates: bool,
    /// Apply fetched updates inside a throwaway jail
    pub apply_updates: bool,
    /// Sync the ZFS basejail mirror datasets afterwards
    pub update_base: bool,
}

/// A release reference, optionally pinned to a patch level
pub struct Release<'a> {
    pub host: &'a Host,
    /// Base name without patch level, e.g. `13.2-RELEASE`
    pub name: String,
    /// Explicit patch level from a `-pN` suffix
    pub patchlevel: Option<u32>,
}

impl<'a> Release<'a> {
    /// Parse a release reference such as `13.2-RELEASE` or
    /// `13.2-RELEASE-p4`
    pub fn new(host: &'a Host, reference: &str) -> Result<Self> {
        let (name, patchlevel) = split_patchlevel(reference);
        if name.is_empty() || name.contains('/') || name.contains(char::is_whitespace) {
            return Err(Error::UnsupportedRelease(reference.to_string()));
        }
        Ok(Self {
            host,
            name: name.to_string(),
            patchlevel,
        })
    }

    /// `<name>` or `<name>-p<N>` when pinned
    pub fn full_name(&self) -> String {
        match self.patchlevel {
            Some(patchlevel) => format!("{}-p{}", self.name, patchlevel),
            None => self.name.clone(),
        }
    }

    /// The asset name on the mirror (HardenedBSD decorates it)
    pub fn real_name(&self) -> String {
        match self.host.distribution {
            crate::host::Distribution::HardenedBSD => format!(
                "HardenedBSD-{}-{}-LATEST",
                self.name, self.host.processor
            ),
            crate::host::Distribution::FreeBSD => self.name.clone(),
        }
    }

    pub fn dataset(&self) -> Result<String> {
        Ok(self.host.datasets.main_root()?.release_dataset(&self.name))
    }

    pub fn root_dataset(&self) -> Result<String> {
        Ok(format!("{}/root", self.dataset()?))
    }

    pub fn updates_dataset(&self) -> Result<String> {
        Ok(format!("{}/updates", self.dataset()?))
    }

    /// `<source>/base/<name>`, the ZFS basejail mirror
    pub fn base_dataset(&self) -> Result<String> {
        Ok(format!(
            "{}/{}",
            self.host.datasets.main_root()?.base(),
            self.name
        ))
    }

    pub fn dataset_path(&self) -> Result<PathBuf> {
        self.host.zfs.mountpoint(&self.dataset()?)
    }

    pub fn root_path(&self) -> Result<PathBuf> {
        self.host.zfs.mountpoint(&self.root_dataset()?)
    }

    /// Mirror directory of this release
    pub fn remote_url(&self) -> String {
        format!(
            "{}/{}",
            self.host.distribution.mirror_url(&self.host.processor),
            self.real_name()
        )
    }

    /// Assets to download (`base`, optionally `lib32`)
    pub fn assets(&self, fetch_lib32: bool) -> Vec<&'static str> {
        let mut assets = vec!["base"];
        if fetch_lib32 && self.host.distribution == crate::host::Distribution::FreeBSD {
            assets.push("lib32");
        }
        assets
    }

    /// True when the release exists locally with an extracted root
    pub fn fetched(&self) -> bool {
        let Ok(root_dataset) = self.root_dataset() else {
            return false;
        };
        if !self.host.zfs.dataset_exists(&root_dataset) {
            return false;
        }
        let Ok(root_path) = self.host.zfs.mountpoint(&root_dataset) else {
            return false;
        };
        ["dev", "var", "etc"]
            .iter()
            .all(|dir| root_path.join(dir).is_dir())
    }

    /// Fetch the release from the mirror
    pub fn fetch(&self, scope: &mut Scope, options: &FetchOptions) -> Result<()> {
        let retry = RetryConfig::default();

        scope.run(
            EventType::ReleaseFetch,
            Some(self.name.clone()),
            |scope, event| {
                if self.fetched() {
                    log::info!("Release {} was already downloaded", self.name);
                } else {
                    self.fetch_assets(scope, options, &retry)?;
                }

                self.apply_default_configuration(scope)?;
                self.snapshot("p0", false)?;

                let mut apply = options.apply_updates;
                if options.fetch_updates {
                    let updater = updater::Updater::for_host(self.host, self);
                    if let Err(error) = updater.fetch(scope) {
                        log::warn!("Fetching updates failed: {}", error);
                        apply = false;
                    }
                    if apply {
                        updater.apply(scope)?;
                    }
                }

                if options.update_base {
                    self.update_base_release()?;
                }

                event.set_message("release ready");
                self.cleanup_assets(options)
            },
        )
    }

    fn fetch_assets(
        &self,
        scope: &mut Scope,
        options: &FetchOptions,
        retry: &RetryConfig,
    ) -> Result<()> {
        let dataset = self.dataset()?;
        self.host.zfs.ensure_dataset(&dataset)?;
        self.host.zfs.ensure_dataset(&self.root_dataset()?)?;
        self.host.zfs.mount(&dataset)?;

        let download_dir = self.dataset_path()?;
        let hashes = self.fetch_hashes(&download_dir, retry)?;

        for asset in self.assets(options.fetch_lib32) {
            let asset_path = download_dir.join(format!("{}.txz", asset));
            let url = format!("{}/{}.txz", self.remote_url(), asset);

            scope.run(
                EventType::ReleaseDownload,
                Some(format!("{}.txz", asset)),
                |_, _| {
                    let actual = if asset_path.is_file() {
                        fetch::sha256_file(&asset_path)?
                    } else {
                        fetch::download_file(&url, &asset_path, retry)?
                    };

                    let expected = hashes.get(asset).ok_or_else(|| {
                        Error::ReleaseAssetHashesUnavailable(self.name.clone())
                    })?;
                    if &actual != expected {
                        let _ = fs::remove_file(&asset_path);
                        return Err(Error::InvalidReleaseAssetSignature {
                            asset: format!("{}.txz", asset),
                            expected: expected.clone(),
                            actual,
                        });
                    }
                    Ok(())
                },
            )?;
        }

        let root_path = self.root_path()?;
        scope.run(
            EventType::ReleaseExtraction,
            Some(self.name.clone()),
            |_, _| {
                for asset in self.assets(options.fetch_lib32) {
                    let asset_path = download_dir.join(format!("{}.txz", asset));
                    securetar::extract(&asset_path, Compression::Xz, &root_path)?;
                }
                Ok(())
            },
        )
    }

    fn fetch_hashes(
        &self,
        download_dir: &PathBuf,
        retry: &RetryConfig,
    ) -> Result<std::collections::BTreeMap<String, String>> {
        let hash_file = self.host.distribution.hash_file();
        let local = download_dir.join(hash_file);
        if !local.is_file() {
            let url = format!("{}/{}", self.remote_url(), hash_file);
            fetch::download_file(&url, &local, retry)
                .map_err(|_| Error::ReleaseAssetHashesUnavailable(self.name.clone()))?;
        }
        let content = fs::read_to_string(&local)?;
        Ok(parse_hash_manifest(&content))
    }

    /// Quiet defaults: no sendmail, no syslog network, firewall off
    fn apply_default_configuration(&self, scope: &mut Scope) -> Result<()> {
        let root_path = self.root_path()?;
        scope.run(
            EventType::ReleaseConfiguration,
            Some(self.name.clone()),
            |_, _| {
                let mut rc_conf = RcConf::load(root_path.join("etc/rc.conf"))?;
                for (key, value) in DEFAULT_RC_CONF {
                    rc_conf.set(key, value);
                }
                rc_conf.save()?;

                let mut periodic = RcConf::load(root_path.join("etc/periodic.conf"))?;
                for (key, value) in DEFAULT_PERIODIC_CONF {
                    periodic.set(key, value);
                }
                periodic.save()?;

                write_sysctl_conf(&root_path.join("etc/sysctl.conf"), DEFAULT_SYSCTL_CONF)
            },
        )
    }

    fn cleanup_assets(&self, options: &FetchOptions) -> Result<()> {
        let download_dir = self.dataset_path()?;
        for asset in self.assets(options.fetch_lib32) {
            let path = download_dir.join(format!("{}.txz", asset));
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    // Patchlevel snapshots

    /// Take a snapshot of the release root, reusing an existing one unless
    /// forced
    pub fn snapshot(&self, identifier: &str, force: bool) -> Result<()> {
        let root_dataset = self.root_dataset()?;
        if self.host.zfs.snapshot_exists(&root_dataset, identifier) {
            if !force {
                log::debug!("Re-using release snapshot {}@{}", self.name, identifier);
                return Ok(());
            }
            self.host
                .zfs
                .destroy_snapshot(&root_dataset, identifier, false)?;
        }
        self.host.zfs.snapshot(&root_dataset, identifier, false)
    }

    /// Patch levels with snapshots, newest first
    pub fn version_snapshots(&self) -> Result<Vec<u32>> {
        let root_dataset = self.root_dataset()?;
        let mut versions: Vec<u32> = self
            .host
            .zfs
            .list_snapshots(&root_dataset)?
            .iter()
            .filter_map(|name| parse_patchlevel_snapshot(name))
            .collect();
        versions.sort_unstable();
        versions.reverse();
        Ok(versions)
    }

    /// The newest patchlevel snapshot, creating `p0` when none exist
    pub fn latest_snapshot(&self) -> Result<SnapshotId> {
        let versions = self.version_snapshots()?;
        let name = match versions.first() {
            Some(patchlevel) => format!("p{}", patchlevel),
            None => {
                log::info!("No release snapshot found - creating @p0");
                self.snapshot("p0", false)?;
                "p0".to_string()
            }
        };
        Ok(SnapshotId {
            dataset: self.root_dataset()?,
            name,
        })
    }

    /// The snapshot selected by the explicit patch level, or the latest
    pub fn current_snapshot(&self) -> Result<SnapshotId> {
        if let Some(patchlevel) = self.patchlevel {
            let name = format!("p{}", patchlevel);
            if self
                .host
                .zfs
                .snapshot_exists(&self.root_dataset()?, &name)
            {
                return Ok(SnapshotId {
                    dataset: self.root_dataset()?,
                    name,
                });
            }
        }
        self.latest_snapshot()
    }

    pub fn current_snapshot_patchlevel(&self) -> Result<u32> {
        let snapshot = self.current_snapshot()?;
        parse_patchlevel_snapshot(&snapshot.name)
            .ok_or_else(|| Error::SnapshotNotFound(snapshot.full_name()))
    }

    /// True if this release is newer than the host's
    pub fn newer_than_host(&self) -> bool {
        release_newer_than(&self.name, &self.host.os_version.release_name())
    }

    /// The HardenedBSD release branch, read from the extracted root
    pub fn hbsd_release_branch(&self) -> Result<String> {
        if !self.fetched() {
            return Err(Error::ReleaseNotFetched(self.name.clone()));
        }
        let source = self.root_path()?.join("etc/hbsd-update.conf");
        require_no_symlink(&source)?;
        let content = fs::read_to_string(&source)?;
        ucl::parse(&content)?
            .get("branch")
            .cloned()
            .ok_or_else(|| Error::UpdateFailure {
                subject: self.name.clone(),
                reason: "no branch in hbsd-update.conf".into(),
            })
    }

    /// Sync the ZFS basejail mirror datasets from the release root
    pub fn update_base_release(&self) -> Result<()> {
        let base_dataset = self.base_dataset()?;
        self.host.zfs.ensure_dataset(&base_dataset)?;
        for basedir in self.host.distribution.basedirs() {
            self.host
                .zfs
                .ensure_dataset(&format!("{}/{}", base_dataset, basedir))?;
        }

        let source = format!("{}/", self.root_path()?.to_string_lossy());
        let target = self.host.zfs.mountpoint(&base_dataset)?;
        let status = Command::new("rsync")
            .args(["-a", "--delete", &source])
            .arg(&target)
            .status()
            .map_err(|e| Error::CommandFailure {
                command: "rsync".into(),
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(Error::CommandFailure {
                command: "rsync".into(),
                message: format!("base sync of '{}' failed", self.name),
            });
        }
        log::debug!("Base release '{}' updated", self.name);
        Ok(())
    }

    /// Delete the release dataset subtree
    pub fn destroy(&self, scope: &mut Scope) -> Result<()> {
        let dataset = self.dataset()?;
        scope.run(EventType::ZfsDatasetDestroy, Some(dataset.clone()), |_, _| {
            self.host.zfs.destroy_recursive(&dataset)
        })
    }
}

/// Split a `-pN` suffix off a release reference
fn split_patchlevel(reference: &str) -> (&str, Option<u32>) {
    if let Some(index) = reference.rfind("-p") {
        let (name, suffix) = reference.split_at(index);
        if let Ok(patchlevel) = suffix[2..].parse::<u32>() {
            return (name, Some(patchlevel));
        }
    }
    (reference, None)
}

/// Extract `N` from a snapshot named `pN`
fn parse_patchlevel_snapshot(name: &str) -> Option<u32> {
    name.strip_prefix('p')?.parse().ok()
}

/// Compare release names, padding the major version to four digits
///
/// `CURRENT` is newer than any non-CURRENT release.
pub fn release_newer_than(release: &str, host_release: &str) -> bool {
    let release = pad_release_name(release);
    let host_release = pad_release_name(host_release);

    let release_is_current = release.contains("CURRENT");
    let host_is_current = host_release.contains("CURRENT");

    if release_is_current {
        return !host_is_current;
    }
    if host_is_current {
        return false;
    }

    let cropped: String = release.chars().take(host_release.chars().count()).collect();
    host_release < cropped
}

fn pad_release_name(name: &str) -> String {
    let major = name.split('-').next().unwrap_or(name);
    let major_digits = major.split('.').next().unwrap_or(major);
    if major_digits.parse::<u32>().is_ok() {
        let padding = "0".repeat(4usize.saturating_sub(major_digits.len()));
        format!("{}{}", padding, name)
    } else {
        name.to_string()
    }
}

/// Parse a hash manifest (FreeBSD MANIFEST or HardenedBSD CHECKSUMS)
///
/// Any whitespace separated token of 64 hex chars pairs with the `*.txz`
/// asset named on the same line.
pub fn parse_hash_manifest(content: &str) -> std::collections::BTreeMap<String, String> {
    let mut hashes = std::collections::BTreeMap::new();
    for line in content.lines() {
        let mut fingerprint: Option<String> = None;
        let mut asset: Option<String> = None;
        for token in line.split_whitespace() {
            let token = token.trim_matches(['(', ')']);
            if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
                fingerprint = Some(token.to_ascii_lowercase());
            } else if let Some(name) = token.strip_suffix(".txz") {
                asset = Some(name.to_string());
            }
        }
        if let (Some(asset), Some(fingerprint)) = (asset, fingerprint) {
            hashes.insert(asset, fingerprint);
        }
    }
    hashes
}

/// Write key=value defaults into a sysctl.conf style file, keeping
/// existing unrelated lines
fn write_sysctl_conf(path: &PathBuf, defaults: &[(&str, &str)]) -> Result<()> {
    let mut lines: Vec<String> = if path.is_file() {
        fs::read_to_string(path)?
            .lines()
            .map(String::from)
            .collect()
    } else {
        Vec::new()
    };

    for (key, value) in defaults {
        let rendered = format!("{}={}", key, value);
        match lines
            .iter_mut()
            .find(|line| line.split('=').next().map(str::trim) == Some(*key))
        {
            Some(line) => *line = rendered,
            None => lines.push(rendered),
        }
    }

    lines.push(String::new());
    fs::write(path, lines.join("\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_patchlevel() {
        assert_eq!(split_patchlevel("13.2-RELEASE"), ("13.2-RELEASE", None));
        assert_eq!(
            split_patchlevel("13.2-RELEASE-p4"),
            ("13.2-RELEASE", Some(4))
        );
        // trailing non-numeric suffix is part of the name
        assert_eq!(split_patchlevel("12-STABLE-pre"), ("12-STABLE-pre", None));
    }

    #[test]
    fn test_parse_patchlevel_snapshot() {
        assert_eq!(parse_patchlevel_snapshot("p0"), Some(0));
        assert_eq!(parse_patchlevel_snapshot("p12"), Some(12));
        assert_eq!(parse_patchlevel_snapshot("backup-123"), None);
        assert_eq!(parse_patchlevel_snapshot("px"), None);
    }

    #[test]
    fn test_release_comparison_pads_major() {
        // without padding "9.3" would sort above "12.1"
        assert!(release_newer_than("12.1-RELEASE", "9.3-RELEASE"));
        assert!(!release_newer_than("9.3-RELEASE", "12.1-RELEASE"));
        assert!(release_newer_than("13.0-RELEASE", "12.1-RELEASE"));
        assert!(!release_newer_than("12.1-RELEASE", "12.1-RELEASE"));
    }

    #[test]
    fn test_current_is_always_newer() {
        assert!(release_newer_than("14.0-CURRENT", "13.2-RELEASE"));
        assert!(!release_newer_than("13.2-RELEASE", "14.0-CURRENT"));
        assert!(!release_newer_than("14.0-CURRENT", "14.0-CURRENT"));
    }

    #[test]
    fn test_parse_hash_manifest_freebsd_style() {
        let manifest = "base.txz\t8d0f3e1ab2bbb355c611ba6a977df65e6407a7a6b6d344e2c5efe22ce05d9a87\t26492\tbase\t\"Base system\"\ton\n";
        let hashes = parse_hash_manifest(manifest);
        assert_eq!(
            hashes["base"],
            "8d0f3e1ab2bbb355c611ba6a977df65e6407a7a6b6d344e2c5efe22ce05d9a87"
        );
    }

    #[test]
    fn test_parse_hash_manifest_checksum_style() {
        let manifest =
            "SHA256 (base.txz) = 8d0f3e1ab2bbb355c611ba6a977df65e6407a7a6b6d344e2c5efe22ce05d9a87\n";
        let hashes = parse_hash_manifest(manifest);
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains_key("base"));
    }

    #[test]
    fn test_write_sysctl_conf_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysctl.conf");
        fs::write(&path, "kern.maxfiles=100000\nnet.inet.ip.fw.enable=1\n").unwrap();

        write_sysctl_conf(&path, DEFAULT_SYSCTL_CONF).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("kern.maxfiles=100000"));
        assert!(content.contains("net.inet.ip.fw.enable=0"));
        assert!(!content.contains("net.inet.ip.fw.enable=1"));
    }
}
