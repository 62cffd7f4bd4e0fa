//! Host detection and source dataset management
//!
//! Provides:
//! - OS version and distribution detection via uname(2)
//! - sysctl read/write access
//! - Activation and discovery of ioc source dataset trees

use crate::error::{Error, Result};
use crate::zfs::Zfs;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::process::Command;

/// ZFS user property marking a source root as active
pub const ACTIVE_PROPERTY: &str = "org.freebsd.ioc:active";

/// Default name of the source dataset under a pool
pub const DEFAULT_SOURCE_DATASET: &str = "ioc";

/// FreeBSD release type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseType {
    /// -CURRENT development branch
    Current,
    /// -STABLE maintenance branch
    Stable,
    /// -RELEASE official release
    Release,
    /// -RC release candidate
    Rc(u8),
    /// -BETA pre-release
    Beta(u8),
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseType::Current => write!(f, "CURRENT"),
            ReleaseType::Stable => write!(f, "STABLE"),
            ReleaseType::Release => write!(f, "RELEASE"),
            ReleaseType::Rc(n) => write!(f, "RC{}", n),
            ReleaseType::Beta(n) => write!(f, "BETA{}", n),
        }
    }
}

/// Host OS version information
#[derive(Debug, Clone)]
pub struct OsVersion {
    /// Major version number
    pub major: u8,
    /// Minor version number
    pub minor: u8,
    /// Patch level (from -pX suffix)
    pub patch: Option<u8>,
    /// Release type (CURRENT, STABLE, RELEASE, ...)
    pub release_type: ReleaseType,
}

impl OsVersion {
    /// Detect the kernel version via the native uname(2) syscall
    pub fn detect_kernel() -> Result<Self> {
        let release = uname_field(UnameField::Release)?;
        Self::parse(release.trim_end_matches("-HBSD"))
    }

    /// Detect the userland version via freebsd-version(1)
    ///
    /// The userland may run a newer patch level than the booted kernel.
    pub fn detect_userland() -> Result<Self> {
        let output = Command::new("/bin/freebsd-version")
            .arg("-u")
            .output()
            .map_err(|_| Error::HostUserlandVersionUnknown)?;

        if !output.status.success() {
            return Err(Error::HostUserlandVersionUnknown);
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Self::parse(version.trim_end_matches("-HBSD")).map_err(|_| Error::HostUserlandVersionUnknown)
    }

    /// Parse a version string such as `13.2-RELEASE-p4` or `15.0-CURRENT`
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('-').collect();

        if parts.len() < 2 {
            return Err(Error::HostReleaseUnknown);
        }

        let version_nums: Vec<&str> = parts[0].split('.').collect();
        if version_nums.len() != 2 {
            return Err(Error::HostReleaseUnknown);
        }

        let major = version_nums[0]
            .parse::<u8>()
            .map_err(|_| Error::HostReleaseUnknown)?;
        let minor = version_nums[1]
            .parse::<u8>()
            .map_err(|_| Error::HostReleaseUnknown)?;

        let release_type = match parts[1] {
            "CURRENT" => ReleaseType::Current,
            "STABLE" => ReleaseType::Stable,
            "RELEASE" => ReleaseType::Release,
            s if s.starts_with("RC") => {
                let num = s.strip_prefix("RC").and_then(|n| n.parse::<u8>().ok());
                ReleaseType::Rc(num.unwrap_or(1))
            }
            s if s.starts_with("BETA") => {
                let num = s.strip_prefix("BETA").and_then(|n| n.parse::<u8>().ok());
                ReleaseType::Beta(num.unwrap_or(1))
            }
            _ => return Err(Error::HostReleaseUnknown),
        };

        let patch = if parts.len() > 2 && parts[2].starts_with('p') {
            parts[2].strip_prefix('p').and_then(|n| n.parse::<u8>().ok())
        } else {
            None
        };

        Ok(OsVersion {
            major,
            minor,
            patch,
            release_type,
        })
    }

    /// The base release name without patch level, e.g. `13.2-RELEASE`
    pub fn release_name(&self) -> String {
        format!("{}.{}-{}", self.major, self.minor, self.release_type)
    }

    /// jls supports libxo JSON output from FreeBSD 11 on
    pub fn supports_libxo(&self) -> bool {
        self.major >= 11
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}-{}", self.major, self.minor, self.release_type)?;
        if let Some(patch) = self.patch {
            write!(f, "-p{}", patch)?;
        }
        Ok(())
    }
}

enum UnameField {
    Release,
    Machine,
}

fn uname_field(field: UnameField) -> Result<String> {
    let mut utsname: libc::utsname = unsafe { std::mem::zeroed() };

    let result = unsafe { libc::uname(&mut utsname) };
    if result != 0 {
        return Err(Error::HostReleaseUnknown);
    }

    let ptr = match field {
        UnameField::Release => utsname.release.as_ptr(),
        UnameField::Machine => utsname.machine.as_ptr(),
    };
    let value = unsafe { CStr::from_ptr(ptr) };
    value
        .to_str()
        .map(String::from)
        .map_err(|_| Error::HostReleaseUnknown)
}

/// The BSD distribution running on the host
///
/// Parameterises mirror layout, asset hash file, basedir list and updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    FreeBSD,
    HardenedBSD,
}

impl Distribution {
    /// Detect from the kernel release string (HardenedBSD appends `-HBSD`)
    pub fn detect() -> Result<Self> {
        let release = uname_field(UnameField::Release)?;
        if release.ends_with("-HBSD") {
            Ok(Distribution::HardenedBSD)
        } else {
            Ok(Distribution::FreeBSD)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Distribution::FreeBSD => "FreeBSD",
            Distribution::HardenedBSD => "HardenedBSD",
        }
    }

    /// Base mirror URL for release assets
    pub fn mirror_url(&self, processor: &str) -> String {
        match self {
            Distribution::FreeBSD => format!(
                "https://download.freebsd.org/ftp/releases/{}/{}",
                processor, processor
            ),
            Distribution::HardenedBSD => {
                "https://installers.hardenedbsd.org/pub/builds".to_string()
            }
        }
    }

    /// Name of the asset hash manifest on the mirror
    pub fn hash_file(&self) -> &'static str {
        match self {
            Distribution::FreeBSD => "MANIFEST",
            Distribution::HardenedBSD => "CHECKSUMS.SHA256",
        }
    }

    /// System directories shared by basejails
    ///
    /// HardenedBSD ships no 32bit compat libraries.
    pub fn basedirs(&self) -> Vec<&'static str> {
        let mut dirs = vec![
            "bin",
            "boot",
            "lib",
            "libexec",
            "rescue",
            "sbin",
            "usr/bin",
            "usr/include",
            "usr/lib",
            "usr/libexec",
            "usr/sbin",
            "usr/share",
            "usr/libdata",
        ];
        if *self == Distribution::FreeBSD {
            dirs.push("usr/lib32");
        }
        dirs
    }

    /// URL of a file in the release source trunk
    ///
    /// FreeBSD serves release branches from SVN, HardenedBSD from GitHub raw.
    pub fn release_trunk_file_url(&self, release_name: &str, filename: &str) -> String {
        match self {
            Distribution::FreeBSD => {
                let major = release_name.split('-').next().unwrap_or(release_name);
                let branch = major.split('.').next().unwrap_or(major);
                format!(
                    "https://svnweb.freebsd.org/base/release/{}.0/{}?view=co",
                    branch, filename
                )
            }
            Distribution::HardenedBSD => {
                let branch = format!(
                    "hardened/{}-stable/master",
                    release_name.split('-').next().unwrap_or(release_name)
                );
                format!(
                    "https://raw.githubusercontent.com/HardenedBSD/hardenedBSD/{}/{}",
                    branch, filename
                )
            }
        }
    }
}

/// Read a sysctl string value
pub fn sysctl_get_string(name: &str) -> Result<String> {
    let cname = CString::new(name).map_err(|_| Error::Sysctl {
        name: name.to_string(),
        reason: "invalid name".into(),
    })?;
    let mut len: libc::size_t = 0;

    let rc = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            std::ptr::null_mut(),
            &mut len,
            std::ptr::null(),
            0,
        )
    };
    if rc != 0 {
        return Err(Error::Sysctl {
            name: name.to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    let mut buf = vec![0u8; len];
    let rc = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
            std::ptr::null(),
            0,
        )
    };
    if rc != 0 {
        return Err(Error::Sysctl {
            name: name.to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    buf.truncate(len);
    while buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| Error::Sysctl {
        name: name.to_string(),
        reason: "invalid UTF-8".into(),
    })
}

/// Read a sysctl integer value
pub fn sysctl_get_i32(name: &str) -> Result<i32> {
    let cname = CString::new(name).map_err(|_| Error::Sysctl {
        name: name.to_string(),
        reason: "invalid name".into(),
    })?;
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::size_t;

    let rc = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
            std::ptr::null(),
            0,
        )
    };
    if rc != 0 {
        return Err(Error::Sysctl {
            name: name.to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(value)
}

/// Write a sysctl integer value
pub fn sysctl_set_i32(name: &str, value: i32) -> Result<()> {
    let cname = CString::new(name).map_err(|_| Error::Sysctl {
        name: name.to_string(),
        reason: "invalid name".into(),
    })?;
    let val: libc::c_int = value;

    let rc = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::size_t,
        )
    };
    if rc != 0 {
        return Err(Error::Sysctl {
            name: name.to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// The dataset tree of one activated source root
#[derive(Debug, Clone)]
pub struct RootDatasets {
    /// Full name of the source root dataset (e.g. `zroot/ioc`)
    pub root: String,
}

impl RootDatasets {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn jails(&self) -> String {
        format!("{}/jails", self.root)
    }

    pub fn releases(&self) -> String {
        format!("{}/releases", self.root)
    }

    pub fn base(&self) -> String {
        format!("{}/base", self.root)
    }

    pub fn pkg(&self) -> String {
        format!("{}/pkg", self.root)
    }

    pub fn logs(&self) -> String {
        format!("{}/logs", self.root)
    }

    /// Dataset of a jail by id
    pub fn jail_dataset(&self, id: &str) -> String {
        format!("{}/jails/{}", self.root, id)
    }

    /// Dataset of a release by name
    pub fn release_dataset(&self, name: &str) -> String {
        format!("{}/releases/{}", self.root, name)
    }
}

/// Mapping from source name to its root dataset tree
///
/// Exactly one source is *main* (carries the active user property). When
/// more than one source is attached, resource names are printed as
/// `<source>/<id>`.
#[derive(Debug, Clone, Default)]
pub struct Datasets {
    sources: BTreeMap<String, RootDatasets>,
    main: Option<String>,
}

impl Datasets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover activated source roots across all imported pools
    pub fn discover(zfs: &Zfs) -> Result<Self> {
        let mut datasets = Self::new();
        for pool in zfs.pools()? {
            let root = format!("{}/{}", pool, DEFAULT_SOURCE_DATASET);
            if !zfs.dataset_exists(&root) {
                continue;
            }
            if zfs.get_property(&root, ACTIVE_PROPERTY)?.as_deref() == Some("yes") {
                datasets.attach(&pool, RootDatasets::new(&root))?;
            }
        }
        Ok(datasets)
    }

    /// Attach a source root under a name
    pub fn attach(&mut self, name: &str, root: RootDatasets) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::InvalidSourceName(name.to_string()));
        }
        if self.main.is_none() {
            self.main = Some(name.to_string());
        }
        self.sources.insert(name.to_string(), root);
        Ok(())
    }

    /// The main source root
    pub fn main_root(&self) -> Result<&RootDatasets> {
        let name = self.main.as_ref().ok_or(Error::NotActivated)?;
        self.sources.get(name).ok_or(Error::NotActivated)
    }

    /// Look up a source by name
    pub fn source(&self, name: &str) -> Result<&RootDatasets> {
        self.sources
            .get(name)
            .ok_or_else(|| Error::SourceNotFound(name.to_string()))
    }

    /// All attached sources in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RootDatasets)> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Render a resource name: `<source>/<id>` iff several sources exist
    pub fn full_name(&self, source: &str, id: &str) -> String {
        if self.sources.len() > 1 {
            format!("{}/{}", source, id)
        } else {
            id.to_string()
        }
    }
}

/// Host context handed to every library operation
///
/// Entities (jails, releases) store identifiers only and borrow this
/// context when acting.
pub struct Host {
    pub os_version: OsVersion,
    pub distribution: Distribution,
    pub processor: String,
    pub zfs: Zfs,
    pub datasets: Datasets,
}

impl Host {
    /// Detect host facts and discover activated sources
    pub fn new() -> Result<Self> {
        let zfs = Zfs::new();
        let datasets = Datasets::discover(&zfs)?;
        Ok(Self {
            os_version: OsVersion::detect_kernel()?,
            distribution: Distribution::detect()?,
            processor: uname_field(UnameField::Machine)?,
            zfs,
            datasets,
        })
    }

    /// Activate a pool as an ioc source: create the root dataset tree and
    /// mark it active
    pub fn activate(&mut self, pool: &str) -> Result<()> {
        self.zfs
            .pool_available(pool)
            .map_err(|e| Error::ActivationFailed {
                pool: pool.to_string(),
                reason: e.to_string(),
            })?;

        let root = RootDatasets::new(format!("{}/{}", pool, DEFAULT_SOURCE_DATASET));
        self.zfs.ensure_dataset(&root.root)?;
        for child in [
            root.jails(),
            root.releases(),
            root.base(),
            root.pkg(),
            root.logs(),
        ] {
            self.zfs.ensure_dataset(&child)?;
        }
        self.zfs.set_property(&root.root, ACTIVE_PROPERTY, "yes")?;
        self.datasets.attach(pool, root)?;
        Ok(())
    }

    /// Clear the active mark from a pool's source root
    pub fn deactivate(&mut self, pool: &str) -> Result<()> {
        let root = format!("{}/{}", pool, DEFAULT_SOURCE_DATASET);
        if self.zfs.dataset_exists(&root) {
            self.zfs.set_property(&root, ACTIVE_PROPERTY, "no")?;
        }
        Ok(())
    }

    /// Sysctl values the secure VNET firewall requires to be 1
    pub fn firewall_sysctls() -> [&'static str; 3] {
        [
            "net.inet.ip.fw.enable",
            "net.link.ether.ipfw",
            "net.link.bridge.ipfw",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        let ver = OsVersion::parse("13.2-RELEASE").unwrap();
        assert_eq!(ver.major, 13);
        assert_eq!(ver.minor, 2);
        assert_eq!(ver.patch, None);
        assert_eq!(ver.release_type, ReleaseType::Release);
    }

    #[test]
    fn test_parse_release_with_patch() {
        let ver = OsVersion::parse("12.1-RELEASE-p4").unwrap();
        assert_eq!(ver.patch, Some(4));
        assert_eq!(ver.to_string(), "12.1-RELEASE-p4");
        assert_eq!(ver.release_name(), "12.1-RELEASE");
    }

    #[test]
    fn test_parse_current_and_stable() {
        assert_eq!(
            OsVersion::parse("15.0-CURRENT").unwrap().release_type,
            ReleaseType::Current
        );
        assert_eq!(
            OsVersion::parse("14.2-STABLE").unwrap().release_type,
            ReleaseType::Stable
        );
    }

    #[test]
    fn test_parse_hardened_release() {
        // Caller strips the -HBSD suffix before parsing
        let ver = OsVersion::parse("12.1-RELEASE-p4-HBSD".trim_end_matches("-HBSD")).unwrap();
        assert_eq!(ver.patch, Some(4));
    }

    #[test]
    fn test_basedirs_lib32() {
        assert!(Distribution::FreeBSD.basedirs().contains(&"usr/lib32"));
        assert!(!Distribution::HardenedBSD.basedirs().contains(&"usr/lib32"));
    }

    #[test]
    fn test_mirror_urls() {
        let url = Distribution::FreeBSD.mirror_url("amd64");
        assert!(url.contains("/amd64/amd64"));
        assert!(Distribution::HardenedBSD
            .mirror_url("amd64")
            .contains("hardenedbsd"));
    }

    #[test]
    fn test_trunk_urls() {
        let url = Distribution::FreeBSD.release_trunk_file_url("12.1-RELEASE", "usr.sbin/freebsd-update/freebsd-update.sh");
        assert!(url.starts_with("https://svnweb.freebsd.org/base/release/12.0/"));
        assert!(url.ends_with("?view=co"));

        let url = Distribution::HardenedBSD.release_trunk_file_url("12-STABLE", "hbsd-update");
        assert!(url.contains("raw.githubusercontent.com/HardenedBSD"));
    }

    #[test]
    fn test_full_name_single_and_multi_source() {
        let mut datasets = Datasets::new();
        datasets
            .attach("zroot", RootDatasets::new("zroot/ioc"))
            .unwrap();
        assert_eq!(datasets.full_name("zroot", "web01"), "web01");

        datasets
            .attach("tank", RootDatasets::new("tank/ioc"))
            .unwrap();
        assert_eq!(datasets.full_name("zroot", "web01"), "zroot/web01");
    }

    #[test]
    fn test_root_datasets_paths() {
        let root = RootDatasets::new("zroot/ioc");
        assert_eq!(root.jails(), "zroot/ioc/jails");
        assert_eq!(root.release_dataset("13.2-RELEASE"), "zroot/ioc/releases/13.2-RELEASE");
        assert_eq!(root.jail_dataset("web01"), "zroot/ioc/jails/web01");
    }

    #[test]
    fn test_invalid_source_name() {
        let mut datasets = Datasets::new();
        assert!(datasets
            .attach("bad name", RootDatasets::new("zroot/ioc"))
            .is_err());
    }
}
