//! Jail fstab file management
//!
//! Owns a jail's `fstab`: parsing, editing and rendering the six-field
//! lines, plus the auto-generated block of basejail and maintenance
//! mounts. Auto lines carry the comment `iocage-auto` and are regenerated
//! on every render; their previous position is preserved through a single
//! placeholder collapsed out of the parsed file.

use crate::error::{Error, Result};
use crate::paths::require_no_symlink;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Comment identifying auto-generated lines
pub const AUTO_COMMENT_IDENTIFIER: &str = "iocage-auto";

const BACKUP_PREFIX: &str = "backup:///";

/// A mount entry of six whitespace separated fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLine {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub fs_type: String,
    pub options: String,
    pub dump: String,
    pub passnum: String,
    pub comment: Option<String>,
}

fn escape_field(value: &str) -> String {
    value.replace(' ', "\\ ")
}

impl fmt::Display for MountLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            escape_field(&self.source.to_string_lossy()),
            escape_field(&self.destination.to_string_lossy()),
            self.fs_type,
            self.options,
            self.dump,
            self.passnum
        )?;
        if let Some(comment) = &self.comment {
            write!(f, " # {}", comment)?;
        }
        Ok(())
    }
}

/// A stored line of the fstab file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FstabLine {
    Mount(MountLine),
    /// A raw comment or blank line, kept verbatim
    Comment(String),
    /// Marks where the auto-generated block is rendered
    AutoPlaceholder,
}

/// A line produced by iteration, including the synthetic auto block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FstabEntry {
    Mount(MountLine),
    Comment(String),
    /// Release basedir NullFS-mounted read-only into the jail root
    Basejail(MountLine),
    /// The launch-scripts directory mounted at `<root>/.iocage`
    Maintenance(MountLine),
}

impl FstabEntry {
    pub fn destination(&self) -> Option<&Path> {
        match self {
            FstabEntry::Mount(line)
            | FstabEntry::Basejail(line)
            | FstabEntry::Maintenance(line) => Some(&line.destination),
            FstabEntry::Comment(_) => None,
        }
    }

    fn is_synthetic(&self) -> bool {
        matches!(self, FstabEntry::Basejail(_) | FstabEntry::Maintenance(_))
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FstabEntry::Mount(line) => write!(f, "{}", line),
            FstabEntry::Basejail(line) | FstabEntry::Maintenance(line) => write!(f, "{}", line),
            FstabEntry::Comment(text) => write!(f, "{}", text),
        }
    }
}

/// Where basejail lines mount from: the release snapshot directory
#[derive(Debug, Clone)]
pub struct BasejailSource {
    /// `<release root mountpoint>/.zfs/snapshot/<name>`
    pub snapshot_root: PathBuf,
    pub basedirs: Vec<String>,
}

/// A jail's fstab file
#[derive(Debug, Clone)]
pub struct Fstab {
    path: PathBuf,
    lines: Vec<FstabLine>,
    /// Mountpoint of the jail dataset (backup prefix rewrite target)
    jail_dir: PathBuf,
    /// Mountpoint of the jail's root dataset
    root_path: PathBuf,
    /// Directory holding the generated hook scripts
    launch_script_dir: PathBuf,
    /// Set for NullFS basejails; enables the synthetic basejail block
    basejail_source: Option<BasejailSource>,
}

impl Fstab {
    pub fn new(jail_dir: impl Into<PathBuf>) -> Self {
        let jail_dir = jail_dir.into();
        Self {
            path: jail_dir.join("fstab"),
            lines: Vec::new(),
            root_path: jail_dir.join("root"),
            launch_script_dir: jail_dir.join("launch-scripts"),
            jail_dir,
            basejail_source: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_basejail_source(&mut self, source: Option<BasejailSource>) {
        self.basejail_source = source;
    }

    /// Read and parse the fstab file; a missing file yields no lines
    pub fn read_file(&mut self) -> Result<()> {
        if self.path.is_file() {
            let content = fs::read_to_string(&self.path)?;
            self.parse(&content)?;
        } else {
            self.lines.clear();
        }
        Ok(())
    }

    /// Write the rendered fstab back to disk
    pub fn save(&self) -> Result<()> {
        fs::write(&self.path, self.render())?;
        Ok(())
    }

    /// Parse fstab text
    ///
    /// Auto-generated entries (`# iocage-auto`) collapse into a single
    /// placeholder at their first position and are dropped everywhere
    /// else; `backup:///` prefixes are rewritten to the jail directory.
    pub fn parse(&mut self, input: &str) -> Result<()> {
        self.lines.clear();
        let mut auto_comment_found = false;

        for raw_line in input.lines() {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                self.lines.push(FstabLine::Comment(raw_line.to_string()));
                continue;
            }

            let (body, comment) = match raw_line.split_once('#') {
                Some((body, comment)) => {
                    let comment = comment.trim_matches(['#', ' ']).to_string();
                    (body, if comment.is_empty() { None } else { Some(comment) })
                }
                None => (raw_line, None),
            };

            if comment.as_deref() == Some(AUTO_COMMENT_IDENTIFIER) {
                if !auto_comment_found {
                    auto_comment_found = true;
                    self.lines.push(FstabLine::AutoPlaceholder);
                }
                continue;
            }

            let fields = split_fields(body);
            if fields.len() != 6 {
                log::warn!(
                    "Invalid line in fstab file {} - skipping line",
                    self.path.display()
                );
                continue;
            }

            let source = self.rewrite_backup_prefix(&fields[0]);
            let destination = self.rewrite_backup_prefix(&fields[1]);

            let line = MountLine {
                source: PathBuf::from(source),
                destination: PathBuf::from(destination),
                fs_type: fields[2].clone(),
                options: fields[3].clone(),
                dump: fields[4].clone(),
                passnum: fields[5].clone(),
                comment,
            };

            // tolerate re-reads of files written with expanded auto lines
            if self.add_mount_line(line, AddMode::SkipExisting, false).is_err() {
                continue;
            }
        }

        Ok(())
    }

    fn rewrite_backup_prefix(&self, value: &str) -> String {
        match value.strip_prefix(BACKUP_PREFIX) {
            Some(rest) => format!("{}/{}", self.jail_dir.to_string_lossy(), rest),
            None => value.to_string(),
        }
    }

    /// The synthetic basejail block for NullFS basejails
    fn basejail_lines(&self) -> Vec<MountLine> {
        let Some(source) = &self.basejail_source else {
            return Vec::new();
        };

        source
            .basedirs
            .iter()
            .map(|basedir| MountLine {
                source: source.snapshot_root.join(basedir),
                destination: self.root_path.join(basedir),
                fs_type: "nullfs".to_string(),
                options: "ro".to_string(),
                dump: "0".to_string(),
                passnum: "0".to_string(),
                comment: Some(AUTO_COMMENT_IDENTIFIER.to_string()),
            })
            .collect()
    }

    /// The launch-scripts maintenance mount, present on every jail
    fn maintenance_line(&self) -> MountLine {
        MountLine {
            source: self.launch_script_dir.clone(),
            destination: self.root_path.join(".iocage"),
            fs_type: "nullfs".to_string(),
            options: "ro".to_string(),
            dump: "0".to_string(),
            passnum: "0".to_string(),
            comment: Some(AUTO_COMMENT_IDENTIFIER.to_string()),
        }
    }

    /// All lines including the auto block, placeholder expanded in place
    /// (or leading when no placeholder was kept)
    pub fn entries(&self) -> Vec<FstabEntry> {
        let mut output = Vec::new();
        let mut auto_added = false;

        for line in &self.lines {
            match line {
                FstabLine::AutoPlaceholder => {
                    if !auto_added {
                        auto_added = true;
                        output.extend(self.auto_entries());
                    }
                }
                FstabLine::Mount(mount) => output.push(FstabEntry::Mount(mount.clone())),
                FstabLine::Comment(text) => output.push(FstabEntry::Comment(text.clone())),
            }
        }

        if !auto_added {
            let mut prefixed: Vec<FstabEntry> = self.auto_entries();
            prefixed.extend(output);
            output = prefixed;
        }

        output
    }

    fn auto_entries(&self) -> Vec<FstabEntry> {
        let mut entries: Vec<FstabEntry> = self
            .basejail_lines()
            .into_iter()
            .map(FstabEntry::Basejail)
            .collect();
        entries.push(FstabEntry::Maintenance(self.maintenance_line()));
        entries
    }

    /// Render the file content
    pub fn render(&self) -> String {
        let mut output: Vec<String> = self.entries().iter().map(|e| e.to_string()).collect();
        output.push(String::new());
        output.join("\n")
    }

    /// Number of user-visible lines (auto block included)
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn contains_destination(&self, destination: &Path) -> bool {
        self.entries()
            .iter()
            .any(|entry| entry.destination() == Some(destination))
    }

    fn add_mount_line(&mut self, mut line: MountLine, mode: AddMode, mount_now: bool) -> Result<()> {
        // destinations are always relative to the jail root
        if !line.destination.starts_with(&self.root_path) {
            let relative = line
                .destination
                .to_string_lossy()
                .trim_matches('/')
                .to_string();
            line.destination = self.root_path.join(relative);
        }

        if self.contains_destination(&line.destination) {
            match mode {
                AddMode::Replace => {
                    self.lines.retain(|existing| {
                        !matches!(existing, FstabLine::Mount(m) if m.destination == line.destination)
                    });
                }
                AddMode::SkipExisting => return Ok(()),
                AddMode::Strict => {
                    return Err(Error::FstabDestinationExists(line.destination));
                }
            }
        }

        require_no_symlink(&line.destination)?;

        if mount_now {
            mount(&line)?;
        }

        self.lines.push(FstabLine::Mount(line));
        Ok(())
    }

    /// Append a mount entry
    ///
    /// Relative destinations are prefixed with the jail root. With
    /// `auto_mount` (jail currently running), the entry is mounted
    /// immediately.
    pub fn add_line(&mut self, line: MountLine, replace: bool, auto_mount: bool) -> Result<()> {
        let mode = if replace {
            AddMode::Replace
        } else {
            AddMode::Strict
        };
        self.add_mount_line(line, mode, auto_mount)
    }

    /// Append a raw comment line
    pub fn add_comment(&mut self, text: impl Into<String>) {
        self.lines.push(FstabLine::Comment(text.into()));
    }

    fn real_index(&self, index: usize) -> Result<usize> {
        let entries = self.entries();
        let entry = entries
            .get(index)
            .ok_or(Error::VirtualFstabLineHasNoRealIndex(index))?;
        if entry.is_synthetic() {
            return Err(Error::VirtualFstabLineHasNoRealIndex(index));
        }

        self.lines
            .iter()
            .position(|line| match (line, entry) {
                (FstabLine::Mount(m), FstabEntry::Mount(e)) => m == e,
                (FstabLine::Comment(c), FstabEntry::Comment(e)) => c == e,
                _ => false,
            })
            .ok_or(Error::VirtualFstabLineHasNoRealIndex(index))
    }

    /// Remove the entry at a rendered index
    ///
    /// On a running jail the destination is forcibly unmounted. Synthetic
    /// lines cannot be removed.
    pub fn remove(&mut self, index: usize, running: bool) -> Result<()> {
        let entries = self.entries();
        let destination = entries
            .get(index)
            .and_then(FstabEntry::destination)
            .map(Path::to_path_buf);

        let real = self.real_index(index)?;
        self.lines.remove(real);

        if running {
            if let Some(destination) = destination {
                umount_force(&destination)?;
            }
        }
        Ok(())
    }

    /// Insert a line at a rendered index
    ///
    /// Positions occupied by synthetic lines have no real index and are
    /// rejected.
    pub fn insert(&mut self, index: usize, line: MountLine) -> Result<()> {
        let real = self.real_index(index)?;
        require_no_symlink(&line.destination)?;
        self.lines.insert(real, FstabLine::Mount(line));
        Ok(())
    }

    /// Rewrite a path prefix on every user line (import/export rewriting)
    pub fn replace_path(&mut self, pattern: &str, replacement: &str) {
        for line in &mut self.lines {
            if let FstabLine::Mount(mount) = line {
                mount.source = replace_prefix(&mount.source, pattern, replacement);
                mount.destination = replace_prefix(&mount.destination, pattern, replacement);
            }
        }
    }

    /// User mount lines only (no comments, no auto block)
    pub fn mount_lines(&self) -> Vec<&MountLine> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                FstabLine::Mount(mount) => Some(mount),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Copy)]
enum AddMode {
    Strict,
    SkipExisting,
    Replace,
}

fn replace_prefix(path: &Path, pattern: &str, replacement: &str) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_prefix(pattern) {
        Some(rest) => PathBuf::from(format!("{}{}", replacement, rest)),
        None => path.to_path_buf(),
    }
}

/// Split an fstab body into fields, honouring `\ ` escapes
fn split_fields(body: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = body.trim().chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                chars.next();
                current.push(' ');
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

fn mount(line: &MountLine) -> Result<()> {
    let status = Command::new("/sbin/mount")
        .arg("-o")
        .arg(&line.options)
        .arg("-t")
        .arg(&line.fs_type)
        .arg(&line.source)
        .arg(&line.destination)
        .status()
        .map_err(|e| Error::CommandFailure {
            command: "mount".into(),
            message: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailure {
            command: "mount".into(),
            message: format!("mounting {} failed", line.destination.display()),
        })
    }
}

fn umount_force(destination: &Path) -> Result<()> {
    let status = Command::new("/sbin/umount")
        .arg("-f")
        .arg(destination)
        .status()
        .map_err(|e| Error::CommandFailure {
            command: "umount".into(),
            message: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailure {
            command: "umount".into(),
            message: format!("unmounting {} failed", destination.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fstab() -> Fstab {
        Fstab::new("/pool/ioc/jails/web01")
    }

    fn basejail_fstab() -> Fstab {
        let mut fstab = fstab();
        fstab.set_basejail_source(Some(BasejailSource {
            snapshot_root: PathBuf::from(
                "/pool/ioc/releases/13.2-RELEASE/root/.zfs/snapshot/p0",
            ),
            basedirs: vec!["bin".into(), "usr/lib".into()],
        }));
        fstab
    }

    #[test]
    fn test_parse_six_fields_and_comment() {
        let mut fstab = fstab();
        fstab
            .parse("/a/dir\t/pool/ioc/jails/web01/root/mnt\tnullfs\tro\t0\t0 # note\n")
            .unwrap();

        let lines = fstab.mount_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].fs_type, "nullfs");
        assert_eq!(lines[0].comment.as_deref(), Some("note"));
    }

    #[test]
    fn test_escaped_spaces_in_paths() {
        let mut fstab = fstab();
        fstab
            .parse("/a/with\\ space /pool/ioc/jails/web01/root/mnt nullfs ro 0 0\n")
            .unwrap();
        assert_eq!(
            fstab.mount_lines()[0].source,
            PathBuf::from("/a/with space")
        );
        assert!(fstab.render().contains("with\\ space"));
    }

    #[test]
    fn test_auto_lines_collapse_to_single_placeholder() {
        let mut fstab = basejail_fstab();
        let input = "\
/x/bin\t/pool/ioc/jails/web01/root/bin\tnullfs\tro\t0\t0 # iocage-auto
/user\t/pool/ioc/jails/web01/root/user\tnullfs\tro\t0\t0
/x/usr/lib\t/pool/ioc/jails/web01/root/usr/lib\tnullfs\tro\t0\t0 # iocage-auto
";
        fstab.parse(input).unwrap();

        // one placeholder, one user line stored
        assert_eq!(fstab.mount_lines().len(), 1);
        let entries = fstab.entries();
        // auto block (2 basedirs + maintenance) at the placeholder, then
        // the user line
        assert_eq!(entries.len(), 4);
        assert!(matches!(entries[0], FstabEntry::Basejail(_)));
        assert!(matches!(entries[2], FstabEntry::Maintenance(_)));
        assert!(matches!(entries[3], FstabEntry::Mount(_)));
    }

    #[test]
    fn test_auto_block_leads_without_placeholder() {
        let mut fstab = basejail_fstab();
        fstab
            .parse("/user\t/pool/ioc/jails/web01/root/user\tnullfs\tro\t0\t0\n")
            .unwrap();
        let entries = fstab.entries();
        assert!(matches!(entries[0], FstabEntry::Basejail(_)));
        assert!(matches!(entries[entries.len() - 1], FstabEntry::Mount(_)));
    }

    #[test]
    fn test_maintenance_line_always_present() {
        let fstab = fstab();
        let entries = fstab.entries();
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            FstabEntry::Maintenance(line) => {
                assert_eq!(
                    line.destination,
                    PathBuf::from("/pool/ioc/jails/web01/root/.iocage")
                );
                assert_eq!(line.options, "ro");
            }
            other => panic!("expected maintenance line, got {:?}", other),
        }
    }

    #[test]
    fn test_add_line_prefixes_relative_destination() {
        let mut fstab = fstab();
        fstab
            .add_line(
                MountLine {
                    source: PathBuf::from("/tank/media"),
                    destination: PathBuf::from("media"),
                    fs_type: "nullfs".into(),
                    options: "ro".into(),
                    dump: "0".into(),
                    passnum: "0".into(),
                    comment: None,
                },
                false,
                false,
            )
            .unwrap();
        assert_eq!(
            fstab.mount_lines()[0].destination,
            PathBuf::from("/pool/ioc/jails/web01/root/media")
        );
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let mut fstab = fstab();
        let line = MountLine {
            source: PathBuf::from("/tank/media"),
            destination: PathBuf::from("media"),
            fs_type: "nullfs".into(),
            options: "ro".into(),
            dump: "0".into(),
            passnum: "0".into(),
            comment: None,
        };
        fstab.add_line(line.clone(), false, false).unwrap();
        assert!(matches!(
            fstab.add_line(line.clone(), false, false),
            Err(Error::FstabDestinationExists(_))
        ));
        // replace mode swaps the line instead
        fstab.add_line(line, true, false).unwrap();
        assert_eq!(fstab.mount_lines().len(), 1);
    }

    #[test]
    fn test_synthetic_lines_have_no_real_index() {
        let mut fstab = basejail_fstab();
        assert!(matches!(
            fstab.remove(0, false),
            Err(Error::VirtualFstabLineHasNoRealIndex(0))
        ));
    }

    #[test]
    fn test_backup_prefix_rewrite_on_parse() {
        let mut fstab = fstab();
        fstab
            .parse("backup:///some/dir\t/pool/ioc/jails/web01/root/mnt\tnullfs\tro\t0\t0\n")
            .unwrap();
        assert_eq!(
            fstab.mount_lines()[0].source,
            PathBuf::from("/pool/ioc/jails/web01/some/dir")
        );
    }

    #[test]
    fn test_replace_path() {
        let mut fstab = fstab();
        fstab
            .parse("/old/prefix/data\t/pool/ioc/jails/web01/root/mnt\tnullfs\tro\t0\t0\n")
            .unwrap();
        fstab.replace_path("/old/prefix", "/new/prefix");
        assert_eq!(
            fstab.mount_lines()[0].source,
            PathBuf::from("/new/prefix/data")
        );
    }

    #[test]
    fn test_render_parse_round_trip() {
        let mut fstab = basejail_fstab();
        let input = "\
# user comment
/user\t/pool/ioc/jails/web01/root/user\tnullfs\tro\t0\t0
";
        fstab.parse(input).unwrap();
        let rendered = fstab.render();

        let mut reparsed = basejail_fstab();
        reparsed.parse(&rendered).unwrap();
        assert_eq!(reparsed.render(), rendered);
    }
}
