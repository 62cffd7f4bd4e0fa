//! Archive extraction with member-name checks
//!
//! Release assets and backup bundles are only extracted after every member
//! name has been verified: names must be relative (beginning with `./`)
//! and must not contain `..`. The check runs in a first pass over the
//! archive before anything touches the filesystem.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;

/// Compression applied to a tar archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Zstd,
}

fn open_reader(file: &Path, compression: Compression) -> Result<Box<dyn Read>> {
    let handle = File::open(file)?;
    Ok(match compression {
        Compression::None => Box::new(handle),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(handle)),
        Compression::Zstd => Box::new(
            zstd::stream::Decoder::new(handle)
                .map_err(|e| Error::CommandFailure {
                    command: "zstd".into(),
                    message: e.to_string(),
                })?,
        ),
    })
}

fn check_member_name(name: &str) -> Result<()> {
    if name == "." {
        return Ok(());
    }
    if !name.starts_with("./") {
        return Err(Error::IllegalArchiveContent(format!(
            "{}: names in archives must be relative and begin with './'",
            name
        )));
    }
    if name.split('/').any(|part| part == "..") {
        return Err(Error::IllegalArchiveContent(format!(
            "{}: names in archives must not contain '..'",
            name
        )));
    }
    Ok(())
}

/// Extract a tar archive to `destination` after verifying every member
pub fn extract(file: &Path, compression: Compression, destination: &Path) -> Result<()> {
    // first pass: verify the member list before touching the filesystem
    let mut archive = Archive::new(open_reader(file, compression)?);
    for entry in archive.entries()? {
        let entry = entry?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        check_member_name(raw.trim_end_matches('/'))?;
    }

    log::debug!("Extracting {}", file.display());
    let mut archive = Archive::new(open_reader(file, compression)?);
    archive.set_preserve_permissions(true);
    archive.unpack(destination)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_archive(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut builder = tar::Builder::new(file.reopen().unwrap());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *name, *content).unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
        file
    }

    #[test]
    fn test_extracts_relative_members() {
        let archive = build_archive(&[("./etc/rc.conf", b"hostname=x\n")]);
        let dest = tempfile::tempdir().unwrap();
        extract(archive.path(), Compression::None, dest.path()).unwrap();
        assert!(dest.path().join("etc/rc.conf").is_file());
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let archive = build_archive(&[("./fine", b"ok"), ("./evil/../../escape", b"no")]);
        let dest = tempfile::tempdir().unwrap();
        let result = extract(archive.path(), Compression::None, dest.path());
        assert!(matches!(result, Err(Error::IllegalArchiveContent(_))));
        assert!(!dest.path().join("fine").exists());
    }

    #[test]
    fn test_member_name_rules() {
        assert!(check_member_name(".").is_ok());
        assert!(check_member_name("./usr/bin/sh").is_ok());
        assert!(check_member_name("/etc/passwd").is_err());
        assert!(check_member_name("./a/../b").is_err());
    }
}
