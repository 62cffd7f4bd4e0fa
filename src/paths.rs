//! Path safety checks
//!
//! Internally generated paths are rejected when an ancestor is a symlink,
//! and jail-relative paths must stay below the jail root. Both checks run
//! before anything is written.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Walk a path's ancestors and fail on the first symlink
///
/// The path itself does not have to exist yet; existing components must
/// not be links.
pub fn require_no_symlink(path: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(Error::InsecureJailPath(path.to_path_buf()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Normalise `..`/`.` components without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other),
        }
    }
    result
}

/// Ensure `path` stays below `root` after normalisation
pub fn require_relative_path(root: &Path, path: &Path) -> Result<()> {
    let normalized = normalize(path);
    if normalized.starts_with(root) {
        Ok(())
    } else {
        Err(Error::JailEscape {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_inside_root() {
        let root = Path::new("/pool/ioc/jails/web01/root");
        assert!(require_relative_path(root, Path::new("/pool/ioc/jails/web01/root/etc")).is_ok());
    }

    #[test]
    fn test_parent_escape_is_rejected() {
        let root = Path::new("/pool/ioc/jails/web01/root");
        assert!(
            require_relative_path(root, Path::new("/pool/ioc/jails/web01/root/../other")).is_err()
        );
    }

    #[test]
    fn test_unrelated_path_is_rejected() {
        let root = Path::new("/pool/ioc/jails/web01/root");
        assert!(require_relative_path(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_symlink_ancestor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(require_no_symlink(&link.join("below")).is_err());
        assert!(require_no_symlink(&target.join("below")).is_ok());
    }
}
