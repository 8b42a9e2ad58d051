//! Path resolution under a library root.
//!
//! Every file-operation entry point goes through [`resolve`]; there is no
//! second code path. The pure component screening lives in
//! [`harbor_types::path`]; this module adds the filesystem half: the
//! joined path (or its deepest existing ancestor, so symlinked parents
//! cannot smuggle a path out) must resolve to a descendant of the
//! resolved root.

use harbor_types::{path as pathcheck, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::{ServerError, ServerResult};

/// Resolve a client-supplied relative path to an absolute path under
/// `root`, rejecting every escape.
pub fn resolve(root: &Path, rel_path: &str) -> ServerResult<PathBuf> {
    let rel = pathcheck::validate_relative(rel_path)
        .map_err(|e| ServerError::op(e.kind(), e.to_string()))?;

    let root_resolved = root.canonicalize().map_err(|e| {
        ServerError::op(
            ErrorKind::Internal,
            format!("library root {} is not resolvable: {e}", root.display()),
        )
    })?;

    let joined = root_resolved.join(&rel);

    // Resolve symlinks on the deepest ancestor that exists. The target
    // itself may not exist yet (uploads create it), but whatever portion
    // does exist must stay inside the root.
    let existing = deepest_existing_ancestor(&joined);
    let resolved = existing.canonicalize().map_err(|e| {
        ServerError::op(ErrorKind::Internal, format!("cannot resolve path: {e}"))
    })?;

    if !resolved.starts_with(&root_resolved) {
        return Err(ServerError::op(
            ErrorKind::PathTraversal,
            format!("path escapes library root: {rel_path}"),
        ));
    }

    Ok(joined)
}

fn deepest_existing_ancestor(path: &Path) -> &Path {
    let mut current = path;
    loop {
        if current.exists() {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_paths_resolve_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(dir.path(), "sub/file.txt").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert!(resolved.ends_with("sub/file.txt"));
    }

    #[test]
    fn dotdot_is_rejected_with_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
    }

    #[test]
    fn absolute_path_is_rejected_with_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
    }

    #[test]
    fn nul_byte_is_rejected_with_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "a\0b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(dir.path(), "").unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let link = root.path().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let err = resolve(root.path(), "escape/file.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_is_allowed() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink(root.path().join("real"), root.path().join("alias")).unwrap();

        let resolved = resolve(root.path(), "alias/file.txt").unwrap();
        assert!(resolved.starts_with(root.path().canonicalize().unwrap()));
    }

    #[test]
    fn nonexistent_nested_target_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(dir.path(), "a/b/c/d.bin").unwrap();
        assert!(resolved.ends_with("a/b/c/d.bin"));
    }
}
