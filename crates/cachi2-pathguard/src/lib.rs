//! Path confinement for dependency-supplied relative paths (§4.3).
//!
//! Every path cachi2 ever joins onto `source_dir` or `output_dir` — a
//! package's declared `path`, a lockfile entry's `target_path`, a VCS
//! archive member name — is untrusted input. [`confine`] is the one place
//! that trust boundary is checked: it rejects absolute paths, `..`
//! components that would climb above the root, and symlinks that resolve
//! outside of it, and otherwise returns the canonical path joined under the
//! root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathGuardError {
    #[error("path `{0}` is absolute; only paths relative to the root are accepted")]
    AbsolutePath(PathBuf),

    #[error("path `{path}` escapes root `{root}`")]
    Escapes { root: PathBuf, path: PathBuf },

    #[error("path `{0}` does not exist")]
    NotFound(PathBuf),

    #[error("failed to canonicalize `{path}`: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Joins `candidate` onto `root` and confirms the result resolves inside
/// `root`, following symlinks. `candidate` must be relative and must not
/// already exist outside `root` via `..` or a symlink escape.
///
/// `root` itself must exist; `candidate` need not (the joined path is
/// lexically confined first, then canonicalized only as far as existing
/// ancestors allow, so a not-yet-created download destination can still be
/// confined).
pub fn confine(root: &Path, candidate: &Path) -> Result<PathBuf, PathGuardError> {
    if candidate.is_absolute() {
        return Err(PathGuardError::AbsolutePath(candidate.to_path_buf()));
    }

    let joined = lexically_join(root, candidate)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|source| PathGuardError::Canonicalize {
            path: root.to_path_buf(),
            source,
        })?;

    match canonicalize_existing_prefix(&joined) {
        Ok(resolved) if resolved.starts_with(&canonical_root) => Ok(joined),
        Ok(resolved) => Err(PathGuardError::Escapes {
            root: canonical_root,
            path: resolved,
        }),
        Err(source) => Err(PathGuardError::Canonicalize {
            path: joined,
            source,
        }),
    }
}

/// Like [`confine`], but additionally requires the resolved path to exist.
pub fn confine_existing(root: &Path, candidate: &Path) -> Result<PathBuf, PathGuardError> {
    let confined = confine(root, candidate)?;
    if confined.exists() {
        Ok(confined)
    } else {
        Err(PathGuardError::NotFound(confined))
    }
}

/// Joins `root` and `candidate` purely lexically, rejecting any `..`
/// component that would climb above `root` before a single syscall is made.
fn lexically_join(root: &Path, candidate: &Path) -> Result<PathBuf, PathGuardError> {
    let mut stack: Vec<Component> = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(_) => stack.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(PathGuardError::Escapes {
                        root: root.to_path_buf(),
                        path: candidate.to_path_buf(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathGuardError::AbsolutePath(candidate.to_path_buf()));
            }
        }
    }
    let mut joined = root.to_path_buf();
    joined.extend(stack);
    Ok(joined)
}

/// Canonicalizes `path`, walking up to its nearest existing ancestor first
/// (so it works for paths that don't exist yet, e.g. a pending download
/// destination) and rejoining the non-existent suffix lexically.
fn canonicalize_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut suffix: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut result = resolved;
                for part in suffix.into_iter().rev() {
                    result.push(part);
                }
                return Ok(result);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let name = existing.file_name();
                let parent = existing.parent();
                match (name, parent) {
                    (Some(name), Some(parent)) => {
                        suffix.push(name);
                        existing = parent;
                    }
                    _ => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn confines_a_plain_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("vendor")).unwrap();
        let confined = confine(dir.path(), Path::new("vendor")).unwrap();
        assert!(confined.ends_with("vendor"));
    }

    #[test]
    fn rejects_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = confine(dir.path(), Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, PathGuardError::AbsolutePath(_)));
    }

    #[test]
    fn rejects_dot_dot_traversal_above_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = confine(dir.path(), Path::new("../outside")).unwrap_err();
        assert!(matches!(err, PathGuardError::Escapes { .. }));
    }

    #[test]
    fn allows_dot_dot_that_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let confined = confine(dir.path(), Path::new("a/b/../b")).unwrap();
        assert!(confined.ends_with("a/b"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = confine(dir.path(), Path::new("link")).unwrap_err();
        assert!(matches!(err, PathGuardError::Escapes { .. }));
    }

    #[test]
    fn confine_existing_requires_presence() {
        let dir = tempfile::tempdir().unwrap();
        let err = confine_existing(dir.path(), Path::new("missing")).unwrap_err();
        assert!(matches!(err, PathGuardError::NotFound(_)));
    }
}
