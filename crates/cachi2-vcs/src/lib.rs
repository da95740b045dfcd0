//! VCS dependency archiving (§4.2).
//!
//! Some ecosystems declare a dependency by git URL and commit rather than a
//! registry coordinate (a `git` source in `Cargo.lock`, a VCS requirement in
//! a `requirements.txt`). This crate clones the repository at the declared
//! revision, verifies the clone actually landed on that revision (a mismatch
//! is fatal — a floating ref would break hermeticity), and packs the
//! checked-out tree into a deterministic `.tar.gz`: entries sorted by path,
//! mtimes zeroed, no `.git` directory, so the same commit always produces a
//! byte-identical archive regardless of clone time or host clock.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use flate2::GzBuilder;
use flate2::Compression;

/// Outcome of fetching and archiving one VCS dependency.
#[derive(Debug, Clone)]
pub struct VcsArtifact {
    /// Path to the produced deterministic `.tar.gz`.
    pub archive_path: PathBuf,
    /// The commit the archive was built from (always the full 40-hex SHA).
    pub resolved_commit: String,
}

/// Clones `repo_url` at `commit`, verifies the resulting `HEAD` matches, and
/// writes a deterministic tarball to `archive_path`.
///
/// Tries a shallow clone first (`--depth 1` with the commit as a direct
/// fetch target); repositories whose host doesn't support fetching an
/// arbitrary commit fall back to a full clone.
pub fn fetch_and_archive(
    repo_url: &str,
    commit: &str,
    archive_path: &Path,
) -> Result<VcsArtifact> {
    let workdir = tempfile::tempdir().context("failed to create clone scratch dir")?;
    let checkout = workdir.path().join("checkout");

    clone_at_commit(repo_url, commit, &checkout)?;

    let resolved = rev_parse_head(&checkout)?;
    if resolved != commit && !resolved.starts_with(commit) {
        bail!(
            "resolved commit `{resolved}` does not match declared revision `{commit}` for {repo_url}"
        );
    }

    write_deterministic_tarball(&checkout, archive_path)?;

    Ok(VcsArtifact {
        archive_path: archive_path.to_path_buf(),
        resolved_commit: resolved,
    })
}

fn clone_at_commit(repo_url: &str, commit: &str, dest: &Path) -> Result<()> {
    if try_shallow_fetch(repo_url, commit, dest)? {
        return Ok(());
    }
    full_clone_and_checkout(repo_url, commit, dest)
}

/// Attempts `git init` + `git fetch --depth 1 <url> <commit>` + checkout.
/// Returns `Ok(false)` (not an error) when the remote rejects fetching an
/// arbitrary commit, so the caller can fall back to a full clone.
fn try_shallow_fetch(repo_url: &str, commit: &str, dest: &Path) -> Result<bool> {
    std::fs::create_dir_all(dest).context("failed to create checkout dir")?;

    run_git(dest, &["init", "--quiet"])?;
    run_git(dest, &["remote", "add", "origin", repo_url])?;

    let fetch = Command::new("git")
        .args(["fetch", "--depth", "1", "origin", commit])
        .current_dir(dest)
        .output()
        .context("failed to run git fetch")?;

    if !fetch.status.success() {
        return Ok(false);
    }

    run_git(dest, &["checkout", "--quiet", "FETCH_HEAD"])?;
    Ok(true)
}

fn full_clone_and_checkout(repo_url: &str, commit: &str, dest: &Path) -> Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).context("failed to clear partial checkout")?;
    }

    let clone = Command::new("git")
        .args(["clone", "--quiet", repo_url])
        .arg(dest)
        .output()
        .context("failed to run git clone")?;
    if !clone.status.success() {
        bail!(
            "git clone of {repo_url} failed: {}",
            String::from_utf8_lossy(&clone.stderr)
        );
    }

    run_git(dest, &["checkout", "--quiet", commit])
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;
    if !output.status.success() {
        bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

fn rev_parse_head(dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .context("failed to run git rev-parse HEAD")?;
    if !output.status.success() {
        bail!(
            "git rev-parse HEAD failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Packs `source_dir` (excluding `.git`) into a gzip tarball at
/// `archive_path` with sorted entries and zeroed mtimes, so the output is a
/// function only of file contents and paths, never of clone time.
fn write_deterministic_tarball(source_dir: &Path, archive_path: &Path) -> Result<()> {
    let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(source_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| !is_inside_git_dir(source_dir, entry.path()))
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect();
    entries.sort();

    let file = File::create(archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for path in entries {
        let relative = path.strip_prefix(source_dir).unwrap();
        let mut header = tar::Header::new_gnu();
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        header.set_metadata(&metadata);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();

        let mut contents = File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        builder
            .append_data(&mut header, relative, &mut contents)
            .with_context(|| format!("failed to append {} to archive", relative.display()))?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

fn is_inside_git_dir(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|first| first.as_os_str() == ".git")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_repo_with_commit(dir: &Path) -> String {
        Command::new("git").args(["init", "--quiet"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.name", "T"]).current_dir(dir).output().unwrap();
        std::fs::write(dir.join("file.txt"), b"hello").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git").args(["commit", "--quiet", "-m", "init"]).current_dir(dir).output().unwrap();
        let out = Command::new("git").args(["rev-parse", "HEAD"]).current_dir(dir).output().unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[test]
    fn fetch_and_archive_produces_tarball_at_exact_commit() {
        let origin = tempfile::tempdir().unwrap();
        let commit = init_repo_with_commit(origin.path());

        let dest = tempfile::tempdir().unwrap();
        let archive_path = dest.path().join("archive.tar.gz");

        let artifact = fetch_and_archive(
            origin.path().to_str().unwrap(),
            &commit,
            &archive_path,
        )
        .expect("fetch_and_archive");

        assert_eq!(artifact.resolved_commit, commit);
        assert!(archive_path.exists());
    }

    #[test]
    fn same_commit_produces_byte_identical_archive() {
        let origin = tempfile::tempdir().unwrap();
        let commit = init_repo_with_commit(origin.path());

        let dest = tempfile::tempdir().unwrap();
        let first = dest.path().join("a.tar.gz");
        let second = dest.path().join("b.tar.gz");

        fetch_and_archive(origin.path().to_str().unwrap(), &commit, &first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        fetch_and_archive(origin.path().to_str().unwrap(), &commit, &second).unwrap();

        let a = std::fs::read(&first).unwrap();
        let b = std::fs::read(&second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_mismatched_commit() {
        let origin = tempfile::tempdir().unwrap();
        let _commit = init_repo_with_commit(origin.path());

        let dest = tempfile::tempdir().unwrap();
        let archive_path = dest.path().join("archive.tar.gz");

        let bogus = "0".repeat(40);
        let result = fetch_and_archive(origin.path().to_str().unwrap(), &bogus, &archive_path);
        assert!(result.is_err());
    }
}
