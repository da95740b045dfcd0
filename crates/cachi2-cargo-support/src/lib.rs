//! Support for cachi2's cargo resolver (§4.10).
//!
//! cargo is the one ecosystem where the lockfile format is plain TOML and
//! the vendoring tool is the package manager itself: `cargo vendor` already
//! knows how to fetch every locked dependency into a local directory and
//! rewrite `.cargo/config.toml` to use it. This crate drives that
//! subprocess and parses `Cargo.lock`'s `[[package]]` table into the
//! locked-package records the resolver turns into SBOM components.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cachi2_process::CommandOutput;
use serde::Deserialize;

/// Runs `cargo metadata` against `manifest_path`.
pub fn load_metadata(manifest_path: &Path) -> Result<cargo_metadata::Metadata> {
    cargo_metadata::MetadataCommand::new()
        .manifest_path(manifest_path)
        .exec()
        .context("failed to execute cargo metadata")
}

/// Runs `cargo vendor --locked --frozen <vendor_dir>` in `workspace_root`.
///
/// `--locked`/`--frozen` forbid cargo from touching `Cargo.lock` or hitting
/// the network for anything not already resolved, matching the "no
/// version-range resolution" non-goal: vendoring must fetch exactly what
/// the lockfile names.
pub fn vendor(workspace_root: &Path, vendor_dir: &Path, timeout: Duration) -> Result<CommandOutput> {
    let vendor_arg = vendor_dir
        .to_str()
        .context("vendor directory path is not valid UTF-8")?;
    cachi2_process::run_with_timeout(
        "cargo",
        &["vendor", "--locked", "--frozen", vendor_arg],
        workspace_root,
        timeout,
    )
}

/// One `[[package]]` entry from `Cargo.lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    /// `None` for the workspace's own members (they have no `source`).
    pub source: Option<PackageSource>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    CratesIo,
    Registry(String),
    Git { url: String, commit: String },
}

impl LockedPackage {
    /// The purl for this locked package, carrying `?checksum=` for
    /// registry-sourced packages or `?vcs_url=` for git-sourced ones, per
    /// the package-url cargo type spec.
    pub fn purl(&self) -> String {
        let mut purl = format!(
            "pkg:cargo/{}@{}",
            percent_encode_name(&self.name),
            self.version
        );
        match &self.source {
            Some(PackageSource::Git { url, commit }) => {
                purl.push_str(&format!("?vcs_url=git%2B{url}%40{commit}"));
            }
            _ => {
                if let Some(checksum) = &self.checksum {
                    purl.push_str(&format!("?checksum=sha256:{checksum}"));
                }
            }
        }
        purl
    }
}

fn percent_encode_name(name: &str) -> String {
    name.replace('/', "%2F")
}

#[derive(Debug, Deserialize)]
struct RawLockfile {
    #[serde(rename = "package", default)]
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    version: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
}

/// Parses a `Cargo.lock` file into its locked packages, skipping workspace
/// members (entries with no `source`).
pub fn parse_lockfile(path: &Path) -> Result<Vec<LockedPackage>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_lockfile_str(&contents)
}

fn parse_lockfile_str(contents: &str) -> Result<Vec<LockedPackage>> {
    let raw: RawLockfile = toml::from_str(contents).context("failed to parse Cargo.lock")?;
    raw.packages
        .into_iter()
        .map(|pkg| {
            let source = pkg.source.as_deref().map(parse_source).transpose()?;
            Ok(LockedPackage {
                name: pkg.name,
                version: pkg.version,
                source,
                checksum: pkg.checksum,
            })
        })
        .collect()
}

fn parse_source(raw: &str) -> Result<PackageSource> {
    if raw.starts_with("registry+https://github.com/rust-lang/crates.io-index") {
        return Ok(PackageSource::CratesIo);
    }
    if let Some(rest) = raw.strip_prefix("registry+") {
        return Ok(PackageSource::Registry(rest.to_string()));
    }
    if let Some(rest) = raw.strip_prefix("git+") {
        let (url, commit) = rest
            .rsplit_once('#')
            .with_context(|| format!("git source `{raw}` has no commit fragment"))?;
        return Ok(PackageSource::Git {
            url: url.split('?').next().unwrap_or(url).to_string(),
            commit: commit.to_string(),
        });
    }
    anyhow::bail!("unrecognized Cargo.lock source: {raw}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LOCK: &str = r#"
version = 4

[[package]]
name = "my-workspace-crate"
version = "0.1.0"

[[package]]
name = "serde"
version = "1.0.228"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "abc123"

[[package]]
name = "some-fork"
version = "0.2.0"
source = "git+https://github.com/example/some-fork.git#deadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
"#;

    #[test]
    fn parses_workspace_member_with_no_source() {
        let packages = parse_lockfile_str(SAMPLE_LOCK).unwrap();
        let member = packages.iter().find(|p| p.name == "my-workspace-crate").unwrap();
        assert_eq!(member.source, None);
    }

    #[test]
    fn parses_crates_io_source_and_checksum() {
        let packages = parse_lockfile_str(SAMPLE_LOCK).unwrap();
        let serde = packages.iter().find(|p| p.name == "serde").unwrap();
        assert_eq!(serde.source, Some(PackageSource::CratesIo));
        assert_eq!(serde.checksum.as_deref(), Some("abc123"));
        assert_eq!(serde.purl(), "pkg:cargo/serde@1.0.228?checksum=sha256:abc123");
    }

    #[test]
    fn parses_git_source_into_vcs_purl() {
        let packages = parse_lockfile_str(SAMPLE_LOCK).unwrap();
        let fork = packages.iter().find(|p| p.name == "some-fork").unwrap();
        match &fork.source {
            Some(PackageSource::Git { url, commit }) => {
                assert_eq!(url, "https://github.com/example/some-fork.git");
                assert_eq!(commit, "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef");
            }
            other => panic!("expected git source, got {other:?}"),
        }
        assert!(fork.purl().contains("vcs_url=git%2B"));
    }
}
