//! Toolchain version detection for cachi2's resolvers.
//!
//! gomod's toolchain-floor policy (§4.6) needs to know the installed `go`
//! version before it can decide whether a module's declared `go` directive
//! is satisfiable on this host; every resolver attaches the detected tool
//! version to its diagnostic events for post-hoc audit. This crate is the
//! one place that runs `<tool> --version` and parses the result.

use std::process::Command;

use anyhow::{Context, Result};
use cachi2_types::PackageManager;
use serde::{Deserialize, Serialize};

/// A detected toolchain version, e.g. `go1.21.3` or `9.6.7`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub tool: String,
    pub raw: String,
    pub parsed: Option<SemVer>,
}

/// A minimal, comparison-only semantic version: major.minor.patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl SemVer {
    /// Parses the first `\d+(\.\d+)?(\.\d+)?` run found in `s`.
    pub fn find_in(s: &str) -> Option<SemVer> {
        let digits_or_dot = |c: char| c.is_ascii_digit() || c == '.';
        let mut chars = s.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c.is_ascii_digit() {
                let end = s[start..]
                    .find(|c: char| !digits_or_dot(c))
                    .map(|i| start + i)
                    .unwrap_or(s.len());
                let candidate = &s[start..end];
                if let Some(version) = Self::parse(candidate) {
                    return Some(version);
                }
            }
        }
        None
    }

    pub fn parse(s: &str) -> Option<SemVer> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(SemVer { major, minor, patch })
    }
}

/// Command and argument used to probe each package manager's toolchain.
fn probe_command(pm: PackageManager) -> Option<(&'static str, &'static str)> {
    match pm {
        PackageManager::Gomod => Some(("go", "version")),
        PackageManager::Npm => Some(("npm", "--version")),
        PackageManager::YarnClassic | PackageManager::YarnBerry => Some(("yarn", "--version")),
        PackageManager::Cargo => Some(("cargo", "--version")),
        PackageManager::Bundler => Some(("bundle", "--version")),
        PackageManager::Pip => Some(("pip", "--version")),
        PackageManager::Generic => None,
    }
}

/// Detects the installed toolchain version for `pm`, if one applies.
pub fn detect(pm: PackageManager) -> Result<Option<ToolVersion>> {
    let Some((tool, flag)) = probe_command(pm) else {
        return Ok(None);
    };

    let output = Command::new(tool)
        .arg(flag)
        .output()
        .with_context(|| format!("failed to run `{tool} {flag}`"))?;

    if !output.status.success() {
        anyhow::bail!(
            "`{tool} {flag}` exited with status {:?}",
            output.status.code()
        );
    }

    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let parsed = SemVer::find_in(&raw);

    Ok(Some(ToolVersion {
        tool: tool.to_string(),
        raw,
        parsed,
    }))
}

/// Whether `tool` resolves on `PATH` at all, without invoking it.
pub fn is_available(pm: PackageManager) -> bool {
    match probe_command(pm) {
        Some((tool, _)) => cachi2_process_which(tool),
        None => false,
    }
}

fn cachi2_process_which(tool: &str) -> bool {
    which::which(tool).is_ok()
}
