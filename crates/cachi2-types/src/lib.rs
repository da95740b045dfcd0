//! Core data model for cachi2.
//!
//! This crate defines the immutable request object the whole engine is
//! driven by ([`Request`]), the per-package-manager input variants
//! ([`PackageInput`]), and the two units resolvers produce: [`Component`]
//! (an SBOM entry) and [`Artifact`] (a pending fetch).
//!
//! Nothing in this crate performs I/O. Validation of a [`Request`] against
//! the filesystem lives in `cachi2-schema`, which depends on this crate.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use cachi2_retry::RetryStrategyConfig;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

/// A path that has already been confirmed (by `cachi2-pathguard`) to resolve
/// inside some root directory. Carries the relative form so callers can
/// re-join it against either `source_dir` or `output_dir` as needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelPath(pub PathBuf);

impl RelPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &std::path::Path {
        &self.0
    }
}

impl std::fmt::Display for RelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Which package manager a [`PackageInput`] should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    Gomod,
    Pip,
    Npm,
    YarnClassic,
    YarnBerry,
    Cargo,
    Bundler,
    Generic,
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PackageManager::Gomod => "gomod",
            PackageManager::Pip => "pip",
            PackageManager::Npm => "npm",
            PackageManager::YarnClassic => "yarn-classic",
            PackageManager::YarnBerry => "yarn-berry",
            PackageManager::Cargo => "cargo",
            PackageManager::Bundler => "bundler",
            PackageManager::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

/// One entry of the `packages` array in the incoming request, tagged by
/// package manager (Design Notes §9: a tagged variant replaces per-package
/// dynamic dispatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PackageInput {
    Gomod {
        path: RelPath,
    },
    Pip {
        path: RelPath,
        #[serde(default)]
        requirements_files: Vec<RelPath>,
        #[serde(default)]
        requirements_build_files: Vec<RelPath>,
        #[serde(default)]
        allow_binary: bool,
    },
    Npm {
        path: RelPath,
    },
    YarnClassic {
        path: RelPath,
    },
    YarnBerry {
        path: RelPath,
    },
    Cargo {
        path: RelPath,
    },
    Bundler {
        path: RelPath,
        #[serde(default)]
        allow_binary: bool,
    },
    Generic {
        path: RelPath,
        #[serde(default)]
        lockfile: Option<PathBuf>,
    },
}

impl PackageInput {
    pub fn manager(&self) -> PackageManager {
        match self {
            PackageInput::Gomod { .. } => PackageManager::Gomod,
            PackageInput::Pip { .. } => PackageManager::Pip,
            PackageInput::Npm { .. } => PackageManager::Npm,
            PackageInput::YarnClassic { .. } => PackageManager::YarnClassic,
            PackageInput::YarnBerry { .. } => PackageManager::YarnBerry,
            PackageInput::Cargo { .. } => PackageManager::Cargo,
            PackageInput::Bundler { .. } => PackageManager::Bundler,
            PackageInput::Generic { .. } => PackageManager::Generic,
        }
    }

    pub fn path(&self) -> &RelPath {
        match self {
            PackageInput::Gomod { path }
            | PackageInput::Npm { path }
            | PackageInput::YarnClassic { path }
            | PackageInput::YarnBerry { path }
            | PackageInput::Cargo { path }
            | PackageInput::Pip { path, .. }
            | PackageInput::Bundler { path, .. }
            | PackageInput::Generic { path, .. } => path,
        }
    }
}

/// Output SBOM format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SbomFormat {
    #[default]
    CycloneDx,
    Spdx,
}

/// Global flags that apply across every package in the request.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFlags {
    #[serde(default)]
    pub gomod_vendor_check: bool,
    #[serde(default)]
    pub force_gomod_tidy: bool,
    #[serde(default)]
    pub gomod_cgo_disable: bool,
    #[serde(default)]
    pub dev_package_managers: bool,
    #[serde(default)]
    pub sbom_format: SbomFormat,
    /// Max simultaneous in-flight downloads (§5). Default 5.
    #[serde(default = "default_concurrency")]
    pub fetch_concurrency: usize,
    /// Per-attempt read timeout for network fetches.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_read_timeout")]
    pub fetch_read_timeout: Duration,
    /// Total request timeout budget.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_total_timeout")]
    pub fetch_total_timeout: Duration,
    #[serde(default)]
    pub retry: Option<RetryStrategyConfig>,
}

fn default_concurrency() -> usize {
    5
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_total_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for RequestFlags {
    fn default() -> Self {
        Self {
            gomod_vendor_check: false,
            force_gomod_tidy: false,
            gomod_cgo_disable: false,
            dev_package_managers: false,
            sbom_format: SbomFormat::default(),
            fetch_concurrency: default_concurrency(),
            fetch_read_timeout: default_read_timeout(),
            fetch_total_timeout: default_total_timeout(),
            retry: None,
        }
    }
}

/// The immutable, validated request that drives a single cachi2 invocation.
///
/// Constructed only via `cachi2_schema::validate_request`, which enforces
/// every invariant named in the data model: `source_dir` exists and is a git
/// working tree, every package `path` normalizes inside `source_dir`, and
/// every `requirements_files`/`requirements_build_files` entry exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub packages: Vec<PackageInput>,
    pub flags: RequestFlags,
}

impl Request {
    /// Output directory for a given package manager's cache, e.g.
    /// `<output>/deps/gomod`.
    pub fn pm_output_dir(&self, pm: PackageManager) -> PathBuf {
        self.output_dir.join("deps").join(pm.to_string())
    }
}

/// Where a [`Component`] was found by, surfaced as the `cachi2:found_by`
/// SBOM property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FoundBy {
    Cachi2,
    Resolver(PackageManager),
}

impl std::fmt::Display for FoundBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FoundBy::Cachi2 => write!(f, "cachi2"),
            FoundBy::Resolver(pm) => write!(f, "cachi2:{pm}"),
        }
    }
}

/// SBOM component kind (CycloneDX `type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Library,
    File,
    Container,
}

/// A single SBOM unit. Uniqueness key is `(name, version, purl)`; see
/// `cachi2-sbom` for the merge/dedupe algorithm over this key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: Option<String>,
    pub purl: String,
    pub component_type: ComponentType,
    pub found_by: FoundBy,
    /// Arbitrary ecosystem properties, e.g. `cdx:npm:package:development`,
    /// `cachi2:missing_hash:in_file`. Stored as key/value pairs so sets of
    /// components can be unioned property-wise during merge.
    pub properties: BTreeSet<(String, String)>,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        version: Option<String>,
        purl: impl Into<String>,
        component_type: ComponentType,
        found_by: FoundBy,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            purl: purl.into(),
            component_type,
            found_by,
            properties: BTreeSet::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert((key.into(), value.into()));
        self
    }

    /// The `(name, version, purl)` uniqueness key used by SBOM merge.
    pub fn key(&self) -> (String, Option<String>, String) {
        (self.name.clone(), self.version.clone(), self.purl.clone())
    }
}

/// A pending fetch: something `cachi2-checksum`'s `fetch_many` will
/// download and verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub vcs_ref: Option<String>,
    /// Expected digests, `algorithm:hex`. Empty only when a
    /// `cachi2:missing_hash:in_file` property has been attached to the
    /// resulting component.
    pub checksums: BTreeSet<String>,
    pub target_path: PathBuf,
    pub size_limit: Option<u64>,
}

/// What a resolver hands back to the Dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverResult {
    pub components: Vec<Component>,
    pub env: Vec<EnvVar>,
    pub file_edits: Vec<FileEdit>,
}

impl ResolverResult {
    pub fn merge(mut self, other: ResolverResult) -> Self {
        self.components.extend(other.components);
        self.env.extend(other.env);
        self.file_edits.extend(other.file_edits);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A project-file edit a resolver wants applied after all fetches succeed
/// (e.g. rewriting `package-lock.json`'s `resolved` fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
    /// Path inside `source_dir` that was rewritten.
    pub path: PathBuf,
    /// Short human description, surfaced in `output.json`.
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_manager_display_matches_kebab_tag() {
        assert_eq!(PackageManager::YarnBerry.to_string(), "yarn-berry");
    }

    #[test]
    fn package_input_manager_round_trips_through_json() {
        let input = PackageInput::Pip {
            path: RelPath::new("."),
            requirements_files: vec![RelPath::new("requirements.txt")],
            requirements_build_files: vec![],
            allow_binary: false,
        };
        assert_eq!(input.manager(), PackageManager::Pip);

        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"type\":\"pip\""));
        let back: PackageInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.manager(), PackageManager::Pip);
    }

    #[test]
    fn component_key_ignores_properties() {
        let a = Component::new(
            "foo",
            Some("1.0.0".into()),
            "pkg:pypi/foo@1.0.0",
            ComponentType::Library,
            FoundBy::Cachi2,
        )
        .with_property("cachi2:found_by", "cachi2:pip");
        let b = Component::new(
            "foo",
            Some("1.0.0".into()),
            "pkg:pypi/foo@1.0.0",
            ComponentType::Library,
            FoundBy::Cachi2,
        );
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn found_by_display() {
        assert_eq!(
            FoundBy::Resolver(PackageManager::Npm).to_string(),
            "cachi2:npm"
        );
        assert_eq!(FoundBy::Cachi2.to_string(), "cachi2");
    }
}
