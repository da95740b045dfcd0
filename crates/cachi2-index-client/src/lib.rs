//! HTTP index client shared by the pip, npm, and generic resolvers.
//!
//! Each ecosystem this crate serves has its own index shape — pip's PEP
//! 503/691 Simple Repository API, npm's registry package-metadata document,
//! and Maven-style layout for generic URL-addressed lockfiles — but all
//! three boil down to "fetch a small JSON/HTML document, then hand back
//! the download URLs and digests it names." Actually downloading and
//! verifying those URLs is `cachi2-checksum`'s job; this crate only speaks
//! the index protocols.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("cachi2/", env!("CARGO_PKG_VERSION"));

/// A small blocking HTTP client shared across index lookups within one
/// resolver invocation.
#[derive(Debug, Clone)]
pub struct IndexClient {
    client: reqwest::blocking::Client,
}

impl Default for IndexClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl IndexClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { client }
    }

    fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            bail!("unexpected status {} fetching {url}", response.status());
        }
        response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))
    }

    /// Fetches the PEP 691 JSON Simple API document for `package` from
    /// `index_base` (e.g. `https://pypi.org/simple`).
    pub fn fetch_pip_simple_index(
        &self,
        index_base: &str,
        package: &str,
    ) -> Result<PipSimpleIndex> {
        let canonical = pep503_canonical_name(package);
        let url = format!("{}/{canonical}/", index_base.trim_end_matches('/'));
        let body = self.get_text(&url)?;
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse PEP 691 index response from {url}"))
    }

    /// Fetches the full package-metadata document for `package` from an npm
    /// registry (e.g. `https://registry.npmjs.org`).
    pub fn fetch_npm_package_metadata(
        &self,
        registry_base: &str,
        package: &str,
    ) -> Result<NpmPackageMetadata> {
        let encoded = npm_package_path_segment(package);
        let url = format!("{}/{encoded}", registry_base.trim_end_matches('/'));
        let body = self.get_text(&url)?;
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse npm registry response from {url}"))
    }
}

/// PEP 503 canonicalization: lowercase, runs of `-`, `_`, `.` collapsed to
/// a single `-`.
pub fn pep503_canonical_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let mut result = String::with_capacity(lower.len());
    let mut last_was_separator = false;
    for c in lower.chars() {
        if c == '-' || c == '_' || c == '.' {
            if !last_was_separator && !result.is_empty() {
                result.push('-');
            }
            last_was_separator = true;
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }
    result.trim_end_matches('-').to_string()
}

/// npm scoped packages (`@scope/name`) are percent-encoded as a single
/// path segment when querying the registry directly.
fn npm_package_path_segment(name: &str) -> String {
    if let Some(rest) = name.strip_prefix('@') {
        format!("@{}", rest.replace('/', "%2f"))
    } else {
        name.to_string()
    }
}

/// PEP 691 JSON Simple API response (the subset cachi2 needs).
#[derive(Debug, Clone, Deserialize)]
pub struct PipSimpleIndex {
    pub name: String,
    pub files: Vec<PipSimpleFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipSimpleFile {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub hashes: std::collections::BTreeMap<String, String>,
    #[serde(default, rename = "requires-python")]
    pub requires_python: Option<String>,
    #[serde(default)]
    pub yanked: YankedField,
}

/// `yanked` is either absent/`false`, or a string giving the yank reason.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum YankedField {
    #[default]
    NotYanked,
    Bool(bool),
    Reason(String),
}

impl YankedField {
    pub fn is_yanked(&self) -> bool {
        !matches!(self, YankedField::NotYanked | YankedField::Bool(false))
    }
}

/// npm registry package-metadata document (the subset cachi2 needs).
#[derive(Debug, Clone, Deserialize)]
pub struct NpmPackageMetadata {
    pub name: String,
    pub versions: std::collections::BTreeMap<String, NpmVersionMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NpmVersionMetadata {
    pub version: String,
    pub dist: NpmDist,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NpmDist {
    pub tarball: String,
    #[serde(default)]
    pub shasum: Option<String>,
    #[serde(default)]
    pub integrity: Option<String>,
}

/// Builds a Maven-layout download URL: `<base>/<group-as-path>/<artifact>/<version>/<artifact>-<version>[-<classifier>].<ext>`.
pub fn maven_layout_url(
    base: &str,
    group_id: &str,
    artifact_id: &str,
    version: &str,
    classifier: Option<&str>,
    extension: &str,
) -> String {
    let group_path = group_id.replace('.', "/");
    let file_stem = match classifier {
        Some(c) => format!("{artifact_id}-{version}-{c}"),
        None => format!("{artifact_id}-{version}"),
    };
    format!(
        "{}/{group_path}/{artifact_id}/{version}/{file_stem}.{extension}",
        base.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pep503_canonicalizes_separators() {
        assert_eq!(pep503_canonical_name("Friendly-Bard"), "friendly-bard");
        assert_eq!(pep503_canonical_name("SOMEpackage"), "somepackage");
        assert_eq!(pep503_canonical_name("foo...bar"), "foo-bar");
        assert_eq!(pep503_canonical_name("foo_bar-baz"), "foo-bar-baz");
    }

    #[test]
    fn npm_scoped_package_path_segment() {
        assert_eq!(npm_package_path_segment("@babel/core"), "@babel%2fcore");
        assert_eq!(npm_package_path_segment("lodash"), "lodash");
    }

    #[test]
    fn maven_layout_url_without_classifier() {
        let url = maven_layout_url(
            "https://repo.maven.apache.org/maven2",
            "com.google.guava",
            "guava",
            "31.1-jre",
            None,
            "jar",
        );
        assert_eq!(
            url,
            "https://repo.maven.apache.org/maven2/com/google/guava/guava/31.1-jre/guava-31.1-jre.jar"
        );
    }

    #[test]
    fn maven_layout_url_with_classifier() {
        let url = maven_layout_url(
            "https://repo.maven.apache.org/maven2",
            "com.google.guava",
            "guava",
            "31.1-jre",
            Some("sources"),
            "jar",
        );
        assert!(url.ends_with("guava-31.1-jre-sources.jar"));
    }

    #[test]
    fn yanked_field_parses_bool_and_string_forms() {
        let absent: YankedField = serde_json::from_str("false").unwrap();
        assert!(!absent.is_yanked());
        let reason: YankedField = serde_json::from_str("\"security issue\"").unwrap();
        assert!(reason.is_yanked());
    }

    #[test]
    fn pip_simple_index_parses_pep691_response() {
        let json = r#"{
            "name": "sampleproject",
            "files": [
                {
                    "filename": "sampleproject-1.0.0.tar.gz",
                    "url": "https://files.pythonhosted.org/packages/.../sampleproject-1.0.0.tar.gz",
                    "hashes": {"sha256": "abc123"},
                    "requires-python": ">=3.8"
                }
            ]
        }"#;
        let index: PipSimpleIndex = serde_json::from_str(json).unwrap();
        assert_eq!(index.files.len(), 1);
        assert_eq!(index.files[0].hashes.get("sha256").unwrap(), "abc123");
    }
}
