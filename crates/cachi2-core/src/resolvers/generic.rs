//! generic resolver (§4.12).
//!
//! Ecosystem-agnostic fallback: downloads URL-addressed artifacts named in
//! `artifacts.lock.yaml` (or an explicit `lockfile` path), verifying each
//! against its declared checksum. Maven-layout artifacts (`type: maven`)
//! resolve to a download URL via `cachi2_index_client::maven_layout_url`;
//! everything else names its `download_url` directly.

use std::collections::{BTreeSet, HashSet};

use anyhow::Context;
use cachi2_index_client::maven_layout_url;
use cachi2_types::{Artifact, Component, ComponentType, FoundBy, PackageInput, PackageManager, ResolverResult};
use serde::Deserialize;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

const SUPPORTED_SCHEMA_VERSION: &str = "1.0";

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::Generic { path, lockfile } = input else {
        unreachable!("dispatch only routes Generic inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let lockfile_path = match lockfile {
        Some(explicit) => explicit.clone(),
        None => package_dir.join("artifacts.lock.yaml"),
    };

    let contents = std::fs::read_to_string(&lockfile_path)
        .with_context(|| format!("failed to read {}", lockfile_path.display()))
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let document: LockDocument =
        serde_yaml::from_str(&contents).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    if document.metadata.version != SUPPORTED_SCHEMA_VERSION {
        return Err(Cachi2Error::unsupported(
            format!("artifacts.lock.yaml schema version {}", document.metadata.version),
            format!("only schema version {SUPPORTED_SCHEMA_VERSION} is supported"),
        ));
    }

    let output_dir = ctx.request.pm_output_dir(PackageManager::Generic);
    let client = reqwest::blocking::Client::new();

    let mut components = Vec::new();
    let mut seen_filenames = HashSet::new();

    for entry in &document.artifacts {
        let resolved = resolve_artifact(entry).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

        if !seen_filenames.insert(resolved.filename.clone()) {
            return Err(Cachi2Error::lockfile(
                lockfile_path.clone(),
                format!("filename `{}` is produced by more than one artifact", resolved.filename),
            ));
        }

        let mut checksums = BTreeSet::new();
        checksums.insert(entry.checksum.clone());
        let target_path = output_dir.join(&resolved.filename);
        let artifact = Artifact { url: resolved.url.clone(), vcs_ref: None, checksums, target_path, size_limit: None };

        cachi2_checksum::fetch_one(&client, &artifact, None)
            .map_err(|e| Cachi2Error::fetch(resolved.url.clone(), e.to_string()))?;

        let component = Component::new(
            resolved.display_name,
            resolved.version,
            resolved.purl,
            ComponentType::File,
            FoundBy::Resolver(PackageManager::Generic),
        )
        .with_property("cachi2:distribution_url", resolved.url);
        components.push(component);
    }

    Ok(ResolverResult { components, env: vec![], file_edits: vec![] })
}

struct ResolvedArtifact {
    url: String,
    filename: String,
    purl: String,
    display_name: String,
    version: Option<String>,
}

fn resolve_artifact(entry: &LockArtifact) -> anyhow::Result<ResolvedArtifact> {
    if entry.kind.as_deref() == Some("maven") {
        let attrs = entry
            .attributes
            .as_ref()
            .context("maven artifact has no `attributes`")?;
        let extension = attrs.artifact_type.as_deref().unwrap_or("jar");
        let url = maven_layout_url(
            &attrs.repository_url,
            &attrs.group_id,
            &attrs.artifact_id,
            &attrs.version,
            attrs.classifier.as_deref(),
            extension,
        );
        let filename = url.rsplit('/').next().unwrap_or(&attrs.artifact_id).to_string();
        let mut purl = format!(
            "pkg:maven/{}/{}@{}?repository_url={}&checksum={}",
            attrs.group_id, attrs.artifact_id, attrs.version, attrs.repository_url, entry.checksum
        );
        if let Some(artifact_type) = &attrs.artifact_type {
            purl.push_str(&format!("&type={artifact_type}"));
        }
        return Ok(ResolvedArtifact {
            url,
            filename,
            purl,
            display_name: attrs.artifact_id.clone(),
            version: Some(attrs.version.clone()),
        });
    }

    let download_url = entry.download_url.as_ref().context("artifact has neither `type: maven` nor `download_url`")?;
    let filename = entry
        .filename
        .clone()
        .unwrap_or_else(|| download_url.rsplit('/').next().unwrap_or("artifact").to_string());
    let purl = format!("pkg:generic/{filename}?download_url={download_url}&checksum={}", entry.checksum);
    Ok(ResolvedArtifact {
        url: download_url.clone(),
        filename: filename.clone(),
        purl,
        display_name: filename,
        version: None,
    })
}

#[derive(Debug, Deserialize)]
struct LockDocument {
    metadata: LockMetadata,
    #[serde(default)]
    artifacts: Vec<LockArtifact>,
}

#[derive(Debug, Deserialize)]
struct LockMetadata {
    version: String,
}

#[derive(Debug, Deserialize)]
struct LockArtifact {
    checksum: String,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    attributes: Option<MavenAttributes>,
}

#[derive(Debug, Deserialize)]
struct MavenAttributes {
    repository_url: String,
    group_id: String,
    artifact_id: String,
    version: String,
    #[serde(rename = "type", default)]
    artifact_type: Option<String>,
    #[serde(default)]
    classifier: Option<String>,
}
