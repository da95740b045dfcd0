//! npm resolver (§4.8).
//!
//! Walks every `packages.<path>` entry of `package-lock.json` v2/v3 (v1 is
//! rejected outright — it carries no `packages` map to walk), classifies
//! each by its locator scheme, fetches into `<output>/deps/npm/`, and
//! rewrites the lockfile's `resolved` fields to local `file://` paths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use base64::Engine;
use cachi2_types::{Artifact, Component, ComponentType, EnvVar, FileEdit, FoundBy, PackageInput, PackageManager, ResolverResult};
use serde_json::Value;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::Npm { path } = input else {
        unreachable!("dispatch only routes Npm inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let lockfile_path = package_dir.join("package-lock.json");
    let contents = std::fs::read_to_string(&lockfile_path)
        .with_context(|| format!("failed to read {}", lockfile_path.display()))
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let mut document: Value =
        serde_json::from_str(&contents).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let lockfile_version = document.get("lockfileVersion").and_then(Value::as_i64).unwrap_or(1);
    if lockfile_version < 2 {
        return Err(Cachi2Error::unsupported(
            "npm lockfile v1",
            "regenerate package-lock.json with a current npm to produce a v2/v3 lockfile",
        ));
    }

    let output_dir = ctx.request.pm_output_dir(PackageManager::Npm);
    let packages = document
        .get("packages")
        .and_then(Value::as_object)
        .cloned()
        .with_context(|| "package-lock.json has no `packages` map")
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let dev_flags = compute_dev_flags(&packages);

    let mut components = Vec::new();
    let mut rewrites: BTreeMap<String, String> = BTreeMap::new();
    let mut strip_integrity: BTreeSet<String> = BTreeSet::new();

    for (node_path, entry) in &packages {
        if node_path.is_empty() {
            continue; // the root project entry
        }
        let Some(name) = package_name_from_node_path(node_path) else { continue };
        let Some(version) = entry.get("version").and_then(Value::as_str) else { continue };

        if entry.get("link").and_then(Value::as_bool).unwrap_or(false) {
            continue; // workspace symlink entries carry no fetch of their own
        }

        let resolved = entry.get("resolved").and_then(Value::as_str);
        let integrity = entry.get("integrity").and_then(Value::as_str);

        let (component, rewritten_resolved, artifact) = match resolved {
            Some(url) if url.starts_with("https://registry.npmjs.org/") => {
                let tarball_name = url.rsplit('/').next().unwrap_or(name).to_string();
                let target_path = output_dir.join(&tarball_name);
                let checksum = integrity
                    .map(sri_to_checksum)
                    .transpose()
                    .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
                let mut checksums = BTreeSet::new();
                if let Some(c) = &checksum {
                    checksums.insert(c.clone());
                }
                let purl = npm_purl(name, version, None);
                let component = Component::new(name, Some(version.to_string()), purl, ComponentType::Library, FoundBy::Resolver(PackageManager::Npm))
                    .with_npm_role(&dev_flags, node_path);
                let rewritten = format!("file://{}", target_path.display());
                let artifact = Artifact {
                    url: url.to_string(),
                    vcs_ref: None,
                    checksums,
                    target_path,
                    size_limit: None,
                };
                (component, Some(rewritten), Some(artifact))
            }
            Some(url) if url.starts_with("https://") || url.starts_with("http://") => {
                let Some(integrity) = integrity else {
                    return Err(Cachi2Error::lockfile(
                        lockfile_path.clone(),
                        format!("{node_path}: HTTPS dependency has no `integrity`"),
                    ));
                };
                let checksum = sri_to_checksum(integrity).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
                let slug = name.replace('/', "-");
                let tarball_name = url.rsplit('/').next().unwrap_or(name).to_string();
                let target_path = output_dir.join(format!("external-{slug}")).join(&tarball_name);
                let mut checksums = BTreeSet::new();
                checksums.insert(checksum.clone());
                let purl = format!("{}?download_url={url}&checksum={checksum}", npm_purl(name, version, None));
                let component = Component::new(name, Some(version.to_string()), purl, ComponentType::Library, FoundBy::Resolver(PackageManager::Npm))
                    .with_npm_role(&dev_flags, node_path);
                let rewritten = format!("file://{}", target_path.display());
                let artifact = Artifact {
                    url: url.to_string(),
                    vcs_ref: None,
                    checksums,
                    target_path,
                    size_limit: None,
                };
                (component, Some(rewritten), Some(artifact))
            }
            Some(url) if url.starts_with("git+") || url.starts_with("git://") => {
                let (repo, commit) = parse_git_locator(url)
                    .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
                let (host, namespace, repo_name) =
                    split_repo_url(&repo).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
                let tarball_name = format!("{name}-external-gitcommit-{commit}.tgz");
                let target_dir = output_dir.join(&host).join(&namespace).join(&repo_name);
                std::fs::create_dir_all(&target_dir)
                    .map_err(|e| Cachi2Error::fetch(repo.clone(), e.to_string()))?;
                let target_path = target_dir.join(&tarball_name);
                cachi2_vcs::fetch_and_archive(&repo, &commit, &target_path)
                    .map_err(|e| Cachi2Error::fetch(repo.clone(), e.to_string()))?;

                let purl = format!("{}?vcs_url=git+{repo}@{commit}", npm_purl(name, version, None));
                let component = Component::new(name, Some(version.to_string()), purl, ComponentType::Library, FoundBy::Resolver(PackageManager::Npm))
                    .with_npm_role(&dev_flags, node_path);
                let rewritten = format!("file://{}", target_path.display());
                strip_integrity.insert(node_path.clone());
                (component, Some(rewritten), None)
            }
            Some(local) if local.starts_with("file:") => {
                let purl = npm_purl(name, version, None);
                let component = Component::new(name, Some(version.to_string()), purl, ComponentType::Library, FoundBy::Resolver(PackageManager::Npm))
                    .with_npm_role(&dev_flags, node_path);
                (component, None, None)
            }
            _ => continue,
        };

        if let Some(rewritten) = rewritten_resolved {
            rewrites.insert(node_path.clone(), rewritten);
        }
        if let Some(artifact) = artifact {
            cachi2_checksum::fetch_one(&reqwest::blocking::Client::new(), &artifact, None)
                .map_err(|e| Cachi2Error::fetch(artifact.url.clone(), e.to_string()))?;
        }
        components.push(component);
    }

    let mut file_edits = Vec::new();
    if !rewrites.is_empty() {
        apply_lockfile_rewrites(&mut document, &rewrites, &strip_integrity);
        let rewritten_json = serde_json::to_string_pretty(&document)
            .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
        std::fs::write(&lockfile_path, rewritten_json + "\n")
            .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
        file_edits.push(FileEdit {
            path: lockfile_path,
            description: "rewrote `resolved` fields to local file:// cache paths".to_string(),
        });
    }

    Ok(ResolverResult {
        components,
        env: vec![EnvVar { name: "NPM_CONFIG_OFFLINE".to_string(), value: "true".to_string() }],
        file_edits,
    })
}

trait NpmRole {
    fn with_npm_role(self, dev_flags: &BTreeMap<String, NpmRoleFlags>, node_path: &str) -> Component;
}

impl NpmRole for Component {
    fn with_npm_role(self, dev_flags: &BTreeMap<String, NpmRoleFlags>, node_path: &str) -> Component {
        let mut component = self;
        if let Some(flags) = dev_flags.get(node_path) {
            if flags.dev {
                component = component.with_property("cdx:npm:package:development", "true");
            }
            if flags.optional {
                component = component.with_property("cdx:npm:package:optional", "true");
            }
            if flags.peer {
                component = component.with_property("cdx:npm:package:peer", "true");
            }
        }
        component
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct NpmRoleFlags {
    dev: bool,
    optional: bool,
    peer: bool,
}

/// A node is `dev` iff every root→node path in the lockfile's `packages` map
/// marks it `dev: true`; npm's own per-entry `dev`/`optional`/`peer` flags
/// already encode this intersection, so this is a direct read rather than a
/// graph walk.
fn compute_dev_flags(packages: &serde_json::Map<String, Value>) -> BTreeMap<String, NpmRoleFlags> {
    packages
        .iter()
        .map(|(node_path, entry)| {
            let flags = NpmRoleFlags {
                dev: entry.get("dev").and_then(Value::as_bool).unwrap_or(false),
                optional: entry.get("optional").and_then(Value::as_bool).unwrap_or(false),
                peer: entry.get("peer").and_then(Value::as_bool).unwrap_or(false),
            };
            (node_path.clone(), flags)
        })
        .collect()
}

fn package_name_from_node_path(node_path: &str) -> Option<&str> {
    node_path.rsplit("node_modules/").next()
}

fn npm_purl(name: &str, version: &str, _unused: Option<&str>) -> String {
    if let Some(rest) = name.strip_prefix('@') {
        format!("pkg:npm/{}@{version}", rest.replacen('/', "/", 1))
    } else {
        format!("pkg:npm/{name}@{version}")
    }
    .replace("pkg:npm/@", "pkg:npm/%40")
}

/// Decodes an SRI `integrity` string (`sha512-<base64>`) into
/// `algorithm:hex`.
fn sri_to_checksum(integrity: &str) -> Result<String> {
    let (algorithm, encoded) = integrity
        .split_once('-')
        .context("integrity string has no `-` separator")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("integrity value is not valid base64")?;
    Ok(format!("{algorithm}:{}", hex::encode(decoded)))
}

fn parse_git_locator(url: &str) -> Result<(String, String)> {
    let without_prefix = url.strip_prefix("git+").unwrap_or(url);
    let (repo, commit) = without_prefix
        .rsplit_once('#')
        .context("git locator has no commit fragment")?;
    Ok((repo.to_string(), commit.to_string()))
}

fn split_repo_url(url: &str) -> Result<(String, String, String)> {
    let trimmed = url.trim_end_matches(".git");
    let without_scheme = trimmed.split_once("://").map(|(_, r)| r).context("git url has no scheme")?;
    let mut parts = without_scheme.splitn(2, '/');
    let host = parts.next().context("git url has no host")?.to_string();
    let rest = parts.next().context("git url has no path")?;
    let (namespace, repo_name) = rest.rsplit_once('/').unwrap_or(("", rest));
    Ok((host, namespace.to_string(), repo_name.to_string()))
}

fn apply_lockfile_rewrites(document: &mut Value, rewrites: &BTreeMap<String, String>, strip_integrity: &BTreeSet<String>) {
    if let Some(packages) = document.get_mut("packages").and_then(Value::as_object_mut) {
        for (node_path, new_resolved) in rewrites {
            if let Some(entry) = packages.get_mut(node_path).and_then(Value::as_object_mut) {
                entry.insert("resolved".to_string(), Value::String(new_resolved.clone()));
                if strip_integrity.contains(node_path) {
                    entry.remove("integrity");
                }
            }
        }
    }
}
