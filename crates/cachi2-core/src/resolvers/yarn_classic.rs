//! yarn Classic resolver (§4.9).
//!
//! Detected by a `# yarn lockfile v1` header. Drives the real `yarn`
//! binary against an offline mirror so it never reaches the network, then
//! parses `yarn.lock` directly for the SBOM (the same file `yarn` was just
//! pointed at, so there's nothing left to reconcile).

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use cachi2_types::{Component, ComponentType, EnvVar, FoundBy, PackageInput, PackageManager, ResolverResult};
use chrono::Utc;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

const LOCKFILE_HEADER: &str = "# yarn lockfile v1";

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::YarnClassic { path } = input else {
        unreachable!("dispatch only routes YarnClassic inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let lockfile_path = package_dir.join("yarn.lock");
    let contents = std::fs::read_to_string(&lockfile_path)
        .with_context(|| format!("failed to read {}", lockfile_path.display()))
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    if !contents.lines().take(3).any(|line| line.trim() == LOCKFILE_HEADER) {
        return Err(Cachi2Error::Input {
            message: "not a yarn Classic (v1) lockfile".to_string(),
            value: lockfile_path.display().to_string(),
        });
    }

    reject_pnp(&package_dir)?;
    detect_mirror_override_asymmetry(ctx, &package_dir);

    let output_dir = ctx.request.pm_output_dir(PackageManager::YarnClassic);
    let mirror_dir = output_dir.join("offline-mirror");
    std::fs::create_dir_all(&mirror_dir)
        .map_err(|e| Cachi2Error::tool("yarn", format!("failed to create offline mirror dir: {e}"), String::new()))?;

    let env = build_time_env(&mirror_dir);
    let install = cachi2_process::run_command_with_env(
        "yarn",
        &[
            "install",
            "--no-default-rc",
            "--frozen-lockfile",
            "--disable-pnp",
            "--ignore-engines",
        ],
        &package_dir,
        &env,
    )
    .map_err(|e| Cachi2Error::tool("yarn", e.to_string(), String::new()))?;
    if !install.success {
        return Err(Cachi2Error::tool("yarn", "yarn install failed".to_string(), install.stderr));
    }

    let entries = parse_yarn_lock_v1(&contents).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let mut components = Vec::new();
    for entry in entries {
        let component = classify_entry(&entry).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
        components.push(component);
    }

    Ok(ResolverResult {
        components,
        env: vec![
            EnvVar { name: "YARN_YARN_OFFLINE_MIRROR".to_string(), value: mirror_dir.display().to_string() },
            EnvVar { name: "YARN_IGNORE_SCRIPTS".to_string(), value: "true".to_string() },
        ],
        file_edits: vec![],
    })
}

fn build_time_env(mirror_dir: &Path) -> Vec<(String, String)> {
    vec![
        ("YARN_YARN_OFFLINE_MIRROR".to_string(), mirror_dir.display().to_string()),
        ("YARN_YARN_OFFLINE_MIRROR_PRUNING".to_string(), "false".to_string()),
        ("YARN_IGNORE_PATH".to_string(), "true".to_string()),
        ("YARN_IGNORE_SCRIPTS".to_string(), "true".to_string()),
        ("COREPACK_ENABLE_PROJECT_SPEC".to_string(), "0".to_string()),
        ("YARN_GLOBAL_FOLDER".to_string(), mirror_dir.join("global").display().to_string()),
        ("YARN_ENABLE_GLOBAL_CACHE".to_string(), "false".to_string()),
        ("YARN_ENABLE_MIRROR".to_string(), "true".to_string()),
        ("YARN_ENABLE_IMMUTABLE_CACHE".to_string(), "false".to_string()),
    ]
}

/// Plug'n'Play skips `node_modules` entirely in favor of `.pnp.cjs`/`.pnp.js`
/// resolution data, which the offline-mirror install this resolver drives
/// never produces; a PnP project must be refused the same way yarn Berry's
/// Zero-Install mode is.
fn reject_pnp(package_dir: &Path) -> Result<(), Cachi2Error> {
    if package_dir.join(".pnp.cjs").is_file() || package_dir.join(".pnp.js").is_file() {
        return Err(Cachi2Error::unsupported(
            "yarn Classic Plug'n'Play",
            "remove `.pnp.cjs`/`.pnp.js` and set `nodeLinker: node-modules` before retrying",
        ));
    }

    for rc_file in [".yarnrc", ".npmrc"] {
        let rc_path = package_dir.join(rc_file);
        if let Ok(contents) = std::fs::read_to_string(&rc_path)
            && contents.lines().any(|line| {
                let line = line.trim();
                line.starts_with("nodeLinker") && line.contains("pnp") || line == "pnp true" || line.starts_with("pnp ") && line.ends_with("true")
            })
        {
            return Err(Cachi2Error::unsupported(
                "yarn Classic Plug'n'Play",
                "remove the `pnp`/`nodeLinker: pnp` setting before retrying",
            ));
        }
    }

    Ok(())
}

/// Warns (rather than fails) when `.yarnrc`/`.npmrc` declare a mirror or
/// registry override that the isolated environment above will shadow —
/// builds still succeed, but a developer relying on the override locally
/// may be surprised it's silently ignored in a hermetic build.
fn detect_mirror_override_asymmetry(ctx: &ResolveContext, package_dir: &Path) {
    for rc_file in [".yarnrc", ".npmrc"] {
        let rc_path = package_dir.join(rc_file);
        if let Ok(contents) = std::fs::read_to_string(&rc_path)
            && (contents.contains("registry") || contents.contains("offline-mirror"))
        {
            ctx.events.warning(
                format!("{rc_file} declares a registry/mirror override that the hermetic build environment overrides"),
                Utc::now(),
            );
        }
    }
}

#[derive(Debug)]
struct LockEntry {
    name: String,
    version: String,
    resolved: String,
}

fn parse_yarn_lock_v1(contents: &str) -> anyhow::Result<Vec<LockEntry>> {
    let mut entries = Vec::new();
    let mut current_name: Option<String> = None;
    let mut version = None;
    let mut resolved = None;

    for raw_line in contents.lines() {
        if raw_line.starts_with('#') || raw_line.trim().is_empty() {
            continue;
        }
        let indent = raw_line.len() - raw_line.trim_start().len();
        let trimmed = raw_line.trim();

        if indent == 0 && trimmed.ends_with(':') {
            if let (Some(name), Some(v), Some(r)) = (current_name.take(), version.take(), resolved.take()) {
                entries.push(LockEntry { name, version: v, resolved: r });
            }
            let header = trimmed.trim_end_matches(':');
            let first_spec = header.split(", ").next().unwrap_or(header).trim_matches('"');
            current_name = first_spec.rsplit_once('@').map(|(n, _)| n.to_string());
        } else if indent == 2 && trimmed.starts_with("version ") {
            version = Some(trimmed.trim_start_matches("version ").trim_matches('"').to_string());
        } else if indent == 2 && trimmed.starts_with("resolved ") {
            resolved = Some(trimmed.trim_start_matches("resolved ").trim_matches('"').to_string());
        }
    }
    if let (Some(name), Some(v), Some(r)) = (current_name, version, resolved) {
        entries.push(LockEntry { name, version: v, resolved: r });
    }
    Ok(entries)
}

fn classify_entry(entry: &LockEntry) -> anyhow::Result<Component> {
    let purl = if entry.resolved.starts_with("https://registry.yarnpkg.com/") || entry.resolved.starts_with("https://registry.npmjs.org/") {
        format!("pkg:npm/{}@{}", entry.name.replace('/', "%2F"), entry.version)
    } else {
        anyhow::bail!("unsupported yarn Classic resolved protocol for {}: {} (git/github/exec sources are refused)", entry.name, entry.resolved);
    };

    let checksum = entry
        .resolved
        .split_once('#')
        .map(|(_, sha1)| sha1.to_string());

    let mut component = Component::new(
        entry.name.clone(),
        Some(entry.version.clone()),
        purl,
        ComponentType::Library,
        FoundBy::Resolver(PackageManager::YarnClassic),
    );
    if checksum.is_none() {
        component = component.with_property("cachi2:missing_hash:in_file", "yarn.lock");
    }
    Ok(component)
}
