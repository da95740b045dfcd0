//! yarn Berry resolver (§4.9).
//!
//! Detected by a top-level `__metadata:` mapping in `yarn.lock`. Zero-Install
//! repositories (`.yarn/unplugged` present) are rejected outright — a
//! hermetic fetch makes no sense when the dependencies are already
//! unpacked and committed. Otherwise this disables every plugin but the
//! vendored `exec`, installs with `--mode=skip-build`, and reads back
//! `yarn info --all --recursive --cache --json` for the SBOM.

use std::path::Path;

use anyhow::Context;
use cachi2_pathguard::confine;
use cachi2_types::{Component, ComponentType, EnvVar, FoundBy, PackageInput, PackageManager, ResolverResult};
use serde::Deserialize;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::YarnBerry { path } = input else {
        unreachable!("dispatch only routes YarnBerry inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let lockfile_path = package_dir.join("yarn.lock");
    let contents = std::fs::read_to_string(&lockfile_path)
        .with_context(|| format!("failed to read {}", lockfile_path.display()))
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    if !contents.lines().any(|line| line.trim_start() == "__metadata:") {
        return Err(Cachi2Error::Input {
            message: "not a yarn Berry lockfile (no `__metadata:` block)".to_string(),
            value: lockfile_path.display().to_string(),
        });
    }

    if package_dir.join(".yarn").join("unplugged").is_dir() {
        return Err(Cachi2Error::unsupported(
            "Zero-Install",
            "remove `.yarn/unplugged` and `.pnp.cjs` or switch the project to non-Zero-Install mode",
        ));
    }

    validate_yarnrc_paths(ctx, &package_dir)?;

    let output_dir = ctx.request.pm_output_dir(PackageManager::YarnBerry);
    let cache_dir = output_dir.join("cache");
    std::fs::create_dir_all(&cache_dir)
        .map_err(|e| Cachi2Error::tool("yarn", format!("failed to create cache dir: {e}"), String::new()))?;

    let env = build_time_env(&cache_dir);

    let install = cachi2_process::run_command_with_env("yarn", &["install", "--mode=skip-build"], &package_dir, &env)
        .map_err(|e| Cachi2Error::tool("yarn", e.to_string(), String::new()))?;
    if !install.success {
        return Err(Cachi2Error::tool("yarn", "yarn install failed".to_string(), install.stderr));
    }

    let info = cachi2_process::run_command_with_env(
        "yarn",
        &["info", "--all", "--recursive", "--cache", "--json"],
        &package_dir,
        &env,
    )
    .map_err(|e| Cachi2Error::tool("yarn", e.to_string(), String::new()))?;
    if !info.success {
        return Err(Cachi2Error::tool("yarn", "yarn info failed".to_string(), info.stderr));
    }

    let mut components = Vec::new();
    for line in info.stdout.lines().filter(|l| !l.trim().is_empty()) {
        let record: YarnInfoRecord =
            serde_json::from_str(line).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;
        components.push(classify_record(&record).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?);
    }

    Ok(ResolverResult {
        components,
        env: vec![EnvVar { name: "YARN_ENABLE_NETWORK".to_string(), value: "false".to_string() }],
        file_edits: vec![],
    })
}

fn build_time_env(cache_dir: &Path) -> Vec<(String, String)> {
    vec![
        ("YARN_GLOBAL_FOLDER".to_string(), cache_dir.join("global").display().to_string()),
        ("YARN_ENABLE_GLOBAL_CACHE".to_string(), "false".to_string()),
        ("YARN_CACHE_FOLDER".to_string(), cache_dir.display().to_string()),
        ("YARN_ENABLE_MIRROR".to_string(), "true".to_string()),
        ("YARN_ENABLE_IMMUTABLE_CACHE".to_string(), "false".to_string()),
        ("YARN_IGNORE_PATH".to_string(), "true".to_string()),
        ("YARN_ENABLE_SCRIPTS".to_string(), "false".to_string()),
        ("YARN_PLUGINS".to_string(), "exec".to_string()),
    ]
}

fn validate_yarnrc_paths(ctx: &ResolveContext, package_dir: &Path) -> Result<(), Cachi2Error> {
    let yarnrc_path = package_dir.join(".yarnrc.yml");
    let Ok(contents) = std::fs::read_to_string(&yarnrc_path) else { return Ok(()) };

    let relative_package_dir = package_dir
        .strip_prefix(&ctx.request.source_dir)
        .unwrap_or(Path::new(""));

    for line in contents.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("cacheFolder:").or_else(|| trimmed.strip_prefix("pnpDataPath:")) {
            let declared = Path::new(rest.trim().trim_matches('"'));
            if declared.is_relative() {
                let candidate = relative_package_dir.join(declared);
                confine(&ctx.request.source_dir, &candidate)
                    .map_err(|e| Cachi2Error::Input { message: e.to_string(), value: declared.display().to_string() })?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct YarnInfoRecord {
    value: String,
    #[serde(default)]
    children: YarnInfoChildren,
}

#[derive(Debug, Default, Deserialize)]
struct YarnInfoChildren {
    #[serde(rename = "Version", default)]
    version: Option<String>,
    #[serde(rename = "Cache", default)]
    cache: Option<YarnInfoCache>,
}

#[derive(Debug, Deserialize)]
struct YarnInfoCache {
    #[serde(rename = "Checksum", default)]
    checksum: Option<String>,
}

fn classify_record(record: &YarnInfoRecord) -> anyhow::Result<Component> {
    let (name, locator) = record
        .value
        .split_once('@')
        .map(|(name, rest)| (name.to_string(), rest.to_string()))
        .context("yarn info record has no `@` separator")?;

    let version = record.children.version.clone().unwrap_or_default();

    let purl = if locator.starts_with("npm:") {
        format!("pkg:npm/{}@{version}", name.replace('/', "%2F"))
    } else if locator.starts_with("workspace:") || locator.starts_with("patch:") || locator.starts_with("file:") || locator.starts_with("portal:") || locator.starts_with("link:") {
        format!("pkg:npm/{}@{version}?vcs_url=", name.replace('/', "%2F"))
    } else if locator.starts_with("https://") && locator.ends_with(".tar.gz") {
        format!("pkg:npm/{}@{version}?download_url={locator}", name.replace('/', "%2F"))
    } else {
        anyhow::bail!("unsupported yarn Berry locator for {name}: {locator}");
    };

    let mut component = Component::new(name, Some(version), purl, ComponentType::Library, FoundBy::Resolver(PackageManager::YarnBerry));
    if record.children.cache.as_ref().and_then(|c| c.checksum.as_ref()).is_none() {
        component = component.with_property("cachi2:missing_hash:in_file", "yarn.lock");
    }
    Ok(component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_npm_locator() {
        let record = YarnInfoRecord {
            value: "left-pad@npm:1.3.0".to_string(),
            children: YarnInfoChildren { version: Some("1.3.0".to_string()), cache: Some(YarnInfoCache { checksum: Some("abc".to_string()) }) },
        };
        let component = classify_record(&record).unwrap();
        assert!(component.purl.starts_with("pkg:npm/left-pad@1.3.0"));
    }

    #[test]
    fn rejects_exec_locator() {
        let record = YarnInfoRecord {
            value: "foo@exec:./build.js".to_string(),
            children: YarnInfoChildren::default(),
        };
        assert!(classify_record(&record).is_err());
    }

    #[test]
    fn rejects_git_locator() {
        let record = YarnInfoRecord {
            value: "foo@git:https://github.com/a/b.git".to_string(),
            children: YarnInfoChildren::default(),
        };
        assert!(classify_record(&record).is_err());
    }
}
