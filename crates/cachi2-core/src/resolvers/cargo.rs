//! cargo resolver (§4.10).
//!
//! Unlike the other resolvers, cargo's own `cargo vendor` already does the
//! fetching and hermetic rewrite: it pulls every locked dependency into a
//! local directory and prints the `[source]` replacement block that routes
//! future builds through it. This resolver runs that subprocess, writes the
//! replacement block to `.cargo/config.toml`, and separately parses
//! `Cargo.lock` for the SBOM.

use cachi2_cargo_support::PackageSource;
use cachi2_types::{Component, ComponentType, EnvVar, FileEdit, FoundBy, PackageInput, PackageManager, ResolverResult};
use std::time::Duration;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

const VENDOR_TIMEOUT: Duration = Duration::from_secs(600);

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::Cargo { path } = input else {
        unreachable!("dispatch only routes Cargo inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let manifest_path = package_dir.join("Cargo.toml");
    let lockfile_path = package_dir.join("Cargo.lock");

    if !manifest_path.exists() {
        return Err(Cachi2Error::Input { message: "Cargo.toml not found".to_string(), value: manifest_path.display().to_string() });
    }
    if !lockfile_path.exists() {
        return Err(Cachi2Error::Input { message: "Cargo.lock not found".to_string(), value: lockfile_path.display().to_string() });
    }

    let vendor_dir = ctx.request.pm_output_dir(PackageManager::Cargo).join("vendor");
    let output = cachi2_cargo_support::vendor(&package_dir, &vendor_dir, VENDOR_TIMEOUT)
        .map_err(|e| Cachi2Error::tool("cargo", e.to_string(), String::new()))?;
    if !output.success() {
        return Err(Cachi2Error::tool("cargo", "cargo vendor failed".to_string(), output.stderr.clone()));
    }

    let cargo_config_dir = package_dir.join(".cargo");
    std::fs::create_dir_all(&cargo_config_dir)
        .map_err(|e| Cachi2Error::tool("cargo", format!("failed to create .cargo: {e}"), String::new()))?;
    let config_path = cargo_config_dir.join("config.toml");
    std::fs::write(&config_path, &output.stdout)
        .map_err(|e| Cachi2Error::tool("cargo", format!("failed to write .cargo/config.toml: {e}"), String::new()))?;

    let metadata = cachi2_cargo_support::load_metadata(&manifest_path)
        .map_err(|e| Cachi2Error::tool("cargo", format!("failed to read cargo metadata: {e}"), String::new()))?;
    let workspace_root_name = metadata.root_package().map(|p| p.name.to_string());

    let locked = cachi2_cargo_support::parse_lockfile(&lockfile_path)
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let mut components = Vec::new();
    let mut emitted_workspace_root = false;
    for package in &locked {
        let Some(source) = &package.source else {
            if !emitted_workspace_root && workspace_root_name.as_deref() == Some(package.name.as_str()) {
                emitted_workspace_root = true;
                components.push(Component::new(
                    package.name.clone(),
                    Some(package.version.clone()),
                    package.purl(),
                    ComponentType::Library,
                    FoundBy::Resolver(PackageManager::Cargo),
                ));
            }
            continue;
        };
        let mut component = Component::new(
            package.name.clone(),
            Some(package.version.clone()),
            package.purl(),
            ComponentType::Library,
            FoundBy::Resolver(PackageManager::Cargo),
        );
        if matches!(source, PackageSource::CratesIo) && package.checksum.is_none() {
            component = component.with_property("cachi2:missing_hash:in_file", "Cargo.lock");
        }
        components.push(component);
    }

    Ok(ResolverResult {
        components,
        env: vec![EnvVar { name: "CARGO_NET_OFFLINE".to_string(), value: "true".to_string() }],
        file_edits: vec![FileEdit {
            path: config_path,
            description: "added vendored-sources replacement pointing at the cargo vendor directory".to_string(),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachi2_cargo_support::LockedPackage;

    fn locked(name: &str, source: Option<PackageSource>) -> LockedPackage {
        LockedPackage { name: name.to_string(), version: "0.1.0".to_string(), source, checksum: None }
    }

    #[test]
    fn workspace_root_is_emitted_exactly_once_among_sourceless_packages() {
        let locked_packages = vec![
            locked("my-workspace-crate", None),
            locked("my-workspace-crate-other-member", None),
            locked("serde", Some(PackageSource::CratesIo)),
        ];
        let workspace_root_name = Some("my-workspace-crate".to_string());

        let mut emitted_workspace_root = false;
        let mut emitted = Vec::new();
        for package in &locked_packages {
            let Some(_source) = &package.source else {
                if !emitted_workspace_root && workspace_root_name.as_deref() == Some(package.name.as_str()) {
                    emitted_workspace_root = true;
                    emitted.push(package.name.clone());
                }
                continue;
            };
            emitted.push(package.name.clone());
        }

        assert_eq!(emitted, vec!["my-workspace-crate".to_string(), "serde".to_string()]);
    }
}
