//! gomod resolver (§4.6).
//!
//! Drives the Go toolchain inside an isolated `GOPATH`/`GOMODCACHE`/`GOCACHE`
//! rooted at `<output>/deps/gomod`, then parses `go mod download -json` and
//! `go list -json` to enumerate every module and the packages it
//! contributes to the build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use cachi2_environment::SemVer;
use cachi2_process::CommandOutput;
use cachi2_types::{Component, ComponentType, FoundBy, PackageInput, PackageManager, ResolverResult};
use chrono::Utc;
use serde::Deserialize;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::Gomod { path } = input else {
        unreachable!("dispatch only routes Gomod inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let go_mod_path = package_dir.join("go.mod");
    if !go_mod_path.exists() {
        return Err(Cachi2Error::Input {
            message: "go.mod not found".to_string(),
            value: go_mod_path.display().to_string(),
        });
    }

    let go_mod_contents = std::fs::read_to_string(&go_mod_path)
        .map_err(|e| Cachi2Error::tool("go", format!("failed to read go.mod: {e}"), ""))?;
    let declared = parse_go_directive(&go_mod_contents);

    let cache_root = ctx.request.pm_output_dir(PackageManager::Gomod);
    let env = build_environment(ctx, &cache_root, declared.as_ref())?;

    let vendor_dir = package_dir.join("vendor");
    let vendor_nonempty = vendor_dir.is_dir() && std::fs::read_dir(&vendor_dir).map(|mut d| d.next().is_some()).unwrap_or(false);

    if vendor_nonempty {
        verify_vendor_consistency(&package_dir, &env)?;
        let modules = list_modules_vendored(&package_dir, &env)?;
        let packages = list_packages(&package_dir, &env, true)?;
        let go_sum = std::fs::read_to_string(package_dir.join("go.sum")).unwrap_or_default();
        let components = build_components(&modules, &packages, &go_sum);
        return Ok(ResolverResult { components, env: vec![], file_edits: vec![] });
    }

    let modules = download_modules(&package_dir, &env)?;
    let go_sum = std::fs::read_to_string(package_dir.join("go.sum")).unwrap_or_default();

    if ctx.request.flags.force_gomod_tidy {
        run_go(&package_dir, &env, &["mod", "tidy"])?;
    }

    let packages = list_packages(&package_dir, &env, false)?;
    let components = build_components(&modules, &packages, &go_sum);

    Ok(ResolverResult {
        components,
        env: vec![],
        file_edits: vec![],
    })
}

fn build_components(modules: &BTreeMap<String, GoModuleDownload>, packages: &[GoPackage], go_sum: &str) -> Vec<Component> {
    let mut components = Vec::new();
    for module in modules.values() {
        if module.version.is_empty() {
            continue;
        }
        let has_sum = go_sum.lines().any(|line| line.starts_with(&format!("{} ", module.path)));
        let mut component = Component::new(
            module.path.clone(),
            Some(module.version.clone()),
            format!("pkg:golang/{}@{}", module.path, module.version),
            ComponentType::Library,
            FoundBy::Resolver(PackageManager::Gomod),
        );
        if !has_sum {
            component = component.with_property("cachi2:missing_hash:in_file", "go.sum");
        }
        components.push(component);
    }

    for package in packages {
        if package.standard {
            continue;
        }
        let Some(module) = &package.module else { continue };
        components.push(Component::new(
            package.import_path.clone(),
            Some(module.version.clone()),
            format!("pkg:golang/{}@{}", package.import_path, module.version),
            ComponentType::Library,
            FoundBy::Resolver(PackageManager::Gomod),
        ));
    }
    components
}

/// The `go` directive version (`go 1.21` or `go 1.21.3`), if the first
/// matching line parses as a semver-ish triple.
fn parse_go_directive(go_mod: &str) -> Option<SemVer> {
    go_mod
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("go "))
        .and_then(SemVer::parse)
}

struct GomodEnv {
    vars: Vec<(String, String)>,
}

fn build_environment(
    ctx: &ResolveContext,
    cache_root: &Path,
    declared: Option<&SemVer>,
) -> Result<GomodEnv, Cachi2Error> {
    let gopath = cache_root.to_path_buf();
    let gomodcache = cache_root.join("pkg").join("mod");
    let gocache = cache_root.join("cache");

    let mut vars = vec![
        ("GOPATH".to_string(), gopath.display().to_string()),
        ("GOMODCACHE".to_string(), gomodcache.display().to_string()),
        ("GOCACHE".to_string(), gocache.display().to_string()),
        ("GOFLAGS".to_string(), "-mod=mod".to_string()),
    ];

    if ctx.request.flags.gomod_cgo_disable {
        vars.push(("CGO_ENABLED".to_string(), "0".to_string()));
    }

    if let Some(declared) = declared
        && declared.major >= 1
        && (declared.major, declared.minor) >= (1, 21)
    {
        let host = cachi2_environment::detect(PackageManager::Gomod)
            .ok()
            .flatten()
            .and_then(|t| t.parsed);

        let clamped = match host {
            Some(host_version) if host_version.minor == declared.minor && declared.patch > host_version.patch => {
                ctx.events.warning(
                    format!(
                        "go.mod requests {}.{}.{} but host ceiling is {}.{}.{}; clamping",
                        declared.major, declared.minor, declared.patch,
                        host_version.major, host_version.minor, host_version.patch
                    ),
                    Utc::now(),
                );
                format!("{}.{}.{}", host_version.major, host_version.minor, host_version.patch)
            }
            _ => format!("{}.{}.{}", declared.major, declared.minor, declared.patch),
        };
        vars.push(("GOTOOLCHAIN".to_string(), format!("go{clamped}+auto")));
    }

    Ok(GomodEnv { vars })
}

fn run_go(dir: &Path, env: &GomodEnv, args: &[&str]) -> Result<CommandOutput, Cachi2Error> {
    run_go_capturing(dir, env, args)
}

fn run_go_capturing(dir: &Path, env: &GomodEnv, args: &[&str]) -> Result<CommandOutput, Cachi2Error> {
    cachi2_process::run_command_with_env("go", args, dir, &env.vars)
        .map_err(|e| Cachi2Error::tool("go", e.to_string(), ""))
        .and_then(|result| {
            if result.success {
                Ok(CommandOutput {
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    timed_out: false,
                    duration: std::time::Duration::from_millis(result.duration_ms),
                })
            } else {
                Err(Cachi2Error::tool("go", format!("go {} failed", args.join(" ")), result.stderr))
            }
        })
}

fn verify_vendor_consistency(package_dir: &Path, env: &GomodEnv) -> Result<(), Cachi2Error> {
    let scratch = tempfile::tempdir().map_err(|e| Cachi2Error::tool("go", e.to_string(), ""))?;
    copy_dir_recursive(package_dir, scratch.path()).map_err(|e| Cachi2Error::tool("go", e.to_string(), ""))?;
    run_go(scratch.path(), env, &["mod", "vendor"])?;

    let original_vendor = package_dir.join("vendor");
    let regenerated_vendor = scratch.path().join("vendor");
    if !dirs_match(&original_vendor, &regenerated_vendor).map_err(|e| Cachi2Error::tool("go", e.to_string(), ""))? {
        return Err(Cachi2Error::unsupported(
            "Go vendor/ divergence",
            "run `go mod vendor` locally and commit the result before retrying",
        ));
    }
    Ok(())
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from)?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn dirs_match(a: &Path, b: &Path) -> Result<bool> {
    let names_a = relative_file_set(a)?;
    let names_b = relative_file_set(b)?;
    if names_a != names_b {
        return Ok(false);
    }
    for rel in names_a {
        if std::fs::read(a.join(&rel))? != std::fs::read(b.join(&rel))? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn relative_file_set(root: &Path) -> Result<std::collections::BTreeSet<PathBuf>> {
    let mut set = std::collections::BTreeSet::new();
    if !root.exists() {
        return Ok(set);
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            set.insert(entry.path().strip_prefix(root)?.to_path_buf());
        }
    }
    Ok(set)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoModuleDownload {
    path: String,
    #[serde(default)]
    version: String,
}

fn download_modules(package_dir: &Path, env: &GomodEnv) -> Result<BTreeMap<String, GoModuleDownload>, Cachi2Error> {
    let output = run_go(package_dir, env, &["mod", "download", "-json"])?;
    let mut modules = BTreeMap::new();
    for value in serde_json::Deserializer::from_str(&output.stdout).into_iter::<GoModuleDownload>() {
        let module = value.map_err(|e| Cachi2Error::lockfile(package_dir.join("go.mod"), e.to_string()))?;
        modules.insert(module.path.clone(), module);
    }
    Ok(modules)
}

/// Enumerates modules from the committed `vendor/` tree via `-mod=vendor`,
/// never touching the module cache the way `download_modules` does — the
/// vendored case is already offline, there's nothing to download.
fn list_modules_vendored(package_dir: &Path, env: &GomodEnv) -> Result<BTreeMap<String, GoModuleDownload>, Cachi2Error> {
    let output = run_go(package_dir, env, &["list", "-mod=vendor", "-m", "-json", "all"])?;
    let mut modules = BTreeMap::new();
    for value in serde_json::Deserializer::from_str(&output.stdout).into_iter::<GoModuleDownload>() {
        let module = value.map_err(|e| Cachi2Error::lockfile(package_dir.join("go.mod"), e.to_string()))?;
        modules.insert(module.path.clone(), module);
    }
    Ok(modules)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoPackage {
    import_path: String,
    #[serde(default)]
    standard: bool,
    #[serde(default)]
    module: Option<GoModuleRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoModuleRef {
    version: String,
}

fn list_packages(package_dir: &Path, env: &GomodEnv, vendor: bool) -> Result<Vec<GoPackage>, Cachi2Error> {
    let mut args = vec!["list", "-deps"];
    if vendor {
        args.push("-mod=vendor");
    }
    args.push("-json=ImportPath,Module,Standard,Deps");
    args.push("./...");
    let output = run_go(package_dir, env, &args)?;
    let mut packages = Vec::new();
    for value in serde_json::Deserializer::from_str(&output.stdout).into_iter::<GoPackage>() {
        packages.push(value.map_err(|e| Cachi2Error::lockfile(package_dir.join("go.mod"), e.to_string()))?);
    }
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_go_directive_reads_major_minor_patch() {
        let go_mod = "module example.com/foo\n\ngo 1.21.3\n";
        let version = parse_go_directive(go_mod).unwrap();
        assert_eq!((version.major, version.minor, version.patch), (1, 21, 3));
    }

    #[test]
    fn parse_go_directive_fills_missing_patch() {
        let go_mod = "module example.com/foo\n\ngo 1.21\n";
        let version = parse_go_directive(go_mod).unwrap();
        assert_eq!((version.major, version.minor, version.patch), (1, 21, 0));
    }

    #[test]
    fn dirs_match_detects_content_divergence() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("x.go"), "package a").unwrap();
        std::fs::write(b.path().join("x.go"), "package b").unwrap();
        assert!(!dirs_match(a.path(), b.path()).unwrap());
    }

    #[test]
    fn dirs_match_true_for_identical_trees() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("x.go"), "package a").unwrap();
        std::fs::write(b.path().join("x.go"), "package a").unwrap();
        assert!(dirs_match(a.path(), b.path()).unwrap());
    }

    #[test]
    fn build_components_skips_main_module_with_no_version() {
        let mut modules = BTreeMap::new();
        modules.insert("example.com/foo".to_string(), GoModuleDownload { path: "example.com/foo".to_string(), version: String::new() });
        modules.insert(
            "example.com/bar".to_string(),
            GoModuleDownload { path: "example.com/bar".to_string(), version: "v1.2.3".to_string() },
        );
        let components = build_components(&modules, &[], "example.com/bar v1.2.3 h1:abc=\n");
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "example.com/bar");
    }

    #[test]
    fn build_components_flags_missing_go_sum_entry() {
        let mut modules = BTreeMap::new();
        modules.insert(
            "example.com/bar".to_string(),
            GoModuleDownload { path: "example.com/bar".to_string(), version: "v1.2.3".to_string() },
        );
        let components = build_components(&modules, &[], "");
        assert!(components[0].properties.iter().any(|(k, _)| k == "cachi2:missing_hash:in_file"));
    }
}
