//! bundler resolver (§4.11).
//!
//! Never shells out to `bundle install`; parses `Gemfile.lock` directly.
//! `GEM` specs are downloaded as `.gem` files from rubygems.org, `GIT` specs
//! are VCS-fetched and unpacked, and `PATH` specs are confirmed to resolve
//! inside the source tree (never fetched — they're already local).

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use cachi2_pathguard::confine_existing;
use cachi2_types::{Artifact, Component, ComponentType, EnvVar, FileEdit, FoundBy, PackageInput, PackageManager, ResolverResult};

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

const RUBYGEMS_REMOTE: &str = "https://rubygems.org/";

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::Bundler { path, allow_binary } = input else {
        unreachable!("dispatch only routes Bundler inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let lockfile_path = package_dir.join("Gemfile.lock");
    let contents = std::fs::read_to_string(&lockfile_path)
        .with_context(|| format!("failed to read {}", lockfile_path.display()))
        .map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let document = parse_gemfile_lock(&contents).map_err(|e| Cachi2Error::lockfile(lockfile_path.clone(), e.to_string()))?;

    let output_dir = ctx.request.pm_output_dir(PackageManager::Bundler);
    let vendor_cache = output_dir.join("vendor").join("cache");
    std::fs::create_dir_all(&vendor_cache)
        .map_err(|e| Cachi2Error::tool("bundler", format!("failed to create vendor/cache: {e}"), String::new()))?;

    let mut components = Vec::new();
    let mut env = vec![
        EnvVar { name: "BUNDLE_CACHE_PATH".to_string(), value: vendor_cache.display().to_string() },
        EnvVar { name: "BUNDLE_DEPLOYMENT".to_string(), value: "true".to_string() },
        EnvVar { name: "BUNDLE_NO_PRUNE".to_string(), value: "true".to_string() },
        EnvVar { name: "BUNDLE_ALLOW_OFFLINE_INSTALL".to_string(), value: "true".to_string() },
        EnvVar { name: "BUNDLE_DISABLE_VERSION_CHECK".to_string(), value: "true".to_string() },
    ];

    for spec in &document.gem_specs {
        if !allow_binary && spec.platform_specific {
            continue;
        }
        let filename = format!("{}-{}.gem", spec.name, spec.version);
        let url = format!("{RUBYGEMS_REMOTE}gems/{filename}");
        let target_path = vendor_cache.join(&filename);
        let artifact = Artifact { url: url.clone(), vcs_ref: None, checksums: BTreeSet::new(), target_path, size_limit: None };
        cachi2_checksum::fetch_one(&reqwest::blocking::Client::new(), &artifact, None)
            .map_err(|e| Cachi2Error::fetch(url.clone(), e.to_string()))?;

        let component = Component::new(
            spec.name.clone(),
            Some(spec.version.clone()),
            format!("pkg:gem/{}@{}", spec.name, spec.version),
            ComponentType::Library,
            FoundBy::Resolver(PackageManager::Bundler),
        )
        .with_property("cachi2:missing_hash:in_file", "Gemfile.lock");
        components.push(component);
    }

    for git_source in &document.git_sources {
        let short_revision = &git_source.revision[..12.min(git_source.revision.len())];
        for spec in &git_source.specs {
            let dir_name = format!("{}-{short_revision}", spec.name);
            let target_dir = vendor_cache.join(&dir_name);
            let archive_path = output_dir.join(format!("{dir_name}.tar.gz"));

            cachi2_vcs::fetch_and_archive(&git_source.remote, &git_source.revision, &archive_path)
                .map_err(|e| Cachi2Error::fetch(git_source.remote.clone(), e.to_string()))?;
            extract_tar_gz(&archive_path, &target_dir)
                .map_err(|e| Cachi2Error::fetch(git_source.remote.clone(), e.to_string()))?;

            env.push(EnvVar {
                name: format!("BUNDLE_LOCAL__{}", spec.name.to_ascii_uppercase().replace('-', "_")),
                value: target_dir.display().to_string(),
            });

            let component = Component::new(
                spec.name.clone(),
                Some(spec.version.clone()),
                format!("pkg:gem/{}@{}?vcs_url=git+{}@{}", spec.name, spec.version, git_source.remote, git_source.revision),
                ComponentType::Library,
                FoundBy::Resolver(PackageManager::Bundler),
            );
            components.push(component);
        }
    }

    if !document.git_sources.is_empty() {
        env.push(EnvVar { name: "BUNDLE_DISABLE_LOCAL_BRANCH_CHECK".to_string(), value: "true".to_string() });
        env.push(EnvVar { name: "BUNDLE_DISABLE_LOCAL_REVISION_CHECK".to_string(), value: "true".to_string() });
    }

    if !document.path_sources.is_empty() {
        let (origin, head) = repo_origin_and_head(&ctx.request.source_dir)
            .map_err(|e| Cachi2Error::tool("git", e.to_string(), String::new()))?;
        for path_source in &document.path_sources {
            let relative_gem_dir = path.as_path().join(&path_source.remote);
            let confined = confine_existing(&ctx.request.source_dir, &relative_gem_dir)
                .map_err(|e| Cachi2Error::Input { message: e.to_string(), value: relative_gem_dir.display().to_string() })?;
            let subpath = confined
                .strip_prefix(&ctx.request.source_dir)
                .unwrap_or(&confined)
                .display()
                .to_string();
            for spec in &path_source.specs {
                components.push(Component::new(
                    spec.name.clone(),
                    Some(spec.version.clone()),
                    format!("pkg:gem/{}@{}?vcs_url=git+{origin}@{head}#{subpath}", spec.name, spec.version),
                    ComponentType::Library,
                    FoundBy::Resolver(PackageManager::Bundler),
                ));
            }
        }
    }

    let bundle_config_dir = output_dir.join(".bundle");
    std::fs::create_dir_all(&bundle_config_dir)
        .map_err(|e| Cachi2Error::tool("bundler", format!("failed to create .bundle: {e}"), String::new()))?;
    let bundle_config_path = bundle_config_dir.join("config");
    std::fs::write(&bundle_config_path, render_bundle_config(&vendor_cache))
        .map_err(|e| Cachi2Error::tool("bundler", format!("failed to write .bundle/config: {e}"), String::new()))?;
    env.push(EnvVar { name: "BUNDLE_APP_CONFIG".to_string(), value: bundle_config_dir.display().to_string() });

    Ok(ResolverResult {
        components,
        env,
        file_edits: vec![FileEdit {
            path: bundle_config_path,
            description: "wrote a bundler config pointing installs at the vendored gem cache".to_string(),
        }],
    })
}

#[derive(Debug, Default)]
struct GemfileLock {
    gem_specs: Vec<GemSpec>,
    git_sources: Vec<GitSource>,
    path_sources: Vec<PathSource>,
}

#[derive(Debug)]
struct GemSpec {
    name: String,
    version: String,
    platform_specific: bool,
}

#[derive(Debug)]
struct GitSource {
    remote: String,
    revision: String,
    specs: Vec<GemSpec>,
}

#[derive(Debug)]
struct PathSource {
    remote: String,
    specs: Vec<GemSpec>,
}

fn parse_gemfile_lock(contents: &str) -> Result<GemfileLock> {
    let mut document = GemfileLock::default();

    enum Section {
        None,
        Gem,
        Git { remote: String, revision: String, specs: Vec<GemSpec> },
        Path { remote: String, specs: Vec<GemSpec> },
    }

    let mut section = Section::None;

    let flush = |section: Section, document: &mut GemfileLock| {
        match section {
            Section::Git { remote, revision, specs } => document.git_sources.push(GitSource { remote, revision, specs }),
            Section::Path { remote, specs } => document.path_sources.push(PathSource { remote, specs }),
            _ => {}
        }
    };

    for raw_line in contents.lines() {
        if raw_line.is_empty() {
            continue;
        }
        let indent = raw_line.len() - raw_line.trim_start().len();
        let line = raw_line.trim_end();

        if indent == 0 {
            let prev = std::mem::replace(&mut section, Section::None);
            flush(prev, &mut document);
            section = match line.trim() {
                "GEM" => Section::Gem,
                "GIT" => Section::Git { remote: String::new(), revision: String::new(), specs: Vec::new() },
                "PATH" => Section::Path { remote: String::new(), specs: Vec::new() },
                _ => Section::None,
            };
            continue;
        }

        let trimmed = line.trim();
        match &mut section {
            Section::Git { remote, revision, .. } if indent == 2 && trimmed.starts_with("remote:") => {
                *remote = trimmed.trim_start_matches("remote:").trim().to_string();
            }
            Section::Git { revision, .. } if indent == 2 && trimmed.starts_with("revision:") => {
                *revision = trimmed.trim_start_matches("revision:").trim().to_string();
            }
            Section::Path { remote, .. } if indent == 2 && trimmed.starts_with("remote:") => {
                *remote = trimmed.trim_start_matches("remote:").trim().to_string();
            }
            Section::Gem if indent == 4 => {
                if let Some(spec) = parse_spec_line(trimmed) {
                    document.gem_specs.push(spec);
                }
            }
            Section::Git { specs, .. } if indent == 4 => {
                if let Some(spec) = parse_spec_line(trimmed) {
                    specs.push(spec);
                }
            }
            Section::Path { specs, .. } if indent == 4 => {
                if let Some(spec) = parse_spec_line(trimmed) {
                    specs.push(spec);
                }
            }
            _ => {}
        }
    }
    flush(section, &mut document);

    Ok(document)
}

/// Parses a `name (version)` or `name (version-platform)` spec line. Lines
/// deeper than the spec itself (sub-dependency constraints) are never
/// passed in — the caller only forwards `indent == 4` lines.
fn parse_spec_line(line: &str) -> Option<GemSpec> {
    let (name, rest) = line.split_once(" (")?;
    let version_and_platform = rest.strip_suffix(')')?;
    let platform_specific = version_and_platform.contains('-')
        && !version_and_platform.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false);
    let version = version_and_platform.split('-').next().unwrap_or(version_and_platform);
    Some(GemSpec { name: name.trim().to_string(), version: version.to_string(), platform_specific })
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

/// Renders the subset of `bundle config` keys (`BUNDLE_*` env vars mirrored
/// as a YAML file) needed to point an offline `bundle install` at the
/// vendored cache instead of rubygems.org.
fn render_bundle_config(vendor_cache: &Path) -> String {
    format!(
        "---\nBUNDLE_CACHE_PATH: \"{}\"\nBUNDLE_DEPLOYMENT: \"true\"\nBUNDLE_NO_PRUNE: \"true\"\nBUNDLE_ALLOW_OFFLINE_INSTALL: \"true\"\nBUNDLE_DISABLE_VERSION_CHECK: \"true\"\n",
        vendor_cache.display()
    )
}

fn repo_origin_and_head(source_dir: &Path) -> Result<(String, String)> {
    let origin = cachi2_process::run_command_in_dir("git", &["remote", "get-url", "origin"], source_dir)?;
    let head = cachi2_process::run_command_in_dir("git", &["rev-parse", "HEAD"], source_dir)?;
    if !origin.success || !head.success {
        bail!("failed to read git origin/HEAD for {}", source_dir.display());
    }
    Ok((origin.stdout.trim().to_string(), head.stdout.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "GIT\n  remote: https://github.com/foo/bar.git\n  revision: abcdef012345deadbeef\n  specs:\n    bar (1.0.0)\n\nGEM\n  remote: https://rubygems.org/\n  specs:\n    rake (13.0.6)\n    nokogiri (1.15.0-x86_64-linux)\n\nPATH\n  remote: ../local-gem\n  specs:\n    local-gem (0.1.0)\n\nPLATFORMS\n  ruby\n\nDEPENDENCIES\n  bar!\n  rake\n";

    #[test]
    fn parses_gem_section() {
        let doc = parse_gemfile_lock(SAMPLE).unwrap();
        assert_eq!(doc.gem_specs.len(), 2);
        assert!(doc.gem_specs.iter().any(|s| s.name == "rake" && s.version == "13.0.6"));
        assert!(doc.gem_specs.iter().any(|s| s.name == "nokogiri" && s.platform_specific));
    }

    #[test]
    fn parses_git_section() {
        let doc = parse_gemfile_lock(SAMPLE).unwrap();
        assert_eq!(doc.git_sources.len(), 1);
        let git = &doc.git_sources[0];
        assert_eq!(git.remote, "https://github.com/foo/bar.git");
        assert_eq!(git.revision, "abcdef012345deadbeef");
        assert_eq!(git.specs[0].name, "bar");
    }

    #[test]
    fn parses_path_section() {
        let doc = parse_gemfile_lock(SAMPLE).unwrap();
        assert_eq!(doc.path_sources.len(), 1);
        assert_eq!(doc.path_sources[0].remote, "../local-gem");
    }

    #[test]
    fn short_revision_is_twelve_hex_chars() {
        let revision = "abcdef012345deadbeef";
        assert_eq!(&revision[..12], "abcdef012345");
    }

    #[test]
    fn render_bundle_config_points_at_vendor_cache() {
        let rendered = render_bundle_config(Path::new("/tmp/out/bundler/vendor/cache"));
        assert!(rendered.contains("BUNDLE_CACHE_PATH: \"/tmp/out/bundler/vendor/cache\""));
        assert!(rendered.contains("BUNDLE_DEPLOYMENT: \"true\""));
    }
}
