//! pip resolver (§4.7).
//!
//! Parses `requirements.txt`-syntax files directly (no `pip` subprocess):
//! every line must pin with `==`, a direct URL carrying `#sha256=...`, or a
//! VCS reference naming a full commit. Range operators, `--index-url`,
//! `--extra-index-url`, and editable remote installs are all rejected.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use cachi2_index_client::{IndexClient, pep503_canonical_name};
use cachi2_types::{Artifact, Component, ComponentType, FoundBy, PackageInput, PackageManager, ResolverResult};
use std::collections::BTreeSet;

use crate::error::Cachi2Error;
use crate::resolvers::ResolveContext;

pub fn resolve(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let PackageInput::Pip {
        path,
        requirements_files,
        requirements_build_files,
        allow_binary,
    } = input
    else {
        unreachable!("dispatch only routes Pip inputs here");
    };

    let package_dir = ctx.request.source_dir.join(path.as_path());
    let output_dir = ctx.request.pm_output_dir(PackageManager::Pip);
    let client = IndexClient::default();

    let mut components = Vec::new();
    let mut file_edits = Vec::new();

    for rel_file in requirements_files.iter().chain(requirements_build_files.iter()) {
        let file_path = package_dir.join(rel_file.as_path());
        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("failed to read {}", file_path.display()))
            .map_err(|e| Cachi2Error::lockfile(file_path.clone(), e.to_string()))?;

        let mut rewritten_lines = Vec::new();
        let mut changed = false;

        for (line_number, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                rewritten_lines.push(raw_line.to_string());
                continue;
            }
            if line.starts_with("--index-url") || line.starts_with("--extra-index-url") || line.starts_with("-e ") {
                return Err(Cachi2Error::lockfile(
                    file_path.clone(),
                    format!("line {}: unsupported directive `{line}`", line_number + 1),
                ));
            }

            let requirement = parse_requirement_line(line)
                .map_err(|e| Cachi2Error::lockfile(file_path.clone(), format!("line {}: {e}", line_number + 1)))?;

            let (component, rewritten, artifact) = resolve_requirement(&client, &output_dir, &requirement, *allow_binary)
                .map_err(|e| Cachi2Error::fetch(requirement.source_label(), e.to_string()))?;

            if let Some(artifact) = artifact {
                let fetched = cachi2_checksum::fetch_one(&reqwest::blocking::Client::new(), &artifact, None)
                    .map_err(|e| Cachi2Error::fetch(artifact.url.clone(), e.to_string()))?;
                let _ = fetched;
            }

            components.push(component);
            if let Some(new_line) = rewritten {
                rewritten_lines.push(new_line);
                changed = true;
            } else {
                rewritten_lines.push(raw_line.to_string());
            }
        }

        if changed {
            std::fs::write(&file_path, rewritten_lines.join("\n") + "\n")
                .with_context(|| format!("failed to rewrite {}", file_path.display()))
                .map_err(|e| Cachi2Error::lockfile(file_path.clone(), e.to_string()))?;
            file_edits.push(cachi2_types::FileEdit {
                path: package_dir.join(rel_file.as_path()),
                description: "rewrote non-PyPI requirement URLs to local file:// cache paths".to_string(),
            });
        }
    }

    Ok(ResolverResult {
        components,
        env: vec![
            cachi2_types::EnvVar { name: "PIP_FIND_LINKS".to_string(), value: output_dir.display().to_string() },
            cachi2_types::EnvVar { name: "PIP_NO_INDEX".to_string(), value: "true".to_string() },
        ],
        file_edits,
    })
}

enum Requirement {
    Pinned { name: String, version: String, hash_sha256: Option<String> },
    DirectUrl { name: String, url: String, sha256: Option<String> },
    Vcs { name: String, repo: String, commit: String },
}

impl Requirement {
    fn source_label(&self) -> String {
        match self {
            Requirement::Pinned { name, .. } => name.clone(),
            Requirement::DirectUrl { url, .. } => url.clone(),
            Requirement::Vcs { repo, .. } => repo.clone(),
        }
    }
}

/// Splits `--hash=sha256:<hex>` options off the end of a requirement line.
/// Requirements-file syntax allows one or more space-separated `--hash`
/// options after the main requirement; only `sha256` is supported, and
/// multiple conflicting values for the same line are a hard error rather
/// than a silent pick.
fn split_hash_options(line: &str) -> Result<(&str, Option<String>)> {
    let Some(idx) = line.find(" --hash=") else {
        return Ok((line, None));
    };
    let (main, tail) = line.split_at(idx);
    let mut hash: Option<String> = None;
    for token in tail.split_whitespace() {
        let value = token.strip_prefix("--hash=").context("malformed --hash option")?;
        let sha = value
            .strip_prefix("sha256:")
            .with_context(|| format!("unsupported hash algorithm in `{token}` (only sha256 is supported)"))?;
        match &hash {
            Some(existing) if existing != sha => {
                bail!("conflicting --hash values on the same requirement line: {existing} vs {sha}")
            }
            _ => hash = Some(sha.to_string()),
        }
    }
    Ok((main, hash))
}

fn parse_requirement_line(line: &str) -> Result<Requirement> {
    let (line, hash_sha256) = split_hash_options(line)?;
    let line = line.trim_end();

    if let Some((name, rest)) = line.split_once('@') {
        let name = name.trim().to_string();
        let rest = rest.trim();
        if let Some(vcs_rest) = rest.strip_prefix("git+") {
            let (repo, commit) = vcs_rest
                .rsplit_once('@')
                .context("VCS requirement must pin a full commit with `@<commit>`")?;
            if commit.len() != 40 || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("VCS requirement `{name}` must pin a full 40-character commit hash");
            }
            return Ok(Requirement::Vcs {
                name,
                repo: repo.to_string(),
                commit: commit.to_string(),
            });
        }

        let (url, fragment) = rest.split_once('#').unwrap_or((rest, ""));
        let sha_from_fragment = fragment.strip_prefix("sha256=").map(str::to_string);
        let sha256 = match (sha_from_fragment, hash_sha256) {
            (Some(fragment_sha), Some(hash_sha)) if fragment_sha != hash_sha => {
                bail!("conflicting checksums for `{name}`: url fragment declares sha256={fragment_sha} but --hash declares sha256={hash_sha}")
            }
            (Some(fragment_sha), _) => Some(fragment_sha),
            (None, hash_sha) => hash_sha,
        };
        return Ok(Requirement::DirectUrl {
            name,
            url: url.to_string(),
            sha256,
        });
    }

    let (name, version) = line
        .split_once("==")
        .context("requirement must pin with `==`, a direct URL, or a VCS reference")?;
    Ok(Requirement::Pinned {
        name: name.trim().to_string(),
        version: version.trim().to_string(),
        hash_sha256,
    })
}

fn resolve_requirement(
    client: &IndexClient,
    output_dir: &Path,
    requirement: &Requirement,
    allow_binary: bool,
) -> Result<(Component, Option<String>, Option<Artifact>)> {
    match requirement {
        Requirement::Pinned { name, version, hash_sha256 } => {
            let canonical = pep503_canonical_name(name);
            let index = client.fetch_pip_simple_index("https://pypi.org/simple", &canonical)?;
            let file = index
                .files
                .iter()
                .find(|f| f.filename.contains(version.as_str()) && (allow_binary || f.filename.ends_with(".tar.gz")))
                .with_context(|| format!("no matching file for {name}=={version} on the simple index"))?;

            let sha256 = file.hashes.get("sha256").cloned();
            if let (Some(declared), Some(reported)) = (hash_sha256, &sha256)
                && declared != reported
            {
                bail!("conflicting sha256 for {name}=={version}: requirements file declares {declared} but the index reports {reported}");
            }
            let mut checksums = BTreeSet::new();
            if let Some(sha) = &sha256 {
                checksums.insert(format!("sha256:{sha}"));
            }

            let purl = format!("pkg:pypi/{canonical}@{version}");
            let mut component = Component::new(
                canonical.clone(),
                Some(version.clone()),
                purl,
                ComponentType::Library,
                FoundBy::Resolver(PackageManager::Pip),
            );
            if sha256.is_none() {
                component = component.with_property("cachi2:missing_hash:in_file", "requirements.txt");
            }

            let artifact = Artifact {
                url: file.url.clone(),
                vcs_ref: None,
                checksums,
                target_path: output_dir.join(&file.filename),
                size_limit: None,
            };
            Ok((component, None, Some(artifact)))
        }
        Requirement::DirectUrl { name, url, sha256 } => {
            let mut checksums = BTreeSet::new();
            if let Some(sha) = sha256 {
                checksums.insert(format!("sha256:{sha}"));
            }
            let filename = url.rsplit('/').next().unwrap_or(name).to_string();
            let purl = match sha256 {
                Some(sha) => format!("pkg:pypi/{name}?download_url={url}&checksum=sha256:{sha}"),
                None => format!("pkg:pypi/{name}?download_url={url}"),
            };
            let mut component = Component::new(
                name.clone(),
                None,
                purl,
                ComponentType::Library,
                FoundBy::Resolver(PackageManager::Pip),
            );
            if sha256.is_none() {
                component = component.with_property("cachi2:missing_hash:in_file", "requirements.txt");
            }
            let target_path = output_dir.join(&filename);
            let rewritten = format!("{name} @ file://{}", target_path.display());
            let artifact = Artifact {
                url: url.clone(),
                vcs_ref: None,
                checksums,
                target_path,
                size_limit: None,
            };
            Ok((component, Some(rewritten), Some(artifact)))
        }
        Requirement::Vcs { name, repo, commit } => {
            let (host, namespace, repo_name) = split_repo_url(repo)?;
            let archive_name = format!("{name}-external-gitcommit-{commit}.tar.gz");
            let target_dir = output_dir.join(&host).join(&namespace).join(&repo_name);
            std::fs::create_dir_all(&target_dir)?;
            let target_path = target_dir.join(&archive_name);

            cachi2_vcs::fetch_and_archive(repo, commit, &target_path)?;

            let purl = format!("pkg:pypi/{name}?vcs_url=git+{repo}@{commit}");
            let component = Component::new(
                name.clone(),
                None,
                purl,
                ComponentType::Library,
                FoundBy::Resolver(PackageManager::Pip),
            );
            let rewritten = format!("{name} @ file://{}", target_path.display());
            Ok((component, Some(rewritten), None))
        }
    }
}

fn split_repo_url(url: &str) -> Result<(String, String, String)> {
    let trimmed = url.trim_end_matches(".git");
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .context("VCS url has no scheme")?;
    let mut parts = without_scheme.splitn(2, '/');
    let host = parts.next().context("VCS url has no host")?.to_string();
    let rest = parts.next().context("VCS url has no path")?;
    let (namespace, repo_name) = rest.rsplit_once('/').unwrap_or(("", rest));
    Ok((host, namespace.to_string(), repo_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pinned_requirement() {
        let req = parse_requirement_line("requests==2.31.0").unwrap();
        match req {
            Requirement::Pinned { name, version, hash_sha256 } => {
                assert_eq!(name, "requests");
                assert_eq!(version, "2.31.0");
                assert!(hash_sha256.is_none());
            }
            _ => panic!("expected pinned"),
        }
    }

    #[test]
    fn parses_pinned_requirement_with_hash_option() {
        let req = parse_requirement_line("requests==2.31.0 --hash=sha256:abc123").unwrap();
        match req {
            Requirement::Pinned { hash_sha256, .. } => assert_eq!(hash_sha256.as_deref(), Some("abc123")),
            _ => panic!("expected pinned"),
        }
    }

    #[test]
    fn rejects_conflicting_hash_options_on_same_line() {
        let line = "requests==2.31.0 --hash=sha256:abc123 --hash=sha256:def456";
        assert!(parse_requirement_line(line).is_err());
    }

    #[test]
    fn rejects_direct_url_with_conflicting_fragment_and_hash() {
        let line = "foo @ https://example.com/foo.tar.gz#sha256=abc123 --hash=sha256:def456";
        assert!(parse_requirement_line(line).is_err());
    }

    #[test]
    fn parses_direct_url_with_sha256_fragment() {
        let req = parse_requirement_line("foo @ https://example.com/foo.tar.gz#sha256=abc123").unwrap();
        match req {
            Requirement::DirectUrl { name, url, sha256 } => {
                assert_eq!(name, "foo");
                assert_eq!(url, "https://example.com/foo.tar.gz");
                assert_eq!(sha256.as_deref(), Some("abc123"));
            }
            _ => panic!("expected direct url"),
        }
    }

    #[test]
    fn parses_vcs_requirement_with_full_commit() {
        let commit = "8d7d7fadff38c8367796e6ac0b3516b65483db24";
        let line = format!("osbs-client @ git+https://github.com/containerbuildsystem/osbs-client@{commit}");
        let req = parse_requirement_line(&line).unwrap();
        match req {
            Requirement::Vcs { name, repo, commit: parsed_commit } => {
                assert_eq!(name, "osbs-client");
                assert_eq!(repo, "https://github.com/containerbuildsystem/osbs-client");
                assert_eq!(parsed_commit, commit);
            }
            _ => panic!("expected vcs"),
        }
    }

    #[test]
    fn rejects_vcs_requirement_with_short_ref() {
        let line = "foo @ git+https://example.com/foo@main";
        assert!(parse_requirement_line(line).is_err());
    }

    #[test]
    fn rejects_range_operator() {
        assert!(parse_requirement_line("requests>=2.0").is_err());
    }

    #[test]
    fn split_repo_url_extracts_host_namespace_repo() {
        let (host, namespace, repo) =
            split_repo_url("https://github.com/containerbuildsystem/osbs-client").unwrap();
        assert_eq!(host, "github.com");
        assert_eq!(namespace, "containerbuildsystem");
        assert_eq!(repo, "osbs-client");
    }
}
