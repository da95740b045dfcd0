//! The engine's public API (§6): the three entry points `cachi2-cli`
//! forwards into. It owns nothing resolution-related itself — that all
//! lives in [`dispatcher`] and [`resolvers`] — this module only wires the
//! pieces together and owns the on-disk artifacts a CLI invocation leaves
//! behind (`bom.json`, `output.json`, the env manifest).

pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod request;
pub mod resolvers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cachi2_types::{EnvVar, FileEdit, Request};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use dispatcher::DispatchResult;
pub use error::Cachi2Error;
pub use request::{OutputSummary, PackageSummary, prepare_output_layout, write_output_json};

const ENV_MANIFEST_FILE: &str = ".cachi2-env.json";

/// What `fetch_deps` leaves behind for the CLI to report.
pub struct FetchDepsOutcome {
    pub output_dir: PathBuf,
    pub package_summaries: Vec<PackageSummary>,
    pub component_count: usize,
    pub bom_path: PathBuf,
    pub output_json_path: PathBuf,
}

/// Resolves every package in `request`, writes `bom.json` and `output.json`
/// under its output directory, and persists the merged environment so a
/// later, separate `generate-env` invocation can read it back.
///
/// This is the one function that touches the network, subprocesses, and the
/// project-file edits resolvers perform inline (npm lockfile rewrites,
/// the cargo vendored-sources config, the bundler config). `inject_files`
/// and `generate_env` only read back what this function already wrote.
pub fn fetch_deps(request: &Request) -> Result<FetchDepsOutcome, Cachi2Error> {
    let output_dir = prepare_output_layout(request).map_err(|e| Cachi2Error::Input {
        message: e.to_string(),
        value: request.output_dir.display().to_string(),
    })?;

    let events = diagnostics::EventLog::open(&output_dir).map_err(|e| Cachi2Error::Input {
        message: format!("failed to open diagnostics log: {e}"),
        value: output_dir.display().to_string(),
    })?;

    let dispatched = dispatcher::dispatch_all(request, &events)?;

    let generated_at = Utc::now();
    let bom_path = output_dir.join("bom.json");
    std::fs::write(&bom_path, dispatched.sbom.render(request.flags.sbom_format, generated_at)).map_err(|e| {
        Cachi2Error::Input { message: format!("failed to write {}: {e}", bom_path.display()), value: bom_path.display().to_string() }
    })?;

    let package_summaries: Vec<PackageSummary> = dispatched
        .package_summaries
        .iter()
        .map(|(pm, path, component_count)| PackageSummary { package_manager: *pm, path: path.clone(), component_count: *component_count })
        .collect();

    let summary = OutputSummary { packages: package_summaries.clone(), file_edits: dispatched.file_edits.clone() };
    write_output_json(&output_dir, &summary).map_err(|e| Cachi2Error::Input {
        message: e.to_string(),
        value: output_dir.join("output.json").display().to_string(),
    })?;

    write_env_manifest(&output_dir, &dispatched.env)?;

    Ok(FetchDepsOutcome {
        component_count: dispatched.sbom.len(),
        output_dir: output_dir.clone(),
        package_summaries,
        bom_path,
        output_json_path: output_dir.join("output.json"),
    })
}

/// The merged environment a `fetch_deps` run produced, plus the output
/// directory it was computed against — needed so `generate_env` can rewrite
/// any absolute path under it when `--for-output-dir` is given.
#[derive(Debug, Serialize, Deserialize)]
struct EnvManifest {
    output_dir: PathBuf,
    vars: Vec<EnvVar>,
}

fn write_env_manifest(output_dir: &Path, vars: &[EnvVar]) -> Result<(), Cachi2Error> {
    let manifest = EnvManifest { output_dir: output_dir.to_path_buf(), vars: vars.to_vec() };
    let path = output_dir.join(ENV_MANIFEST_FILE);
    let body = serde_json::to_string_pretty(&manifest).expect("env manifest is always serializable");
    std::fs::write(&path, body).map_err(|e| Cachi2Error::Input { message: format!("failed to write {}: {e}", path.display()), value: path.display().to_string() })
}

fn read_env_manifest(output_dir: &Path) -> Result<EnvManifest, Cachi2Error> {
    let path = output_dir.join(ENV_MANIFEST_FILE);
    let body = std::fs::read_to_string(&path)
        .map_err(|e| Cachi2Error::Input { message: format!("failed to read {}: {e}", path.display()), value: path.display().to_string() })?;
    serde_json::from_str(&body).map_err(|e| Cachi2Error::Input { message: e.to_string(), value: path.display().to_string() })
}

/// Output format `generate-env` renders assignments in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvFormat {
    /// `export NAME=value` lines, shell-quoted, suitable for `source`.
    Env,
    Json,
    /// `NAME=value` lines with no `export`, suitable for Docker/Compose.
    Dotenv,
}

/// Reads back the environment a prior `fetch_deps` run persisted, remaps
/// any value that starts with the original output directory to
/// `for_output_dir` when given, and renders it in `format`.
pub fn generate_env(output_dir: &Path, format: EnvFormat, for_output_dir: Option<&Path>) -> Result<String, Cachi2Error> {
    let manifest = read_env_manifest(output_dir)?;
    let vars: Vec<EnvVar> = manifest
        .vars
        .into_iter()
        .map(|var| EnvVar { name: var.name, value: remap_path_prefix(&var.value, &manifest.output_dir, for_output_dir) })
        .collect();

    Ok(match format {
        EnvFormat::Env => vars.iter().map(|v| format!("export {}={}", v.name, shell_quote(&v.value))).collect::<Vec<_>>().join("\n"),
        EnvFormat::Dotenv => vars.iter().map(|v| format!("{}={}", v.name, v.value)).collect::<Vec<_>>().join("\n"),
        EnvFormat::Json => {
            let map: BTreeMap<&str, &str> = vars.iter().map(|v| (v.name.as_str(), v.value.as_str())).collect();
            serde_json::to_string_pretty(&map).expect("env map is always serializable")
        }
    })
}

/// Rewrites every project file a resolver edited during `fetch_deps`,
/// substituting the output directory path for `for_output_dir` when the
/// files are being injected into a source tree mounted at a different
/// absolute path than the one they were fetched under (e.g. fetch ran in a
/// CI stage, inject runs inside the hermetic build container).
///
/// Returns the list of files actually rewritten.
pub fn inject_files(output_dir: &Path, for_output_dir: Option<&Path>) -> Result<Vec<PathBuf>, Cachi2Error> {
    let Some(for_output_dir) = for_output_dir else {
        // Nothing to remap: resolvers already wrote these files in place
        // during `fetch_deps`.
        return Ok(Vec::new());
    };

    let output_json_path = output_dir.join("output.json");
    let body = std::fs::read_to_string(&output_json_path).map_err(|e| Cachi2Error::Input {
        message: format!("failed to read {}: {e}", output_json_path.display()),
        value: output_json_path.display().to_string(),
    })?;
    let summary: OutputSummaryEdits = serde_json::from_str(&body).map_err(|e| Cachi2Error::Input { message: e.to_string(), value: output_json_path.display().to_string() })?;

    let mut rewritten = Vec::new();
    for edit in &summary.file_edits {
        if rewrite_path_prefix(&edit.path, output_dir, for_output_dir)? {
            rewritten.push(edit.path.clone());
        }
    }
    Ok(rewritten)
}

/// Just the `file_edits` field of `output.json`; `inject_files` doesn't
/// need the rest of the summary.
#[derive(Debug, Deserialize)]
struct OutputSummaryEdits {
    #[serde(default)]
    file_edits: Vec<FileEdit>,
}

fn rewrite_path_prefix(path: &Path, from: &Path, to: &Path) -> Result<bool, Cachi2Error> {
    let Ok(contents) = std::fs::read_to_string(path) else { return Ok(false) };
    let from_str = from.display().to_string();
    if !contents.contains(&from_str) {
        return Ok(false);
    }
    let rewritten = contents.replace(&from_str, &to.display().to_string());
    std::fs::write(path, rewritten).map_err(|e| Cachi2Error::Input { message: format!("failed to write {}: {e}", path.display()), value: path.display().to_string() })?;
    Ok(true)
}

fn remap_path_prefix(value: &str, from: &Path, to: Option<&Path>) -> String {
    match to {
        Some(to) if value.starts_with(&from.display().to_string()) => value.replacen(&from.display().to_string(), &to.display().to_string(), 1),
        _ => value.to_string(),
    }
}

/// Quotes a value for safe inclusion in a POSIX shell `export` assignment.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachi2_types::{PackageInput, RelPath, Request, RequestFlags};
    use std::fs;

    fn git_repo_with_npm_package() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::write(
            dir.path().join("app").join("package-lock.json"),
            r#"{"lockfileVersion":3,"packages":{"":{},"node_modules/left-pad":{"version":"1.3.0","resolved":"file:../left-pad"}}}"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn remap_path_prefix_rewrites_matching_prefix() {
        let from = Path::new("/tmp/out");
        let to = Path::new("/mnt/out");
        let remapped = remap_path_prefix("/tmp/out/deps/cargo", from, Some(to));
        assert_eq!(remapped, "/mnt/out/deps/cargo");
    }

    #[test]
    fn remap_path_prefix_leaves_unrelated_values_alone() {
        let from = Path::new("/tmp/out");
        let remapped = remap_path_prefix("true", from, Some(Path::new("/mnt/out")));
        assert_eq!(remapped, "true");
    }

    #[test]
    fn generate_env_without_remap_returns_raw_values() {
        let dir = tempfile::tempdir().unwrap();
        write_env_manifest(
            dir.path(),
            &[EnvVar { name: "CARGO_NET_OFFLINE".to_string(), value: "true".to_string() }],
        )
        .unwrap();

        let rendered = generate_env(dir.path(), EnvFormat::Dotenv, None).unwrap();
        assert_eq!(rendered, "CARGO_NET_OFFLINE=true");
    }

    #[test]
    fn generate_env_json_format_is_a_flat_object() {
        let dir = tempfile::tempdir().unwrap();
        write_env_manifest(dir.path(), &[EnvVar { name: "FOO".to_string(), value: "bar".to_string() }]).unwrap();

        let rendered = generate_env(dir.path(), EnvFormat::Json, None).unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn fetch_deps_resolves_npm_package_and_writes_bom_and_output_json() {
        let source = git_repo_with_npm_package();
        let output = tempfile::tempdir().unwrap();

        let request = Request {
            source_dir: source.path().to_path_buf(),
            output_dir: output.path().to_path_buf(),
            packages: vec![PackageInput::Npm { path: RelPath::new("app") }],
            flags: RequestFlags::default(),
        };

        let outcome = fetch_deps(&request).unwrap();
        assert!(outcome.bom_path.exists());
        assert!(outcome.output_json_path.exists());
        assert_eq!(outcome.package_summaries.len(), 1);
    }

    #[test]
    fn inject_files_without_for_output_dir_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let rewritten = inject_files(dir.path(), None).unwrap();
        assert!(rewritten.is_empty());
    }

    #[test]
    fn inject_files_remaps_matching_output_dir_prefix_in_edited_files() {
        let output = tempfile::tempdir().unwrap();
        let edited = output.path().join("Cargo.config.toml");
        let original = format!("directory = \"{}/deps/cargo/vendor\"", output.path().display());
        fs::write(&edited, &original).unwrap();

        let summary = OutputSummary {
            packages: vec![],
            file_edits: vec![FileEdit { path: edited.clone(), description: "test edit".to_string() }],
        };
        write_output_json(&output.path().to_path_buf(), &summary).unwrap();

        let remapped_root = PathBuf::from("/mnt/remapped");
        let rewritten = inject_files(output.path(), Some(&remapped_root)).unwrap();
        assert_eq!(rewritten, vec![edited.clone()]);

        let contents = fs::read_to_string(&edited).unwrap();
        assert!(contents.contains("/mnt/remapped/deps/cargo/vendor"));
    }
}
