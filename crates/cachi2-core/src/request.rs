//! Request / Output Layout (§4.5).
//!
//! Owns `<output>/deps/<pm>/` directory creation and `output.json`, the
//! machine-readable summary of what was resolved. Validation of the
//! incoming [`Request`] itself lives in `cachi2-schema`; this module only
//! deals with what happens once a validated `Request` is in hand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use cachi2_types::{FileEdit, PackageManager, Request};
use serde::Serialize;

/// Ensures `<output>/deps/<pm>/` exists for every package manager named in
/// the request's packages, returning the root output directory.
pub fn prepare_output_layout(request: &Request) -> Result<PathBuf> {
    std::fs::create_dir_all(&request.output_dir)
        .with_context(|| format!("failed to create {}", request.output_dir.display()))?;

    let mut managers: Vec<PackageManager> = request.packages.iter().map(|p| p.manager()).collect();
    managers.sort();
    managers.dedup();

    for pm in managers {
        let dir = request.pm_output_dir(pm);
        std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    Ok(request.output_dir.clone())
}

/// `output.json`: the machine-readable summary of a completed request.
#[derive(Debug, Serialize)]
pub struct OutputSummary {
    pub packages: Vec<PackageSummary>,
    pub file_edits: Vec<FileEdit>,
}

#[derive(Debug, Serialize)]
pub struct PackageSummary {
    #[serde(rename = "type")]
    pub package_manager: PackageManager,
    pub path: PathBuf,
    pub component_count: usize,
}

pub fn write_output_json(output_dir: &PathBuf, summary: &OutputSummary) -> Result<()> {
    let path = output_dir.join("output.json");
    let body = serde_json::to_string_pretty(summary).context("failed to serialize output.json")?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachi2_types::{PackageInput, RelPath, RequestFlags};

    #[test]
    fn prepare_output_layout_creates_one_dir_per_manager() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request {
            source_dir: dir.path().to_path_buf(),
            output_dir: dir.path().join("out"),
            packages: vec![
                PackageInput::Npm { path: RelPath::new(".") },
                PackageInput::Cargo { path: RelPath::new(".") },
            ],
            flags: RequestFlags::default(),
        };
        let output = prepare_output_layout(&request).unwrap();
        assert!(output.join("deps/npm").is_dir());
        assert!(output.join("deps/cargo").is_dir());
    }

    #[test]
    fn write_output_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let summary = OutputSummary {
            packages: vec![PackageSummary {
                package_manager: PackageManager::Npm,
                path: PathBuf::from("."),
                component_count: 3,
            }],
            file_edits: vec![],
        };
        write_output_json(&dir.path().to_path_buf(), &summary).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("output.json")).unwrap();
        assert!(contents.contains("\"component_count\": 3"));
    }
}
