//! Validating constructors for [`cachi2_types::Request`] (§3, §9).
//!
//! `Request` and `PackageInput` are plain data in `cachi2-types` — they
//! carry no guarantee about the filesystem. This crate is the one place
//! that turns an as-deserialized request into the validated one the rest
//! of the engine is allowed to assume: `source_dir` exists and is a git
//! working tree, every package `path` resolves inside `source_dir` (via
//! `cachi2-pathguard`, rejecting `..`-escapes and symlink escapes), and
//! every `requirements_files`/`requirements_build_files` entry exists.
//!
//! This replaces the "Pydantic-style validation" the distilled spec
//! described: instead of a schema library raising at field-assignment
//! time, construction goes through [`validate_request`] and returns a
//! typed [`InputError`] naming exactly what failed.

use std::path::{Path, PathBuf};

use cachi2_pathguard::PathGuardError;
use cachi2_types::{PackageInput, Request};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("source_dir `{0}` does not exist")]
    SourceDirNotFound(PathBuf),

    #[error("source_dir `{0}` is not a git repository (no .git found)")]
    NotAGitRepository(PathBuf),

    #[error("package path `{path}` escapes source_dir")]
    PackagePathEscapes {
        path: PathBuf,
        #[source]
        source: PathGuardError,
    },

    #[error("package path `{0}` does not exist")]
    PackagePathNotFound(PathBuf),

    #[error("requirements file `{file}` for package `{package}` does not exist")]
    RequirementsFileNotFound { package: PathBuf, file: PathBuf },

    #[error("request has no packages")]
    NoPackages,

    #[error("failed to parse request document")]
    Deserialize(#[from] RequestFormatError),
}

#[derive(Debug, Error)]
pub enum RequestFormatError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Parses a JSON request document and validates it.
pub fn parse_request_json(raw: &str) -> Result<Request, InputError> {
    let request: Request = serde_json::from_str(raw).map_err(RequestFormatError::from)?;
    validate_request(request)
}

/// Parses a YAML request document and validates it.
pub fn parse_request_yaml(raw: &str) -> Result<Request, InputError> {
    let request: Request = serde_yaml::from_str(raw).map_err(RequestFormatError::from)?;
    validate_request(request)
}

/// Validates an already-deserialized [`Request`] against the filesystem,
/// returning it unchanged on success.
///
/// This is the only place `RelPath` values are confirmed to resolve inside
/// `source_dir`; every resolver downstream trusts that confirmation rather
/// than re-checking it.
pub fn validate_request(request: Request) -> Result<Request, InputError> {
    if !request.source_dir.exists() {
        return Err(InputError::SourceDirNotFound(request.source_dir.clone()));
    }
    if !request.source_dir.join(".git").exists() {
        return Err(InputError::NotAGitRepository(request.source_dir.clone()));
    }
    if request.packages.is_empty() {
        return Err(InputError::NoPackages);
    }

    for package in &request.packages {
        validate_package_input(&request.source_dir, package)?;
    }

    Ok(request)
}

fn validate_package_input(source_dir: &Path, package: &PackageInput) -> Result<(), InputError> {
    let package_path = package.path().as_path();
    let confined = cachi2_pathguard::confine_existing(source_dir, package_path).map_err(|source| {
        match source {
            PathGuardError::NotFound(path) => InputError::PackagePathNotFound(path),
            other => InputError::PackagePathEscapes {
                path: package_path.to_path_buf(),
                source: other,
            },
        }
    })?;

    if let PackageInput::Pip {
        requirements_files,
        requirements_build_files,
        ..
    } = package
    {
        for file in requirements_files.iter().chain(requirements_build_files.iter()) {
            let file_path = confined.join(&file.0);
            if !file_path.exists() {
                return Err(InputError::RequirementsFileNotFound {
                    package: package_path.to_path_buf(),
                    file: file.0.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachi2_types::{PackageManager, RelPath, RequestFlags};
    use std::fs;

    fn git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        dir
    }

    fn sample_request(source_dir: PathBuf, packages: Vec<PackageInput>) -> Request {
        Request {
            source_dir,
            output_dir: PathBuf::from("/tmp/output"),
            packages,
            flags: RequestFlags::default(),
        }
    }

    #[test]
    fn rejects_missing_source_dir() {
        let request = sample_request(PathBuf::from("/nonexistent/path"), vec![]);
        let err = validate_request(request).unwrap_err();
        assert!(matches!(err, InputError::SourceDirNotFound(_)));
    }

    #[test]
    fn rejects_source_dir_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let request = sample_request(dir.path().to_path_buf(), vec![]);
        let err = validate_request(request).unwrap_err();
        assert!(matches!(err, InputError::NotAGitRepository(_)));
    }

    #[test]
    fn rejects_empty_packages() {
        let dir = git_repo();
        let request = sample_request(dir.path().to_path_buf(), vec![]);
        let err = validate_request(request).unwrap_err();
        assert!(matches!(err, InputError::NoPackages));
    }

    #[test]
    fn accepts_valid_gomod_package() {
        let dir = git_repo();
        fs::create_dir(dir.path().join("service")).unwrap();
        let request = sample_request(
            dir.path().to_path_buf(),
            vec![PackageInput::Gomod {
                path: RelPath::new("service"),
            }],
        );
        assert!(validate_request(request).is_ok());
    }

    #[test]
    fn rejects_package_path_escaping_source_dir() {
        let dir = git_repo();
        let request = sample_request(
            dir.path().to_path_buf(),
            vec![PackageInput::Gomod {
                path: RelPath::new("../outside"),
            }],
        );
        let err = validate_request(request).unwrap_err();
        assert!(matches!(err, InputError::PackagePathEscapes { .. }));
    }

    #[test]
    fn rejects_missing_requirements_file() {
        let dir = git_repo();
        let request = sample_request(
            dir.path().to_path_buf(),
            vec![PackageInput::Pip {
                path: RelPath::new("."),
                requirements_files: vec![RelPath::new("requirements.txt")],
                requirements_build_files: vec![],
                allow_binary: false,
            }],
        );
        let err = validate_request(request).unwrap_err();
        assert!(matches!(err, InputError::RequirementsFileNotFound { .. }));
    }

    #[test]
    fn accepts_pip_package_with_present_requirements_file() {
        let dir = git_repo();
        fs::write(dir.path().join("requirements.txt"), "requests==2.31.0").unwrap();
        let request = sample_request(
            dir.path().to_path_buf(),
            vec![PackageInput::Pip {
                path: RelPath::new("."),
                requirements_files: vec![RelPath::new("requirements.txt")],
                requirements_build_files: vec![],
                allow_binary: false,
            }],
        );
        assert!(validate_request(request).is_ok());
    }

    #[test]
    fn parse_request_json_validates_after_parsing() {
        let dir = git_repo();
        fs::create_dir(dir.path().join("app")).unwrap();
        let json = format!(
            r#"{{"source_dir":"{}","output_dir":"/tmp/out","packages":[{{"type":"npm","path":"app"}}],"flags":{{}}}}"#,
            dir.path().display()
        );
        let request = parse_request_json(&json).unwrap();
        assert_eq!(request.packages.len(), 1);
        assert_eq!(request.packages[0].manager(), PackageManager::Npm);
    }
}
