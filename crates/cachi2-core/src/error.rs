//! The five-way error classification (§7) as a single `thiserror` enum.
//!
//! Resolvers do their internal plumbing with `anyhow::Result` (matching the
//! dominant style across the leaf crates) and convert to [`Cachi2Error`]
//! only at their public `resolve` boundary, the one place that needs typed
//! discrimination for the CLI's exit-code mapping and for the structured
//! diagnostic fields this spec requires.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Cachi2Error {
    #[error("invalid input: {message} (offending value: {value})")]
    Input { message: String, value: String },

    #[error("fetch failed for {url}: {message}")]
    Fetch {
        url: String,
        message: String,
        expected_checksum: Option<String>,
        actual_checksum: Option<String>,
    },

    #[error("lockfile error in {file}: {message}")]
    Lockfile {
        file: PathBuf,
        line: Option<u32>,
        message: String,
    },

    #[error("`{tool}` failed: {message}\n{stderr_tail}")]
    Tool {
        tool: String,
        message: String,
        stderr_tail: String,
    },

    #[error("unsupported feature: {feature} ({hint})")]
    UnsupportedFeature { feature: String, hint: String },

    #[error(transparent)]
    InputValidation(#[from] cachi2_schema::InputError),
}

impl Cachi2Error {
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Cachi2Error::Fetch {
            url: url.into(),
            message: message.into(),
            expected_checksum: None,
            actual_checksum: None,
        }
    }

    pub fn lockfile(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Cachi2Error::Lockfile {
            file: file.into(),
            line: None,
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>, stderr_tail: impl Into<String>) -> Self {
        Cachi2Error::Tool {
            tool: tool.into(),
            message: message.into(),
            stderr_tail: stderr_tail.into(),
        }
    }

    pub fn unsupported(feature: impl Into<String>, hint: impl Into<String>) -> Self {
        Cachi2Error::UnsupportedFeature {
            feature: feature.into(),
            hint: hint.into(),
        }
    }

    /// Best-effort classification of an `anyhow::Error` bubbled up from
    /// internal plumbing into a `Cachi2Error::Tool`, for resolvers whose
    /// failures are overwhelmingly subprocess-shaped.
    pub fn from_tool_failure(tool: &str, err: anyhow::Error) -> Self {
        Cachi2Error::tool(tool, err.to_string(), String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_display_names_url_and_message() {
        let err = Cachi2Error::fetch("https://example.com/pkg.tar.gz", "checksum mismatch");
        let rendered = err.to_string();
        assert!(rendered.contains("https://example.com/pkg.tar.gz"));
        assert!(rendered.contains("checksum mismatch"));
    }

    #[test]
    fn unsupported_feature_display_includes_hint() {
        let err = Cachi2Error::unsupported("Zero-Install", "see yarn Berry docs on unplugged installs");
        assert!(err.to_string().contains("Zero-Install"));
        assert!(err.to_string().contains("unplugged"));
    }
}
