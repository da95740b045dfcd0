//! Request-scoped diagnostics event log (§2 ambient components).
//!
//! One JSONL line per resolver lifecycle event, appended to
//! `<output>/.cachi2-events.jsonl`. Purely observability: nothing in the
//! engine ever reads this file back. Every resolver brackets its body with
//! a `PackageStarted`/`PackageCompleted` pair; ad-hoc `Warning` events are
//! used for conditions worth surfacing without failing the request (the Go
//! micro-version clamp, the yarn Classic mirror-override asymmetry).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cachi2_types::PackageManager;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    PackageStarted {
        package_manager: PackageManager,
        path: PathBuf,
    },
    PackageCompleted {
        package_manager: PackageManager,
        path: PathBuf,
        components_found: usize,
    },
    Warning {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only JSONL sink guarded by a mutex so resolvers running
/// concurrently under the Dispatcher's rayon scope don't interleave
/// partial lines.
pub struct EventLog {
    file: Mutex<std::fs::File>,
}

impl EventLog {
    pub fn open(output_dir: &Path) -> anyhow::Result<Self> {
        let path = output_dir.join(".cachi2-events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
        Ok(Self { file: Mutex::new(file) })
    }

    pub fn record(&self, kind: EventKind, now: DateTime<Utc>) {
        let event = DiagnosticEvent { timestamp: now, kind };
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }

    pub fn package_started(&self, pm: PackageManager, path: &Path, now: DateTime<Utc>) {
        self.record(
            EventKind::PackageStarted {
                package_manager: pm,
                path: path.to_path_buf(),
            },
            now,
        );
    }

    pub fn package_completed(&self, pm: PackageManager, path: &Path, components_found: usize, now: DateTime<Utc>) {
        self.record(
            EventKind::PackageCompleted {
                package_manager: pm,
                path: path.to_path_buf(),
                components_found,
            },
            now,
        );
    }

    pub fn warning(&self, message: impl Into<String>, now: DateTime<Utc>) {
        self.record(EventKind::Warning { message: message.into() }, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn appends_one_jsonl_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let now = DateTime::UNIX_EPOCH;
        log.package_started(PackageManager::Npm, Path::new("."), now);
        log.warning("mirror override ignored at fetch time", now);

        let contents = std::fs::read_to_string(dir.path().join(".cachi2-events.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("package_started"));
        assert!(lines[1].contains("mirror override"));
    }

    #[test]
    fn event_log_reader_sees_valid_json_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        log.warning("test", DateTime::UNIX_EPOCH);
        let file = std::fs::File::open(dir.path().join(".cachi2-events.jsonl")).unwrap();
        for line in std::io::BufReader::new(file).lines() {
            let line = line.unwrap();
            let _: serde_json::Value = serde_json::from_str(&line).unwrap();
        }
    }
}
