//! Concurrent fetch-and-verify primitive (§4.1).
//!
//! Every resolver ultimately produces a list of [`cachi2_types::Artifact`]
//! values; this crate is the only place that actually touches the network.
//! `fetch_many` drives up to `concurrency` downloads at once via a scoped
//! rayon thread pool, retries transient failures per [`cachi2_retry`]'s
//! `Fetch` policy, and verifies every declared checksum in a single
//! streaming pass before the file is atomically moved into place.
//!
//! Non-goals carried over from the data model: no partial-range resumption,
//! no on-disk download cache shared across requests.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use cachi2_retry::{ErrorClass, RetryExecutor, RetryPolicy, classify_http_status};
use cachi2_types::Artifact;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of a single artifact fetch.
#[derive(Debug)]
pub struct FetchedArtifact {
    pub target_path: PathBuf,
    pub bytes_written: u64,
    /// `true` if the artifact declared no checksums at all (caller should
    /// attach a `cachi2:missing_hash:in_file` property to its component).
    pub unverified: bool,
}

/// Fetches every artifact, running up to `concurrency` downloads
/// concurrently. Returns one `Result` per input artifact, in input order.
/// `cancel`, if set, is checked between chunks and aborts in-flight
/// downloads with an error as soon as it's observed.
pub fn fetch_many(
    artifacts: &[Artifact],
    concurrency: usize,
    cancel: Option<Arc<AtomicBool>>,
) -> Vec<Result<FetchedArtifact>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .build()
        .expect("building a bounded rayon pool should never fail");

    let client = reqwest::blocking::Client::builder()
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new());

    pool.install(|| {
        use rayon::prelude::*;
        artifacts
            .par_iter()
            .map(|artifact| fetch_one(&client, artifact, cancel.clone()))
            .collect()
    })
}

/// Fetches and verifies a single artifact, retrying transient failures per
/// [`RetryPolicy::Fetch`].
pub fn fetch_one(
    client: &reqwest::blocking::Client,
    artifact: &Artifact,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<FetchedArtifact> {
    enforce_https(&artifact.url)?;

    let executor = RetryExecutor::from_policy(RetryPolicy::Fetch);
    executor.run(|_attempt| attempt_fetch(client, artifact, cancel.as_deref()))
}

fn enforce_https(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid artifact URL: {url}"))?;
    if parsed.scheme() != "https" {
        bail!("artifact URL `{url}` must use https, got scheme `{}`", parsed.scheme());
    }
    Ok(())
}

fn attempt_fetch(
    client: &reqwest::blocking::Client,
    artifact: &Artifact,
    cancel: Option<&AtomicBool>,
) -> Result<FetchedArtifact, (anyhow::Error, ErrorClass)> {
    let response = client
        .get(&artifact.url)
        .send()
        .map_err(|e| (anyhow!(e).context("request failed"), ErrorClass::Retryable))?;

    let status = response.status();
    if !status.is_success() {
        let class = classify_http_status(status.as_u16());
        return Err((anyhow!("unexpected status {status} fetching {}", artifact.url), class));
    }

    stream_to_disk(response, artifact, cancel).map_err(|e| (e, ErrorClass::Retryable))
}

fn stream_to_disk(
    mut response: reqwest::blocking::Response,
    artifact: &Artifact,
    cancel: Option<&AtomicBool>,
) -> Result<FetchedArtifact> {
    let parent = artifact
        .target_path
        .parent()
        .context("artifact target_path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;

    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut sha1 = Sha1::new();
    let mut md5 = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            bail!("fetch of {} cancelled", artifact.url);
        }
        let n = response
            .read(&mut buf)
            .with_context(|| format!("failed reading response body from {}", artifact.url))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        sha256.update(chunk);
        sha512.update(chunk);
        sha1.update(chunk);
        md5.update(chunk);
        tmp.write_all(chunk)
            .with_context(|| format!("failed writing to {}", tmp.path().display()))?;
        written += n as u64;

        if let Some(limit) = artifact.size_limit
            && written > limit
        {
            bail!("artifact {} exceeds size limit of {limit} bytes", artifact.url);
        }
    }

    let digests = Digests {
        sha256: hex::encode(sha256.finalize()),
        sha512: hex::encode(sha512.finalize()),
        sha1: hex::encode(sha1.finalize()),
        md5: hex::encode(md5.finalize()),
    };
    let unverified = verify_checksums(&artifact.checksums, &digests)
        .with_context(|| format!("checksum verification failed for {}", artifact.url))?;

    tmp.as_file().sync_all().context("failed to fsync downloaded artifact")?;
    tmp.persist(&artifact.target_path)
        .with_context(|| format!("failed to move artifact into {}", artifact.target_path.display()))?;

    Ok(FetchedArtifact {
        target_path: artifact.target_path.clone(),
        bytes_written: written,
        unverified,
    })
}

struct Digests {
    sha256: String,
    sha512: String,
    sha1: String,
    md5: String,
}

impl Digests {
    fn get(&self, algorithm: &str) -> Option<&str> {
        match algorithm {
            "sha256" => Some(&self.sha256),
            "sha512" => Some(&self.sha512),
            "sha1" => Some(&self.sha1),
            "md5" => Some(&self.md5),
            _ => None,
        }
    }
}

/// Checks every `algorithm:hex` entry in `declared` against the digests
/// actually computed. Any mismatch is fatal. An unsupported algorithm name
/// is also fatal (it would otherwise silently pass verification). Returns
/// `true` if `declared` was empty (nothing to verify against).
fn verify_checksums(declared: &BTreeSet<String>, digests: &Digests) -> Result<bool> {
    if declared.is_empty() {
        return Ok(true);
    }

    for entry in declared {
        let (algorithm, expected) = entry
            .split_once(':')
            .with_context(|| format!("checksum entry `{entry}` is not `algorithm:hex`"))?;
        let actual = digests
            .get(algorithm)
            .with_context(|| format!("unsupported checksum algorithm `{algorithm}`"))?;
        if !actual.eq_ignore_ascii_case(expected) {
            bail!("{algorithm} mismatch: expected {expected}, got {actual}");
        }
    }
    Ok(false)
}

/// Reads a local path (used by ecosystems that vendor their own dependency
/// fetch, e.g. cargo's `cargo vendor`) and computes the same digest set,
/// for post-hoc checksum verification without a network round trip.
pub fn digest_file(path: &Path) -> Result<Digests> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut sha1 = Sha1::new();
    let mut md5 = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        sha256.update(chunk);
        sha512.update(chunk);
        sha1.update(chunk);
        md5.update(chunk);
    }
    Ok(Digests {
        sha256: hex::encode(sha256.finalize()),
        sha512: hex::encode(sha512.finalize()),
        sha1: hex::encode(sha1.finalize()),
        md5: hex::encode(md5.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(sha256: &str) -> Digests {
        Digests {
            sha256: sha256.to_string(),
            sha512: String::new(),
            sha1: String::new(),
            md5: String::new(),
        }
    }

    #[test]
    fn empty_declared_checksums_is_unverified() {
        let d = digests("abc");
        let declared = BTreeSet::new();
        assert!(verify_checksums(&declared, &d).unwrap());
    }

    #[test]
    fn matching_checksum_verifies() {
        let d = digests("abc123");
        let mut declared = BTreeSet::new();
        declared.insert("sha256:ABC123".to_string());
        assert!(!verify_checksums(&declared, &d).unwrap());
    }

    #[test]
    fn mismatched_checksum_errors() {
        let d = digests("abc123");
        let mut declared = BTreeSet::new();
        declared.insert("sha256:def456".to_string());
        assert!(verify_checksums(&declared, &d).is_err());
    }

    #[test]
    fn unsupported_algorithm_errors() {
        let d = digests("abc123");
        let mut declared = BTreeSet::new();
        declared.insert("blake2:abc123".to_string());
        assert!(verify_checksums(&declared, &d).is_err());
    }

    #[test]
    fn enforce_https_rejects_plain_http() {
        assert!(enforce_https("http://example.com/pkg.tar.gz").is_err());
    }

    #[test]
    fn enforce_https_accepts_https() {
        assert!(enforce_https("https://example.com/pkg.tar.gz").is_ok());
    }

    #[test]
    fn digest_file_matches_known_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let d = digest_file(&path).unwrap();
        assert_eq!(
            d.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
        );
    }
}
