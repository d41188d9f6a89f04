//! Artifact download with ordered URL fallback.
//!
//! Mirror outages are the most common provisioning failure, so every
//! artifact declares a priority-ordered URL list. Each URL is tried in turn;
//! transport and HTTP failures are logged and the next URL is tried.
//! `FetchExhausted` is raised only when every URL has failed, and no partial
//! download is ever left behind.

use crate::error::{BasecampError, Result};
use crate::logs::SetupLog;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One artifact to download.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Artifact name, for log lines and errors.
    pub artifact: String,
    /// Candidate URLs in priority order.
    pub urls: Vec<String>,
    /// Final destination path.
    pub dest: PathBuf,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Pinned SHA-256 hex digest; a mismatch fails that URL attempt.
    pub expected_sha256: Option<String>,
}

/// A completed download.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The URL that succeeded.
    pub url: String,
    /// Downloaded size in bytes.
    pub bytes: u64,
    /// SHA-256 hex digest of the body.
    pub sha256: String,
}

/// Writer that tees bytes into a file and a running digest.
struct DigestWriter {
    file: File,
    hasher: Sha256,
    bytes: u64,
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Download an artifact, trying each URL in order; first success wins.
pub fn fetch_with_fallback(request: &FetchRequest, log: &SetupLog) -> Result<FetchOutcome> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("basecamp/", env!("CARGO_PKG_VERSION")))
        .timeout(request.timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let part_path = partial_path(&request.dest);

    let mut last_error = String::from("no URLs declared");

    for (index, url) in request.urls.iter().enumerate() {
        log.info(&format!(
            "Downloading {} from {} ({} of {})",
            request.artifact,
            url,
            index + 1,
            request.urls.len()
        ));

        match attempt(&client, url, &part_path) {
            Ok((bytes, sha256)) => {
                if let Some(expected) = &request.expected_sha256 {
                    if !expected.eq_ignore_ascii_case(&sha256) {
                        let err = BasecampError::DigestMismatch {
                            artifact: request.artifact.clone(),
                            expected: expected.clone(),
                            actual: sha256,
                        };
                        log.error(&format!("{url}: {err}"));
                        last_error = err.to_string();
                        let _ = fs::remove_file(&part_path);
                        continue;
                    }
                }

                fs::rename(&part_path, &request.dest)?;
                log.info(&format!(
                    "Downloaded {} ({} bytes, sha256 {})",
                    request.artifact, bytes, sha256
                ));
                return Ok(FetchOutcome {
                    url: url.clone(),
                    bytes,
                    sha256,
                });
            }
            Err(message) => {
                log.error(&format!("Download of {} failed: {}", request.artifact, message));
                last_error = message;
                let _ = fs::remove_file(&part_path);
            }
        }
    }

    Err(BasecampError::FetchExhausted {
        artifact: request.artifact.clone(),
        attempts: request.urls.len(),
        last_error,
    })
}

/// Try a single URL, writing the body to `part_path`.
///
/// Returns (bytes, sha256) on success, a failure message otherwise. The
/// caller removes the partial file on failure.
fn attempt(
    client: &reqwest::blocking::Client,
    url: &str,
    part_path: &Path,
) -> std::result::Result<(u64, String), String> {
    let mut response = client
        .get(url)
        .send()
        .map_err(|e| format!("{url}: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("{url}: HTTP {}", response.status()));
    }

    let file = File::create(part_path).map_err(|e| format!("create {}: {e}", part_path.display()))?;
    let mut writer = DigestWriter {
        file,
        hasher: Sha256::new(),
        bytes: 0,
    };

    response
        .copy_to(&mut writer)
        .map_err(|e| format!("{url}: body read failed: {e}"))?;
    writer.flush().map_err(|e| e.to_string())?;

    let digest = hex::encode(writer.hasher.finalize());
    Ok((writer.bytes, digest))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    name.push_str(".part");
    dest.with_file_name(name)
}
