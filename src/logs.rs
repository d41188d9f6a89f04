//! Append-only setup logs under one world-readable root.
//!
//! The orchestrator runs detached with no console, so these files are the
//! only record of what happened:
//!
//! - `setup.log` — timestamped progress, human-readable
//! - `setup_transcript.log` — full raw output, including child stdout/stderr
//! - `setup_error.log` — error-only extract
//! - `requirements_check.log` — the final report (written by `report`)
//!
//! Only `requirements_check.log` is meant to be parsed by another process.
//! Log writes are best-effort: a failed write must never fault the run, so
//! sink errors are swallowed after a `tracing` breadcrumb.

use crate::error::Result;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment override for the log root (tests, portable installs).
pub const LOG_ROOT_ENV: &str = "BASECAMP_LOG_ROOT";

/// The fixed, world-readable log root for this platform.
pub fn default_log_root() -> PathBuf {
    if let Some(root) = std::env::var_os(LOG_ROOT_ENV) {
        return PathBuf::from(root);
    }
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\Basecamp")
    } else {
        PathBuf::from("/var/lib/basecamp")
    }
}

/// The three append-only sinks plus the fixed file layout under the root.
#[derive(Debug, Clone)]
pub struct SetupLog {
    root: PathBuf,
}

impl SetupLog {
    /// Open (creating if needed) the log root and make it world-readable.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(root, fs::Permissions::from_mode(0o755));
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The log root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `setup.log` — structured progress.
    pub fn progress_path(&self) -> PathBuf {
        self.root.join("setup.log")
    }

    /// `setup_transcript.log` — full raw output.
    pub fn transcript_path(&self) -> PathBuf {
        self.root.join("setup_transcript.log")
    }

    /// `setup_error.log` — error-only extract.
    pub fn error_path(&self) -> PathBuf {
        self.root.join("setup_error.log")
    }

    /// `requirements_check.log` — the report the application startup guard parses.
    pub fn report_path(&self) -> PathBuf {
        self.root.join("requirements_check.log")
    }

    /// `last_run.json` — serialized run record, diagnostics only.
    pub fn run_record_path(&self) -> PathBuf {
        self.root.join("last_run.json")
    }

    /// `setup.lock` — advisory lock serializing concurrent runs.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("setup.lock")
    }

    /// Log a progress line to `setup.log` and the transcript.
    pub fn info(&self, message: &str) {
        tracing::info!("{message}");
        let line = format!("{} {}\n", timestamp(), message);
        self.append(&self.progress_path(), &line);
        self.append(&self.transcript_path(), &line);
    }

    /// Log an error line to all three sinks.
    pub fn error(&self, message: &str) {
        tracing::error!("{message}");
        let line = format!("{} [ERROR] {}\n", timestamp(), message);
        self.append(&self.progress_path(), &line);
        self.append(&self.transcript_path(), &line);
        self.append(&self.error_path(), &line);
    }

    /// Append raw child output to the transcript only.
    pub fn transcript(&self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let mut chunk = raw.to_string();
        if !chunk.ends_with('\n') {
            chunk.push('\n');
        }
        self.append(&self.transcript_path(), &chunk);
    }

    /// Log a section banner to `setup.log` and the transcript.
    pub fn section(&self, title: &str) {
        self.info(&format!("==== {title} ===="));
    }

    fn append(&self, path: &Path, content: &str) {
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(content.as_bytes())?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o644));
            }
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!("log write to {} failed: {}", path.display(), e);
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(temp: &TempDir) -> SetupLog {
        SetupLog::open(&temp.path().join("logroot")).unwrap()
    }

    #[test]
    fn open_creates_root() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        assert!(log.root().is_dir());
    }

    #[test]
    fn info_writes_progress_and_transcript() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        log.info("Resolving component 'r'");

        let progress = std::fs::read_to_string(log.progress_path()).unwrap();
        let transcript = std::fs::read_to_string(log.transcript_path()).unwrap();
        assert!(progress.contains("Resolving component 'r'"));
        assert!(transcript.contains("Resolving component 'r'"));
        assert!(!log.error_path().exists());
    }

    #[test]
    fn error_writes_all_three_sinks() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        log.error("download failed");

        for path in [log.progress_path(), log.transcript_path(), log.error_path()] {
            let content = std::fs::read_to_string(path).unwrap();
            assert!(content.contains("[ERROR] download failed"));
        }
    }

    #[test]
    fn transcript_only_for_raw_output() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        log.transcript("child stdout here");

        assert!(!log.progress_path().exists());
        let transcript = std::fs::read_to_string(log.transcript_path()).unwrap();
        assert!(transcript.contains("child stdout here"));
        assert!(transcript.ends_with('\n'));
    }

    #[test]
    fn transcript_skips_empty_chunks() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        log.transcript("");
        assert!(!log.transcript_path().exists());
    }

    #[test]
    fn lines_are_timestamped() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        log.info("hello");
        let progress = std::fs::read_to_string(log.progress_path()).unwrap();
        // "YYYY-MM-DD HH:MM:SS hello"
        let line = progress.lines().next().unwrap();
        assert!(line.len() > "hello".len() + 19);
        assert!(line.ends_with("hello"));
    }

    #[test]
    fn appends_across_instances() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("logroot");
        SetupLog::open(&root).unwrap().info("first run");
        SetupLog::open(&root).unwrap().info("second run");

        let progress = std::fs::read_to_string(root.join("setup.log")).unwrap();
        assert!(progress.contains("first run"));
        assert!(progress.contains("second run"));
    }

    #[test]
    fn fixed_layout_under_root() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        assert!(log.report_path().ends_with("requirements_check.log"));
        assert!(log.lock_path().ends_with("setup.lock"));
        assert!(log.run_record_path().ends_with("last_run.json"));
    }

    #[test]
    fn default_root_honors_env_override() {
        // Env-var reads are process-global; keep set/remove in one test.
        std::env::set_var(LOG_ROOT_ENV, "/tmp/basecamp-test-root");
        assert_eq!(default_log_root(), PathBuf::from("/tmp/basecamp-test-root"));
        std::env::remove_var(LOG_ROOT_ENV);
        let root = default_log_root();
        assert!(root.to_string_lossy().to_lowercase().contains("basecamp"));
    }
}
