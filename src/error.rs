//! Error types for Basecamp operations.
//!
//! This module defines [`BasecampError`], the primary error type used
//! throughout the orchestrator, and a [`Result`] type alias for convenience.
//!
//! # Error Handling Strategy
//!
//! - Use `BasecampError` for provisioning errors that need distinct handling
//! - Use `anyhow::Error` (via `BasecampError::Other`) for unexpected errors
//! - Errors are recorded as per-item outcomes at the component/package
//!   boundary and never abort the run; only a fault escaping every boundary
//!   reaches the top-level handler

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for Basecamp operations.
#[derive(Debug, Error)]
pub enum BasecampError {
    /// Every candidate download URL for an artifact failed.
    #[error("All {attempts} download URLs failed for {artifact}: {last_error}")]
    FetchExhausted {
        artifact: String,
        attempts: usize,
        last_error: String,
    },

    /// Downloaded artifact did not match its pinned digest.
    #[error("Digest mismatch for {artifact}: expected {expected}, got {actual}")]
    DigestMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    /// An unattended installer returned non-zero or could not be started,
    /// or the component was not found at any expected post-install path.
    #[error("Installer execution failed for '{component}': {message}")]
    InstallExecutionFailed { component: String, message: String },

    /// Terminal per-component outcome after all install attempts.
    #[error("Component '{component}' could not be provisioned: {message}")]
    ComponentInstallFailed { component: String, message: String },

    /// Terminal per-package outcome after batch and individual retry.
    #[error("Package '{package}' failed to install: {message}")]
    PackageInstallFailed { package: String, message: String },

    /// A child process exceeded its bounded wait and was killed.
    #[error("Command timed out after {seconds}s: {command}")]
    CommandTimeout { command: String, seconds: u64 },

    /// Shell command failed to launch or was killed by a signal.
    #[error("Command failed with exit code {code:?}: {command}")]
    CommandFailed { command: String, code: Option<i32> },

    /// The advisory run lock is held by another live orchestrator.
    #[error("Another provisioning run is active (lock at {path}, pid {pid})")]
    LockHeld { path: PathBuf, pid: u32 },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic wrapped error for anyhow interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Basecamp operations.
pub type Result<T> = std::result::Result<T, BasecampError>;
