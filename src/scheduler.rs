//! One-shot privileged job registration.
//!
//! The interactive installer must not block on provisioning, and the
//! orchestrator must outlive it. The launcher registers a one-shot job with
//! the platform scheduler — a scheduled task running as SYSTEM on Windows, a
//! transient systemd unit on Linux — triggers it immediately, and returns.
//!
//! The two sides never share memory: the launcher's job is done once the
//! registration starts, and the orchestrator removes its own registration at
//! the end of its run, success or fault, so no stale entry accumulates
//! across repeated installs.
//!
//! All scheduler argv is constructed as data so platform command shapes are
//! unit-testable without touching the host scheduler.

use crate::error::{BasecampError, Result};
use crate::logs::SetupLog;
use crate::shell::{run_check, Invocation};
use std::path::Path;

/// Registered job name; fixed so repeated installs replace, not accumulate.
pub const JOB_NAME: &str = "basecamp-provision";

/// Execution-time ceiling for one provisioning run, in minutes. The job
/// host kills the process past this point; re-entry is idempotent.
pub const JOB_TIME_LIMIT_MINUTES: u32 = 120;

/// A one-shot privileged job: the orchestrator entry point plus its
/// install-directory argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
    pub time_limit_minutes: u32,
}

impl JobSpec {
    /// The provisioning job for this binary and an install directory.
    pub fn provisioning(install_dir: &Path) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self {
            name: JOB_NAME.to_string(),
            program,
            args: vec!["run".to_string(), install_dir.to_string_lossy().to_string()],
            time_limit_minutes: JOB_TIME_LIMIT_MINUTES,
        })
    }
}

/// The invocations that register and immediately start a job, in order.
pub fn register_invocations(spec: &JobSpec) -> Vec<Invocation> {
    if cfg!(windows) {
        let argument = spec.args.join(" ");
        let script = format!(
            "$action = New-ScheduledTaskAction -Execute '{program}' -Argument '{argument}'; \
             $settings = New-ScheduledTaskSettingsSet -AllowStartIfOnBatteries \
             -DontStopIfGoingOnBatteries \
             -ExecutionTimeLimit (New-TimeSpan -Minutes {limit}); \
             Register-ScheduledTask -TaskName '{name}' -Action $action \
             -User 'SYSTEM' -RunLevel Highest -Settings $settings -Force; \
             Start-ScheduledTask -TaskName '{name}'",
            program = spec.program.display(),
            argument = argument,
            limit = spec.time_limit_minutes,
            name = spec.name,
        );
        vec![Invocation::new(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", &script],
        )]
    } else {
        let mut args = vec![
            format!("--unit={}", spec.name),
            "--description=Basecamp toolchain provisioning".to_string(),
            "--service-type=oneshot".to_string(),
            "--no-block".to_string(),
            format!("--property=RuntimeMaxSec={}", u64::from(spec.time_limit_minutes) * 60),
            spec.program.to_string_lossy().to_string(),
        ];
        args.extend(spec.args.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        vec![Invocation::new("systemd-run", &arg_refs)]
    }
}

/// The invocations that remove a job registration.
///
/// On Linux a finished transient unit unregisters itself; `reset-failed`
/// clears the residue a killed or failed run leaves behind.
pub fn remove_invocations(name: &str) -> Vec<Invocation> {
    if cfg!(windows) {
        let script =
            format!("Unregister-ScheduledTask -TaskName '{name}' -Confirm:$false -ErrorAction SilentlyContinue");
        vec![Invocation::new(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", &script],
        )]
    } else {
        vec![Invocation::new(
            "systemctl",
            &["reset-failed", &format!("{name}.service")],
        )]
    }
}

/// Whether this process runs with the privileges provisioning needs.
#[cfg(unix)]
pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Privilege elevation is carried by the scheduled task's RunLevel; the
/// launching installer is already elevated by its own manifest.
#[cfg(not(unix))]
pub fn is_privileged() -> bool {
    true
}

/// Registers, triggers, and removes provisioning jobs.
///
/// The executor is injectable so tests observe command shapes without a
/// live scheduler.
pub struct Launcher<'a> {
    execute: &'a dyn Fn(&Invocation) -> bool,
}

impl<'a> Launcher<'a> {
    /// A launcher that executes against the host scheduler.
    pub fn system() -> Launcher<'static> {
        Launcher {
            execute: &|invocation| run_check(invocation, Some(120)),
        }
    }

    /// A launcher with a custom executor (tests).
    pub fn with_executor(execute: &'a dyn Fn(&Invocation) -> bool) -> Self {
        Self { execute }
    }

    /// Register and immediately trigger the job, then return.
    ///
    /// Never waits for the provisioning run itself.
    pub fn launch(&self, spec: &JobSpec, log: &SetupLog) -> Result<()> {
        log.info(&format!(
            "Registering one-shot provisioning job '{}' ({} {})",
            spec.name,
            spec.program.display(),
            spec.args.join(" ")
        ));

        for invocation in register_invocations(spec) {
            if !(self.execute)(&invocation) {
                return Err(BasecampError::CommandFailed {
                    command: invocation.display(),
                    code: None,
                });
            }
        }

        log.info(&format!("Job '{}' started; detaching", spec.name));
        Ok(())
    }

    /// Remove the job registration. Best-effort: a failure is logged, never
    /// propagated — deregistration runs on the orchestrator's fault path.
    pub fn deregister(&self, name: &str, log: &SetupLog) {
        for invocation in remove_invocations(name) {
            if !(self.execute)(&invocation) {
                log.info(&format!(
                    "Job removal command did not succeed (may already be gone): {}",
                    invocation.display()
                ));
            }
        }
        log.info(&format!("Job registration '{name}' removed"));
    }
}
