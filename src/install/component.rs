//! Per-component install flow.
//!
//! For each component: resolve, and stop there when satisfied; otherwise
//! fetch the installer artifact with URL fallback, execute it unattended
//! with a bounded wait, refresh the environment view, and resolve again.
//! The re-resolution is the authority on success — a zero exit code from an
//! installer proves nothing, and a non-zero one is not fatal on its own.

use crate::catalog::{ComponentSpec, InstallMethod};
use crate::envstore::EnvStore;
use crate::error::BasecampError;
use crate::fetch::{fetch_with_fallback, FetchRequest};
use crate::install::ComponentOutcome;
use crate::logs::SetupLog;
use crate::resolve::{ProbePlan, Resolution, Resolver};
use crate::shell::{run, Invocation, RunOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-request timeout for artifact downloads.
const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Ensure one component is installed, recording an outcome either way.
///
/// `resolved` holds the resolutions of previously processed components, in
/// declared order; it gates dependency skips and provides the binary for
/// `ViaComponent` installs. Returns the outcome plus the component's final
/// resolution (fed back into `resolved` by the orchestrator).
pub fn ensure_component(
    spec: &ComponentSpec,
    resolved: &HashMap<String, Resolution>,
    resolver: &mut Resolver,
    env: &EnvStore,
    log: &SetupLog,
    download_dir: &Path,
) -> (ComponentOutcome, Resolution) {
    log.section(&format!("Component: {}", spec.display));

    // A failed dependency blocks only its dependents.
    for dep in &spec.requires {
        let dep_satisfied = resolved
            .get(dep)
            .map(|r| r.satisfies(None))
            .unwrap_or(false);
        if !dep_satisfied {
            log.info(&format!(
                "Skipping {}: required component '{}' is not available",
                spec.display, dep
            ));
            return (
                ComponentOutcome::SkippedMissingDependency {
                    dependency: dep.clone(),
                },
                Resolution::Absent,
            );
        }
    }

    let before = resolver.resolve(&spec.probe);
    if before.satisfies(spec.minimum_version.as_ref()) {
        log.info(&format!(
            "{} already satisfied ({})",
            spec.display,
            before.detail()
        ));
        return (
            ComponentOutcome::AlreadySatisfied {
                detail: before.detail(),
            },
            before,
        );
    }
    log.info(&format!("{} not satisfied ({})", spec.display, before.detail()));

    if let Err(e) = execute_install(spec, resolved, log, download_dir) {
        log.error(&e.to_string());
        return (
            ComponentOutcome::Failed {
                reason: e.to_string(),
            },
            Resolution::Absent,
        );
    }

    // Pick up whatever the installer just published before re-probing.
    if let Err(e) = env.refresh_process_env() {
        log.error(&format!("environment refresh failed: {e}"));
    }
    if let Ok(dirs) = env.published_dirs() {
        resolver.add_dirs(dirs);
    }

    let after = resolve_with_layout_variants(spec, resolver);
    if after.satisfies(spec.minimum_version.as_ref()) {
        log.info(&format!("{} installed ({})", spec.display, after.detail()));
        (
            ComponentOutcome::Installed {
                detail: after.detail(),
            },
            after,
        )
    } else {
        let reason = format!("still not satisfied after install ({})", after.detail());
        let err = BasecampError::ComponentInstallFailed {
            component: spec.name.clone(),
            message: reason.clone(),
        };
        log.error(&err.to_string());
        (ComponentOutcome::Failed { reason }, after)
    }
}

/// Run the component's unattended install recipe.
///
/// The caller records a failure as the component's outcome.
fn execute_install(
    spec: &ComponentSpec,
    resolved: &HashMap<String, Resolution>,
    log: &SetupLog,
    download_dir: &Path,
) -> Result<(), BasecampError> {
    let fail = |message: String| BasecampError::InstallExecutionFailed {
        component: spec.name.clone(),
        message,
    };

    let invocation = match &spec.install {
        InstallMethod::ViaComponent { component, args } => {
            let Some(binary) = resolved.get(component).and_then(|r| r.path()) else {
                return Err(fail(format!(
                    "install requires '{component}', which is unavailable"
                )));
            };
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            Invocation::new(binary, &arg_refs)
        }
        InstallMethod::RunArtifact { args } => {
            let artifact = download_artifact(spec, log, download_dir)?;
            mark_executable(&artifact);
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            Invocation::new(artifact, &arg_refs)
        }
        InstallMethod::RunWith {
            program,
            args_before,
            args_after,
        } => {
            let artifact = download_artifact(spec, log, download_dir)?;
            let mut args: Vec<String> = args_before.clone();
            args.push(artifact.to_string_lossy().to_string());
            args.extend(args_after.iter().cloned());
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            Invocation::new(program.clone(), &arg_refs)
        }
    };

    log.info(&format!("Running unattended install: {}", invocation.display()));
    match run(
        &invocation,
        &RunOptions::with_timeout(spec.install_timeout_secs),
    ) {
        Ok(result) => {
            log.transcript(&result.combined_output());
            if !result.success {
                // Logged, not fatal: re-resolution decides.
                log.error(&format!(
                    "Installer for {} exited with {:?}",
                    spec.display, result.exit_code
                ));
            }
            Ok(())
        }
        Err(e) => Err(fail(format!("installer execution failed: {e}"))),
    }
}

fn download_artifact(
    spec: &ComponentSpec,
    log: &SetupLog,
    download_dir: &Path,
) -> Result<PathBuf, BasecampError> {
    let dest = download_dir.join(&spec.artifact_name);
    let request = FetchRequest {
        artifact: format!("{} installer", spec.display),
        urls: spec.urls.clone(),
        dest: dest.clone(),
        timeout: FETCH_TIMEOUT,
        expected_sha256: spec.expected_sha256.clone(),
    };
    fetch_with_fallback(&request, log)?;
    Ok(dest)
}

/// Re-resolve after an install, widening to the component's layout variants
/// when the primary probe still misses.
fn resolve_with_layout_variants(spec: &ComponentSpec, resolver: &Resolver) -> Resolution {
    let primary = resolver.resolve(&spec.probe);
    if primary.is_present() || spec.layout_variants.is_empty() {
        return primary;
    }

    let variant_plan = ProbePlan {
        binary: spec.probe.binary.clone(),
        strategies: spec.layout_variants.clone(),
        version_query: spec.probe.version_query.clone(),
    };
    resolver.resolve(&variant_plan)
}

#[cfg(unix)]
fn mark_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) {}
