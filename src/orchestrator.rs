//! The provisioning run: sequential, synchronous, and fault-bounded.
//!
//! Control flow: acquire the advisory lock, install components in declared
//! dependency order, install package sets, publish discovered locations to
//! the environment store, re-probe everything for the requirements report,
//! remove the one-shot job registration, release the lock.
//!
//! Per-item failures are recorded as outcomes and the run continues; the
//! report generator is reached no matter how many items failed. Only a
//! fault escaping every boundary hits the top-level handler, which logs it
//! to the error stream and takes the single fatal path — still removing the
//! job registration on the way out.

use crate::catalog::Catalog;
use crate::envstore::{
    grant_world_access, is_profile_restricted, mirror_to_shared, restricted_tree_root,
    AppendOutcome, EnvStore,
};
use crate::error::{BasecampError, Result};
use crate::install::component::ensure_component;
use crate::install::packages::{install_package_set, library_dir};
use crate::install::{ComponentOutcome, PackageSetOutcome};
use crate::lockfile::RunLock;
use crate::logs::{default_log_root, SetupLog};
use crate::report::RequirementsReport;
use crate::resolve::{Resolution, Resolver};
use crate::scheduler::{Launcher, JOB_NAME};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// The immutable record of one provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningRun {
    pub started_at: String,
    pub finished_at: String,
    pub install_dir: PathBuf,
    pub components: Vec<(String, ComponentOutcome)>,
    pub package_sets: Vec<PackageSetOutcome>,
    /// Verdict of the post-run re-probe, not of the outcomes above.
    pub overall_pass: bool,
}

/// Runs one end-to-end provisioning pass.
pub struct Orchestrator {
    catalog: Catalog,
    install_dir: PathBuf,
    log: SetupLog,
    env: EnvStore,
}

impl Orchestrator {
    pub fn new(catalog: Catalog, install_dir: &Path, log: SetupLog, env: EnvStore) -> Self {
        Self {
            catalog,
            install_dir: install_dir.to_path_buf(),
            log,
            env,
        }
    }

    /// The production entry point for the detached background job.
    ///
    /// Never returns an error and never panics outward: failure is
    /// communicated exclusively through the report file and error log,
    /// because the job host does not observe exit codes.
    pub fn execute_detached(install_dir: &Path) {
        let log = match SetupLog::open(&default_log_root()) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!("cannot open log root: {e}");
                return;
            }
        };

        let _lock = match RunLock::acquire(&log.lock_path()) {
            Ok(lock) => lock,
            Err(BasecampError::LockHeld { pid, .. }) => {
                // The active run owns cleanup, including job removal.
                log.info(&format!(
                    "Another provisioning run is active (pid {pid}); exiting"
                ));
                return;
            }
            Err(e) => {
                log.error(&format!("cannot acquire run lock: {e}"));
                Launcher::system().deregister(JOB_NAME, &log);
                return;
            }
        };

        let orchestrator = Self::new(Catalog::new(), install_dir, log.clone(), EnvStore::system());
        orchestrator.run();

        Launcher::system().deregister(JOB_NAME, &log);
    }

    /// Run with the top-level fault boundary in place.
    ///
    /// Returns `None` when an unhandled fault cut the run short.
    pub fn run(&self) -> Option<ProvisioningRun> {
        match catch_unwind(AssertUnwindSafe(|| self.provision())) {
            Ok(Ok(record)) => {
                self.log.info(&format!(
                    "Provisioning run finished (overall {})",
                    if record.overall_pass { "PASS" } else { "FAIL" }
                ));
                Some(record)
            }
            Ok(Err(e)) => {
                self.log.error(&format!("Unhandled fault: {e}"));
                None
            }
            Err(payload) => {
                self.log
                    .error(&format!("Unhandled fault: panic: {}", panic_message(&payload)));
                None
            }
        }
    }

    /// The sequential provisioning flow.
    fn provision(&self) -> Result<ProvisioningRun> {
        let started_at = timestamp();
        self.log.section(&format!(
            "Provisioning run starting (target {})",
            self.install_dir.display()
        ));
        std::fs::create_dir_all(&self.install_dir)?;

        // See what earlier runs already published before the first probe.
        self.env.refresh_process_env()?;
        let mut resolver = Resolver::new();
        resolver.add_dirs(self.env.published_dirs()?);

        let downloads = self.log.root().join("downloads");

        // Components, in declared dependency order.
        let mut resolved: HashMap<String, Resolution> = HashMap::new();
        let mut components = Vec::new();
        for spec in &self.catalog.components {
            let (outcome, resolution) = ensure_component(
                spec,
                &resolved,
                &mut resolver,
                &self.env,
                &self.log,
                &downloads,
            );
            resolved.insert(spec.name.clone(), resolution);
            components.push((spec.name.clone(), outcome));
        }

        // Package sets; a missing runtime skips, never aborts.
        let mut package_sets = Vec::new();
        for set in &self.catalog.package_sets {
            let runtime = resolved
                .get(&set.runtime)
                .cloned()
                .unwrap_or(Resolution::Absent);
            package_sets.push(install_package_set(set, &runtime, &self.install_dir, &self.log));
        }

        self.publish_environment(&resolved, &mut resolver);

        // The report re-probes ground truth; it does not read `components`
        // or `package_sets` above.
        let report =
            RequirementsReport::probe(&self.catalog, &self.install_dir, &resolver, &self.log);
        report.write(&self.log.report_path())?;
        self.log.info(&format!(
            "Requirements check written to {} (RESULT: {})",
            self.log.report_path().display(),
            if report.overall_pass() { "PASS" } else { "FAIL" }
        ));

        let record = ProvisioningRun {
            started_at,
            finished_at: timestamp(),
            install_dir: self.install_dir.clone(),
            components,
            package_sets,
            overall_pass: report.overall_pass(),
        };
        self.write_run_record(&record);

        Ok(record)
    }

    /// Publish every discovered install location to the machine-wide store.
    fn publish_environment(&self, resolved: &HashMap<String, Resolution>, resolver: &mut Resolver) {
        self.log.section("Publishing environment");

        for spec in &self.catalog.components {
            let Some(binary) = resolved.get(&spec.name).and_then(|r| r.path()) else {
                continue;
            };

            let publish_binary = self.shared_binary_path(binary);
            let Some(bin_dir) = publish_binary.parent().map(Path::to_path_buf) else {
                continue;
            };

            // System prefixes are already world-readable.
            if !bin_dir.starts_with("/usr") {
                if let Err(e) = grant_world_access(&bin_dir) {
                    self.log
                        .error(&format!("access grant on {} failed: {e}", bin_dir.display()));
                }
            }

            match self.env.publish("PATH", &bin_dir) {
                Ok(AppendOutcome::Appended) => self
                    .log
                    .info(&format!("Published {} to PATH", bin_dir.display())),
                Ok(AppendOutcome::AlreadyPresent) => self
                    .log
                    .info(&format!("{} already on PATH", bin_dir.display())),
                Err(e) => self
                    .log
                    .error(&format!("publishing {} failed: {e}", bin_dir.display())),
            }
            resolver.add_dirs([bin_dir]);
        }

        for set in &self.catalog.package_sets {
            let Some(lib) = library_dir(set, &self.install_dir) else {
                continue;
            };
            if !lib.is_dir() {
                continue;
            }
            match self.env.publish("R_LIBS_SITE", &lib) {
                Ok(AppendOutcome::Appended) => self
                    .log
                    .info(&format!("Published {} to R_LIBS_SITE", lib.display())),
                Ok(AppendOutcome::AlreadyPresent) => {}
                Err(e) => self
                    .log
                    .error(&format!("publishing {} failed: {e}", lib.display())),
            }
        }
    }

    /// The path to publish for a binary, mirroring profile-restricted trees
    /// to the world-readable share first.
    ///
    /// The background job runs under the most-privileged account, whose
    /// profile directories are frequently unreadable by ordinary accounts.
    fn shared_binary_path(&self, binary: &Path) -> PathBuf {
        if !is_profile_restricted(binary) {
            return binary.to_path_buf();
        }
        let Some(tree) = restricted_tree_root(binary) else {
            return binary.to_path_buf();
        };
        let Ok(relative) = binary.strip_prefix(&tree) else {
            return binary.to_path_buf();
        };

        let shared_root = self.log.root().join("shared");
        match std::fs::create_dir_all(&shared_root)
            .map_err(BasecampError::from)
            .and_then(|()| mirror_to_shared(&tree, &shared_root))
        {
            Ok(mirrored) => {
                self.log.info(&format!(
                    "Mirrored restricted tree {} to {}",
                    tree.display(),
                    mirrored.display()
                ));
                mirrored.join(relative)
            }
            Err(e) => {
                self.log.error(&format!(
                    "mirroring {} failed, publishing original: {e}",
                    tree.display()
                ));
                binary.to_path_buf()
            }
        }
    }

    fn write_run_record(&self, record: &ProvisioningRun) {
        match serde_json::to_string_pretty(record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.log.run_record_path(), json) {
                    self.log.error(&format!("writing run record failed: {e}"));
                }
            }
            Err(e) => self.log.error(&format!("serializing run record failed: {e}")),
        }
    }
}

/// Re-probe and rewrite the requirements report without installing.
pub fn check(install_dir: &Path, log: &SetupLog) -> Result<RequirementsReport> {
    let catalog = Catalog::new();
    let env = EnvStore::system();
    let _ = env.refresh_process_env();

    let mut resolver = Resolver::new();
    if let Ok(dirs) = env.published_dirs() {
        resolver.add_dirs(dirs);
    }

    let report = RequirementsReport::probe(&catalog, install_dir, &resolver, log);
    report.write(&log.report_path())?;
    Ok(report)
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ComponentSpec, InstallMethod, PackageManagerKind, PackageSet};
    use crate::resolve::{ProbePlan, ProbeStrategy};
    use std::fs;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (SetupLog, EnvStore) {
        (
            SetupLog::open(&temp.path().join("logs")).unwrap(),
            EnvStore::at(temp.path().join("environment")),
        )
    }

    fn probe_only_spec(name: &str, binary: &str, dir: &Path) -> ComponentSpec {
        ComponentSpec {
            name: name.to_string(),
            display: name.to_string(),
            minimum_version: None,
            probe: ProbePlan {
                binary: binary.to_string(),
                strategies: vec![ProbeStrategy::FixedDirs(vec![dir.to_path_buf()])],
                version_query: None,
            },
            layout_variants: vec![],
            urls: vec![],
            artifact_name: "artifact".to_string(),
            expected_sha256: None,
            install: InstallMethod::RunArtifact { args: vec![] },
            install_timeout_secs: 30,
            requires: vec![],
        }
    }

    #[cfg(unix)]
    fn create_fake_binary(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn satisfied_catalog_passes_and_writes_report() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        create_fake_binary(&bin.join("toolA"));

        let catalog = Catalog {
            components: vec![probe_only_spec("toolA", "toolA", &bin)],
            package_sets: vec![],
        };

        let (log, env) = setup(&temp);
        let orchestrator =
            Orchestrator::new(catalog, &temp.path().join("lab"), log.clone(), env);

        let record = orchestrator.run().unwrap();
        assert!(record.overall_pass);
        assert!(matches!(
            record.components[0].1,
            ComponentOutcome::AlreadySatisfied { .. }
        ));

        let report = fs::read_to_string(log.report_path()).unwrap();
        assert!(report.contains("[PASS] toolA"));
        assert!(report.trim_end().ends_with("RESULT: PASS"));

        // Run record is written for diagnostics.
        let record_json = fs::read_to_string(log.run_record_path()).unwrap();
        assert!(record_json.contains("toolA"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_component_still_reaches_report() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        create_fake_binary(&bin.join("present"));

        let catalog = Catalog {
            components: vec![
                probe_only_spec("absent", "absent", &temp.path().join("nowhere")),
                probe_only_spec("present", "present", &bin),
            ],
            package_sets: vec![],
        };

        let (log, env) = setup(&temp);
        let orchestrator =
            Orchestrator::new(catalog, &temp.path().join("lab"), log.clone(), env);

        let record = orchestrator.run().unwrap();
        assert!(!record.overall_pass);
        // The failure of 'absent' did not block 'present'.
        assert!(matches!(record.components[0].1, ComponentOutcome::Failed { .. }));
        assert!(record.components[1].1.is_satisfied());

        let report = fs::read_to_string(log.report_path()).unwrap();
        assert!(report.contains("[FAIL] absent"));
        assert!(report.contains("[PASS] present"));
        assert!(report.trim_end().ends_with("RESULT: FAIL"));
    }

    #[cfg(unix)]
    #[test]
    fn dependent_of_failed_component_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut dependent =
            probe_only_spec("dependent", "dependent", &temp.path().join("nowhere"));
        dependent.requires = vec!["base".to_string()];

        let catalog = Catalog {
            components: vec![
                probe_only_spec("base", "base", &temp.path().join("nowhere")),
                dependent,
            ],
            package_sets: vec![],
        };

        let (log, env) = setup(&temp);
        let orchestrator = Orchestrator::new(catalog, &temp.path().join("lab"), log, env);

        let record = orchestrator.run().unwrap();
        assert_eq!(
            record.components[1].1,
            ComponentOutcome::SkippedMissingDependency {
                dependency: "base".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn missing_runtime_skips_package_set_in_record_and_fails_report() {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog {
            components: vec![probe_only_spec("r", "Rscript", &temp.path().join("nowhere"))],
            package_sets: vec![PackageSet {
                name: "cran".to_string(),
                runtime: "r".to_string(),
                kind: PackageManagerKind::Cran,
                library_subdir: Some("r-library".to_string()),
                packages: vec!["readr".to_string()],
            }],
        };

        let (log, env) = setup(&temp);
        let orchestrator =
            Orchestrator::new(catalog, &temp.path().join("lab"), log.clone(), env);

        let record = orchestrator.run().unwrap();
        assert!(!record.overall_pass);
        assert_eq!(record.package_sets[0].installed_count(), 0);

        let report = fs::read_to_string(log.report_path()).unwrap();
        assert!(report.contains("Packages (cran):"));
        assert!(report.contains("[FAIL] readr"));
        assert!(report.contains("Installed: 0/1"));
    }

    #[cfg(unix)]
    #[test]
    fn report_authority_is_fresh_probe_not_outcomes() {
        // A component that resolves satisfied during install, then vanishes
        // before the report probe, must show FAIL.
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        create_fake_binary(&bin.join("ephemeral"));

        let catalog = Catalog {
            components: vec![probe_only_spec("ephemeral", "ephemeral", &bin)],
            package_sets: vec![],
        };

        let (log, env) = setup(&temp);
        let install_dir = temp.path().join("lab");

        // Drive the phases manually to interleave the deletion.
        let orchestrator = Orchestrator::new(catalog.clone(), &install_dir, log.clone(), env);
        let mut resolver = Resolver::new();
        let mut resolved = HashMap::new();
        let (outcome, resolution) = ensure_component(
            &catalog.components[0],
            &resolved,
            &mut resolver,
            &orchestrator.env,
            &log,
            &temp.path().join("downloads"),
        );
        assert!(outcome.is_satisfied());
        resolved.insert("ephemeral".to_string(), resolution);

        // The artifact disappears after the installer claimed success.
        fs::remove_file(bin.join("ephemeral")).unwrap();

        let report = RequirementsReport::probe(&catalog, &install_dir, &resolver, &log);
        assert!(!report.overall_pass());
    }

    #[cfg(unix)]
    #[test]
    fn environment_publishing_is_idempotent_across_runs() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("opt-tool/bin");
        create_fake_binary(&bin.join("tool"));

        let catalog = Catalog {
            components: vec![probe_only_spec("tool", "tool", &bin)],
            package_sets: vec![],
        };

        let (log, env) = setup(&temp);
        let install_dir = temp.path().join("lab");

        Orchestrator::new(catalog.clone(), &install_dir, log.clone(), env.clone())
            .run()
            .unwrap();
        Orchestrator::new(catalog, &install_dir, log, env.clone())
            .run()
            .unwrap();

        let path_value = env.get("PATH").unwrap().unwrap();
        assert_eq!(
            path_value.matches(&bin.to_string_lossy().to_string()).count(),
            1
        );
    }

    #[test]
    fn fault_boundary_catches_panics() {
        let temp = TempDir::new().unwrap();
        let (log, env) = setup(&temp);

        // An install dir that cannot be created forces an early fault.
        let bogus = temp.path().join("file-not-dir");
        fs::write(&bogus, "occupied").unwrap();
        let catalog = Catalog {
            components: vec![],
            package_sets: vec![],
        };
        let orchestrator =
            Orchestrator::new(catalog, &bogus.join("sub"), log.clone(), env);

        assert!(orchestrator.run().is_none());
        let errors = fs::read_to_string(log.error_path()).unwrap();
        assert!(errors.contains("Unhandled fault"));
    }

    #[test]
    fn panic_message_downcasts_str_and_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
