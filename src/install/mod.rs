//! Component and package installation.
//!
//! Installers record outcomes instead of propagating errors: one failed
//! dependency never blocks independent dependencies, and the run always
//! reaches the report generator no matter how many items failed.

pub mod component;
pub mod packages;

use serde::{Deserialize, Serialize};

/// Terminal outcome for one component in a provisioning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentOutcome {
    /// Satisfied before this run touched it; no download, no install.
    AlreadySatisfied { detail: String },

    /// Installed (or upgraded) by this run and confirmed by re-resolution.
    Installed { detail: String },

    /// Not satisfied after all install attempts.
    Failed { reason: String },

    /// Not attempted: a component it requires did not end satisfied.
    SkippedMissingDependency { dependency: String },
}

impl ComponentOutcome {
    /// Whether the component ended the run satisfied.
    pub fn is_satisfied(&self) -> bool {
        matches!(
            self,
            ComponentOutcome::AlreadySatisfied { .. } | ComponentOutcome::Installed { .. }
        )
    }
}

/// Terminal outcome for one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PackageOutcome {
    /// Present in the installed-package index after this run.
    Installed,

    /// Absent after batch install and individual retry.
    Failed { reason: String },

    /// Not attempted: the runtime component is not satisfied.
    SkippedMissingRuntime,
}

impl PackageOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, PackageOutcome::Installed)
    }
}

/// Aggregate outcome for one declared package set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSetOutcome {
    /// Set name (`cran`, `texlive`).
    pub set: String,
    /// Per-package outcome, in declared order; never silently dropped.
    pub packages: Vec<(String, PackageOutcome)>,
}

impl PackageSetOutcome {
    /// Count of packages that ended installed.
    pub fn installed_count(&self) -> usize {
        self.packages
            .iter()
            .filter(|(_, o)| o.is_installed())
            .count()
    }

    /// Total declared packages.
    pub fn total(&self) -> usize {
        self.packages.len()
    }

    /// `Installed: n/total` summary line.
    pub fn summary(&self) -> String {
        format!("Installed: {}/{}", self.installed_count(), self.total())
    }

    /// Whether every declared package ended installed.
    pub fn all_installed(&self) -> bool {
        self.installed_count() == self.total()
    }
}
