//! Path/version resolution for installed components.
//!
//! Answers one question with no side effects: is this component installed,
//! where, and at what version? Used before install (skip if satisfied),
//! after install (confirm success), and again by the report generator
//! (which never trusts the installers' bookkeeping).

pub mod probe;
pub mod version;

pub use probe::{
    find_in_dirs, parse_system_path, ProbePlan, ProbeStrategy, Resolution, Resolver, VersionQuery,
};
pub use version::{extract_version, Version};
