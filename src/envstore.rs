//! Machine-wide environment publishing.
//!
//! Components installed mid-run must be visible to later steps of this run,
//! to the primary application, and to other processes — without a reboot.
//! The store is a world-readable `VAR=value` file at a fixed system
//! location, re-read on refresh; on Windows each publish additionally goes
//! through `setx /M` so the registry store stays in sync.
//!
//! Appends are idempotent: a directory already present in a variable's
//! value is never appended again, however many times provisioning runs.
//!
//! Trees that land under a privileged account's profile are unreadable by
//! ordinary accounts, so such trees are copied to a world-readable share
//! and the copy's path is what gets published.

use crate::error::Result;
use crate::shell::{run, Invocation, RunOptions};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Wait ceiling for permission-grant child processes.
const GRANT_TIMEOUT_SECS: u64 = 300;

/// Outcome of publishing one environment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The directory was appended to the variable.
    Appended,
    /// The directory was already present; nothing changed.
    AlreadyPresent,
}

/// The machine-wide, reboot-independent environment store.
#[derive(Debug, Clone)]
pub struct EnvStore {
    store_path: PathBuf,
}

impl EnvStore {
    /// The store at its fixed system location.
    pub fn system() -> Self {
        let store_path = if cfg!(windows) {
            PathBuf::from(r"C:\ProgramData\Basecamp\environment")
        } else {
            PathBuf::from("/etc/profile.d/basecamp.env")
        };
        Self { store_path }
    }

    /// A store backed by an explicit file (tests, portable installs).
    pub fn at(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.store_path
    }

    /// Append `dir` to list-valued `var`, at most once.
    ///
    /// The presence check matches whole separator-delimited entries, so
    /// `/opt/quarto/bin` does not satisfy a check for `/opt/quarto`.
    /// The new value is also applied to this process's environment so the
    /// current run sees it immediately.
    pub fn publish(&self, var: &str, dir: &Path) -> Result<AppendOutcome> {
        let mut entries = self.read_entries()?;
        let dir_str = dir.to_string_lossy().to_string();
        let separator = path_separator();

        let current = entries.get(var).cloned().unwrap_or_default();
        if current
            .split(separator)
            .any(|existing| !existing.is_empty() && existing == dir_str)
        {
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let updated = if current.is_empty() {
            dir_str.clone()
        } else {
            format!("{current}{separator}{dir_str}")
        };
        entries.insert(var.to_string(), updated.clone());
        self.write_entries(&entries)?;

        apply_to_process(var, &dir_str);

        if cfg!(windows) {
            // Best-effort registry sync; the store file remains authoritative
            // for this orchestrator.
            let _ = run(
                &setx_invocation(var, &updated),
                &RunOptions::with_timeout(GRANT_TIMEOUT_SECS),
            );
        }

        Ok(AppendOutcome::Appended)
    }

    /// Re-read the store and merge every entry into the process environment.
    ///
    /// Called after each component install so later steps resolve binaries
    /// the install just published.
    pub fn refresh_process_env(&self) -> Result<()> {
        for (var, value) in self.read_entries()? {
            for entry in value.split(path_separator()) {
                if !entry.is_empty() {
                    apply_to_process(&var, entry);
                }
            }
        }
        Ok(())
    }

    /// Every directory currently published, across all variables.
    pub fn published_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for value in self.read_entries()?.values() {
            for entry in value.split(path_separator()) {
                if !entry.is_empty() {
                    let dir = PathBuf::from(entry);
                    if !dirs.contains(&dir) {
                        dirs.push(dir);
                    }
                }
            }
        }
        Ok(dirs)
    }

    /// The stored value of one variable, if any.
    pub fn get(&self, var: &str) -> Result<Option<String>> {
        Ok(self.read_entries()?.get(var).cloned())
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        let content = match fs::read_to_string(&self.store_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((var, value)) = line.split_once('=') {
                entries.insert(var.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut content = String::from("# Managed by basecamp; edits are preserved per-variable.\n");
        for (var, value) in entries {
            content.push_str(&format!("{var}={value}\n"));
        }
        fs::write(&self.store_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.store_path, fs::Permissions::from_mode(0o644));
        }
        Ok(())
    }
}

/// Merge one directory entry into the process environment.
///
/// List-valued variables get the entry appended if missing; everything else
/// is set outright.
fn apply_to_process(var: &str, entry: &str) {
    let separator = path_separator();
    match std::env::var(var) {
        Ok(current) => {
            if !current.split(separator).any(|e| e == entry) {
                std::env::set_var(var, format!("{current}{separator}{entry}"));
            }
        }
        Err(_) => std::env::set_var(var, entry),
    }
}

fn path_separator() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

/// `setx /M` argv for one variable (Windows registry sync).
pub fn setx_invocation(var: &str, value: &str) -> Invocation {
    Invocation::new("setx", &["/M", var, value])
}

/// Argv granting read/execute on a tree to all local accounts.
pub fn grant_invocation(path: &Path) -> Invocation {
    if cfg!(windows) {
        Invocation::new(
            "icacls",
            &[
                &path.to_string_lossy(),
                "/grant",
                "*S-1-1-0:(OI)(CI)RX",
                "/T",
                "/Q",
            ],
        )
    } else {
        Invocation::new("chmod", &["-R", "a+rX", &path.to_string_lossy()])
    }
}

/// Grant read/execute access on `path` to non-privileged accounts.
pub fn grant_world_access(path: &Path) -> Result<()> {
    run(
        &grant_invocation(path),
        &RunOptions::with_timeout(GRANT_TIMEOUT_SECS),
    )?;
    Ok(())
}

/// Whether a tree lives under an account profile that other accounts
/// typically cannot read.
pub fn is_profile_restricted(path: &Path) -> bool {
    let s = path.to_string_lossy().to_lowercase();
    if cfg!(windows) {
        s.contains(r"\users\") || s.contains("systemprofile")
    } else {
        s.starts_with("/root/") || s.starts_with("/home/")
    }
}

/// The top of the install tree a profile-restricted binary belongs to:
/// the ancestor directly under the profile home.
///
/// `/root/.TinyTeX/bin/x86_64-linux/tlmgr` → `/root/.TinyTeX`;
/// `C:\Users\x\AppData\Roaming\TinyTeX\bin\...` → `...\Roaming\TinyTeX`.
pub fn restricted_tree_root(binary: &Path) -> Option<PathBuf> {
    if !is_profile_restricted(binary) {
        return None;
    }

    let ancestors: Vec<&Path> = binary.ancestors().collect();

    if cfg!(windows) {
        // The tree root is the child of AppData\Roaming (or \Local).
        for pair in ancestors.windows(2) {
            let parent_name = pair[1]
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase());
            if matches!(parent_name.as_deref(), Some("roaming") | Some("local")) {
                return Some(pair[0].to_path_buf());
            }
        }
        return None;
    }

    // The tree root is the child of /root or /home/<user>.
    for pair in ancestors.windows(2) {
        let parent = pair[1];
        let is_profile_home = parent == Path::new("/root")
            || (parent.parent() == Some(Path::new("/home")));
        if is_profile_home && pair[0] != binary {
            return Some(pair[0].to_path_buf());
        }
    }
    None
}

/// Copy a profile-restricted tree to a world-readable location.
///
/// Returns the destination, which is what should be published instead of
/// the original. Existing destination content is replaced.
pub fn mirror_to_shared(src: &Path, shared_root: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "mirror".into());
    let dest = shared_root.join(name);

    if dest.exists() {
        fs::remove_dir_all(&dest)?;
    }
    copy_tree(src, &dest)?;
    grant_world_access(&dest)?;
    Ok(dest)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
        // Symlinks inside toolchain trees are skipped; the binaries they
        // point at are copied under their real names.
    }
    Ok(())
}
