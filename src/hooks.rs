// src/hooks.rs

//! Source-package-manager hook interface
//!
//! The engine delegates phase scripts, protected-file name allocation and
//! installed-package registration to an external hook layer. The default
//! implementation runs no scripts but still allocates `._cfg####_` sibling
//! names so config protection works standalone.

use crate::error::Result;
use crate::verify::sha256_file;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Named hook phases executed around install/remove/config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Setup,
    Preinstall,
    Postinstall,
    Preremove,
    Postremove,
    Configure,
}

impl HookPhase {
    pub fn as_str(&self) -> &str {
        match self {
            HookPhase::Setup => "setup",
            HookPhase::Preinstall => "preinstall",
            HookPhase::Postinstall => "postinstall",
            HookPhase::Preremove => "preremove",
            HookPhase::Postremove => "postremove",
            HookPhase::Configure => "configure",
        }
    }
}

/// External hook layer contract
pub trait PackageHooks {
    /// Execute a phase script; 0 continues the pipeline
    fn execute_phase(&self, phase: HookPhase, atom: &str) -> i32;

    /// Allocate the sibling name a protected file should be written to.
    ///
    /// Returns the candidate path and whether protection is still needed;
    /// `false` means an identical pending update is already in place.
    fn allocate_protected_path(&self, source: &Path, dest: &Path) -> Result<(PathBuf, bool)>;

    /// Register a freshly installed package with the source package manager
    fn register_installed(&self, atom: &str) -> i32;

    /// Deregister a removed package
    fn deregister_installed(&self, atom: &str) -> i32;
}

/// Hook layer that runs no scripts
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl PackageHooks for DefaultHooks {
    fn execute_phase(&self, phase: HookPhase, atom: &str) -> i32 {
        debug!("{} phase for {} (no hook layer)", phase.as_str(), atom);
        0
    }

    fn allocate_protected_path(&self, source: &Path, dest: &Path) -> Result<(PathBuf, bool)> {
        allocate_cfg_sibling(source, dest)
    }

    fn register_installed(&self, atom: &str) -> i32 {
        debug!("register {} (no hook layer)", atom);
        0
    }

    fn deregister_installed(&self, atom: &str) -> i32 {
        debug!("deregister {} (no hook layer)", atom);
        0
    }
}

/// Find the `._cfg####_<name>` sibling a protected update should land in.
///
/// Walks the counter upwards until a free slot is found. If the newest
/// pending candidate already carries the same content as `source`, no new
/// slot is allocated and protection is reported as not needed.
pub fn allocate_cfg_sibling(source: &Path, dest: &Path) -> Result<(PathBuf, bool)> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("/"));
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut last_existing: Option<PathBuf> = None;
    let mut free: Option<PathBuf> = None;
    for counter in 0..10000u32 {
        let candidate = dir.join(format!("._cfg{:04}_{}", counter, name));
        if candidate.exists() {
            last_existing = Some(candidate);
        } else {
            free = Some(candidate);
            break;
        }
    }

    if let Some(existing) = last_existing {
        let same = match (sha256_file(source), sha256_file(&existing)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same {
            // identical pending update already queued
            return Ok((existing, false));
        }
    }

    let candidate = free.unwrap_or_else(|| dir.join(format!("._cfg9999_{}", name)));
    Ok((candidate, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_allocates_first_free_slot() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("image-conf");
        fs::write(&source, b"new content").unwrap();
        let dest = dir.path().join("conf");
        fs::write(&dest, b"live content").unwrap();

        let (path, needed) = allocate_cfg_sibling(&source, &dest).unwrap();
        assert!(needed);
        assert_eq!(path, dir.path().join("._cfg0000_conf"));
    }

    #[test]
    fn test_skips_taken_slots() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("image-conf");
        fs::write(&source, b"new content").unwrap();
        let dest = dir.path().join("conf");
        fs::write(dir.path().join("._cfg0000_conf"), b"old pending").unwrap();

        let (path, needed) = allocate_cfg_sibling(&source, &dest).unwrap();
        assert!(needed);
        assert_eq!(path, dir.path().join("._cfg0001_conf"));
    }

    #[test]
    fn test_identical_pending_update_is_not_duplicated() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("image-conf");
        fs::write(&source, b"new content").unwrap();
        let dest = dir.path().join("conf");
        fs::write(dir.path().join("._cfg0000_conf"), b"new content").unwrap();

        let (path, needed) = allocate_cfg_sibling(&source, &dest).unwrap();
        assert!(!needed);
        assert_eq!(path, dir.path().join("._cfg0000_conf"));
    }
}
