// src/protect.rs

//! Config-file protection
//!
//! A destination is protected iff it or an ancestor matches a protect
//! prefix, no mask prefix overrides it, the destination exists, is
//! readable and is a text file (binary files are never protected), and the
//! incoming file is not a dangling symlink. Protected files are not
//! overwritten; the hook layer allocates a sibling candidate name instead.
//! A configured skip list unconditionally suppresses protection for
//! specific paths.

use crate::error::Result;
use crate::hooks::PackageHooks;
use crate::settings::ClientSettings;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bytes inspected by the text sniff
const SNIFF_BLOCK: usize = 512;

/// Protect/mask/skip path sets mapped onto the live root
#[derive(Debug, Clone, Default)]
pub struct ProtectSets {
    pub protect: Vec<PathBuf>,
    pub mask: Vec<PathBuf>,
    pub skip: HashSet<PathBuf>,
}

impl ProtectSets {
    /// Combine the client-wide lists with the per-package ones, anchoring
    /// every entry under the live root.
    pub fn assemble(
        settings: &ClientSettings,
        package_protect: &[String],
        package_mask: &[String],
    ) -> Self {
        let anchor = |entries: &[String], extra: &[String]| -> Vec<PathBuf> {
            entries
                .iter()
                .chain(extra.iter())
                .map(|p| settings.live_path(p))
                .collect()
        };
        Self {
            protect: anchor(&settings.config_protect, package_protect),
            mask: anchor(&settings.config_protect_mask, package_mask),
            skip: settings
                .config_protect_skip
                .iter()
                .map(|p| settings.live_path(p))
                .collect(),
        }
    }
}

/// Outcome of the protection decision for one destination
#[derive(Debug)]
pub struct ProtectOutcome {
    /// Destination lies within a config-protected area
    pub in_mask: bool,
    /// Destination must not be overwritten directly
    pub protected: bool,
    /// Where the file should actually be written (a `._cfg` sibling when
    /// protection allocated one)
    pub dest: PathBuf,
    /// Skip this entry entirely (skip-listed, or an identical pending
    /// update already exists)
    pub skip: bool,
}

/// Whether a prefix set covers a path: the path itself or any ancestor
/// directory matches an entry
fn covered_by(set: &[PathBuf], path: &Path) -> bool {
    if set.iter().any(|e| e == path) {
        return true;
    }
    let mut cursor = path.parent();
    while let Some(dir) = cursor {
        if set.iter().any(|e| e == dir) {
            return true;
        }
        cursor = dir.parent();
    }
    false
}

/// Text sniff: empty files are text, NUL bytes or a high proportion of
/// non-printable bytes make a file binary
pub fn istextfile(path: &Path) -> bool {
    let mut block = [0u8; SNIFF_BLOCK];
    let n = match File::open(path).and_then(|mut f| f.read(&mut block)) {
        Ok(n) => n,
        Err(_) => return false,
    };
    is_text(&block[..n])
}

fn is_text(block: &[u8]) -> bool {
    if block.is_empty() {
        return true;
    }
    if block.contains(&0) {
        return false;
    }
    let non_text = block
        .iter()
        .filter(|b| !matches!(**b, 0x20..=0x7e | b'\n' | b'\r' | b'\t' | 0x08))
        .count();
    (non_text as f64 / block.len() as f64) <= 0.30
}

/// Decide whether `dest` is config-protected and where the incoming file
/// should land.
///
/// `source` is the file about to be installed (`None` on the removal
/// path). With `do_allocation` set, a protected destination gets a sibling
/// candidate name from the hook layer.
pub fn handle_config_protect(
    sets: &ProtectSets,
    hooks: &dyn PackageHooks,
    source: Option<&Path>,
    dest: &Path,
    do_allocation: bool,
    quiet: bool,
) -> Result<ProtectOutcome> {
    let mut outcome = ProtectOutcome {
        in_mask: false,
        protected: false,
        dest: dest.to_path_buf(),
        skip: false,
    };

    if covered_by(&sets.protect, dest) {
        outcome.protected = true;
        outcome.in_mask = true;
    }
    if outcome.protected && covered_by(&sets.mask, dest) {
        outcome.protected = false;
        outcome.in_mask = false;
    }

    if dest.symlink_metadata().is_err() {
        // nothing to protect yet
        outcome.protected = false;
    }

    if outcome.protected {
        outcome.protected = istextfile(dest);
        outcome.in_mask = outcome.protected;
    }

    if let Some(source) = source {
        if outcome.protected
            && source.symlink_metadata().is_ok()
            && source.is_symlink()
            && !source.exists()
        {
            warn!(
                "cannot protect broken symlink in package: {}",
                dest.display()
            );
            outcome.protected = false;
        }
    }

    if !outcome.protected {
        return Ok(outcome);
    }

    if sets.skip.contains(dest) {
        if !quiet {
            warn!(
                "skipping file installation/removal as configured: {}",
                dest.display()
            );
        }
        outcome.skip = true;
        return Ok(outcome);
    }

    if do_allocation {
        let source = source.unwrap_or(dest);
        let (candidate, still_needed) = hooks.allocate_protected_path(source, dest)?;
        if !still_needed {
            // an identical pending update is already in place
            outcome.protected = false;
            outcome.skip = true;
            return Ok(outcome);
        }
        outcome.dest = candidate;
    }

    if !quiet {
        info!("protecting config file: {}", dest.display());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultHooks;
    use std::fs;
    use tempfile::tempdir;

    fn sets_for(root: &Path) -> ProtectSets {
        ProtectSets {
            protect: vec![root.join("etc")],
            mask: vec![root.join("etc/unprotected")],
            skip: HashSet::new(),
        }
    }

    #[test]
    fn test_is_text_heuristics() {
        assert!(is_text(b""));
        assert!(is_text(b"# a config file\nkey = value\n"));
        assert!(!is_text(b"\x7fELF\x02\x01\x01\x00\x00\x00binary"));
        assert!(!is_text(&[0xff; 64]));
    }

    #[test]
    fn test_existing_text_file_under_protect_prefix_is_protected() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        let dest = root.join("etc/app.conf");
        fs::write(&dest, b"option = 1\n").unwrap();
        let source = root.join("image-app.conf");
        fs::write(&source, b"option = 2\n").unwrap();

        let outcome = handle_config_protect(
            &sets_for(root),
            &DefaultHooks,
            Some(&source),
            &dest,
            true,
            true,
        )
        .unwrap();
        assert!(outcome.protected);
        assert!(outcome.in_mask);
        // the write target moved to a ._cfg sibling
        assert_ne!(outcome.dest, dest);
        assert!(
            outcome
                .dest
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("._cfg0000_")
        );
    }

    #[test]
    fn test_mask_prefix_overrides_protection() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc/unprotected")).unwrap();
        let dest = root.join("etc/unprotected/app.conf");
        fs::write(&dest, b"option = 1\n").unwrap();

        let outcome =
            handle_config_protect(&sets_for(root), &DefaultHooks, None, &dest, false, true)
                .unwrap();
        assert!(!outcome.protected);
        assert!(!outcome.in_mask);
    }

    #[test]
    fn test_missing_destination_is_not_protected() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let dest = root.join("etc/never-installed.conf");

        let outcome =
            handle_config_protect(&sets_for(root), &DefaultHooks, None, &dest, false, true)
                .unwrap();
        assert!(!outcome.protected);
    }

    #[test]
    fn test_binary_destination_is_never_protected() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        let dest = root.join("etc/blob.bin");
        fs::write(&dest, [0u8, 1, 2, 3, 0xff, 0xfe]).unwrap();

        let outcome =
            handle_config_protect(&sets_for(root), &DefaultHooks, None, &dest, false, true)
                .unwrap();
        assert!(!outcome.protected);
    }

    #[test]
    fn test_skip_list_suppresses_protection() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        let dest = root.join("etc/app.conf");
        fs::write(&dest, b"option = 1\n").unwrap();

        let mut sets = sets_for(root);
        sets.skip.insert(dest.clone());

        let outcome =
            handle_config_protect(&sets, &DefaultHooks, None, &dest, false, true).unwrap();
        assert!(outcome.skip);
        assert!(outcome.protected);
    }

    #[test]
    fn test_dangling_symlink_source_is_not_protected() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        let dest = root.join("etc/app.conf");
        fs::write(&dest, b"option = 1\n").unwrap();

        let source = root.join("dangling");
        std::os::unix::fs::symlink(root.join("gone"), &source).unwrap();

        let outcome = handle_config_protect(
            &sets_for(root),
            &DefaultHooks,
            Some(&source),
            &dest,
            false,
            true,
        )
        .unwrap();
        assert!(!outcome.protected);
    }
}
