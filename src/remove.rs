// src/remove.rs

//! Filesystem remover
//!
//! Streams a package's content ledger in descending path order (children
//! before parents), deleting plain files and symlinks immediately while
//! deferring directories into a candidate set. A second phase removes
//! emptied directories to a fixpoint so emptied parents cascade. The same
//! config-protection rules as the installer apply, including the
//! never-modified automerge exception, and entries now owned by another
//! package are excluded from the ledger instead of removed.

use crate::content::{ContentReader, filter_content_file};
use crate::error::Result;
use crate::hooks::PackageHooks;
use crate::install::info_directories;
use crate::protect::{ProtectSets, handle_config_protect};
use crate::repository::Repository;
use crate::settings::ClientSettings;
use crate::verify::sha256_file;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};

const INFO_EXTS: [&str; 2] = [".gz", ".bz2"];

/// Deferred directory candidate kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DirKind {
    Dir,
    Link,
}

/// What the removal touched, handed to the hook layer
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub affected_directories: BTreeSet<String>,
    pub affected_infofiles: BTreeSet<String>,
}

/// One package content removal from the live root
pub struct Remover<'a> {
    pub settings: &'a ClientSettings,
    pub hooks: &'a dyn PackageHooks,
    pub installed: &'a dyn Repository,
    pub protect: ProtectSets,
    /// Remove config files too, skipping protection entirely
    pub remove_config: bool,
    /// Automerge digests recorded at install time
    pub automerge: HashMap<String, String>,
    pub outcome: RemoveOutcome,
    info_dirs: Vec<String>,
}

impl<'a> Remover<'a> {
    pub fn new(
        settings: &'a ClientSettings,
        hooks: &'a dyn PackageHooks,
        installed: &'a dyn Repository,
        protect: ProtectSets,
        remove_config: bool,
        automerge: HashMap<String, String>,
    ) -> Self {
        Self {
            settings,
            hooks,
            installed,
            protect,
            remove_config,
            automerge,
            outcome: RemoveOutcome::default(),
            info_dirs: info_directories(),
        }
    }

    /// Remove the ledger's content from the live root. The ledger file is
    /// rewritten to exclude entries kept back by collision detection, so
    /// later diff/merge passes stay consistent.
    pub fn remove_content(&mut self, ledger: &ContentReader) -> Result<()> {
        let mut directories: BTreeSet<(PathBuf, DirKind)> = BTreeSet::new();
        let mut directories_cache: HashSet<PathBuf> = HashSet::new();
        let mut kept_by_collision: HashSet<String> = HashSet::new();

        for record in ledger.iter()? {
            let record = record?;
            if record.path.is_empty() {
                continue;
            }

            let live = self.settings.live_path(&record.path);

            // collision check: the path may belong to another package now
            if self.settings.collision_protect > 0 {
                let owners = self.installed.file_owners(&record.path).unwrap_or_default();
                if !owners.is_empty() && live.is_file() {
                    warn!(
                        "collision found during removal of {} - not removing",
                        live.display()
                    );
                    kept_by_collision.insert(record.path.clone());
                    continue;
                }
            }

            let mut protected = false;
            let mut in_mask = false;
            if !self.remove_config {
                let outcome =
                    handle_config_protect(&self.protect, self.hooks, None, &live, false, true)?;
                protected = outcome.protected || outcome.skip;
                in_mask = outcome.in_mask;
            }

            // files never modified by the user can go even when protected
            if in_mask {
                if let Some(recorded) = self.automerge.get(&record.path) {
                    let live_digest = sha256_file(&live).unwrap_or_else(|_| "?".to_string());
                    if *recorded == live_digest {
                        info!(
                            "removing config file, never modified: {}",
                            record.path
                        );
                        protected = false;
                    }
                }
            }

            if protected {
                warn!("[remove] protecting config file: {}", live.display());
                continue;
            }

            match live.symlink_metadata() {
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            if live.is_dir() && live.is_symlink() {
                // valid directory symlink: defer like a directory
                if directories_cache.insert(live.clone()) {
                    self.outcome
                        .affected_directories
                        .insert(record.path.clone());
                    directories.insert((live, DirKind::Link));
                }
                continue;
            }
            if live.is_dir() {
                if directories_cache.insert(live.clone()) {
                    self.outcome
                        .affected_directories
                        .insert(record.path.clone());
                    directories.insert((live, DirKind::Dir));
                }
                continue;
            }

            // plain file, symlink or broken directory symlink: remove now
            if let Err(err) = fs::remove_file(&live) {
                warn!("[remove] unable to remove {}: {}", live.display(), err);
                continue;
            }

            let dir_name = match record.path.rsplit_once('/') {
                Some((dir, _)) if !dir.is_empty() => dir.to_string(),
                _ => "/".to_string(),
            };
            self.outcome.affected_directories.insert(dir_name.clone());
            if self.info_dirs.iter().any(|d| *d == dir_name)
                && INFO_EXTS.iter().any(|ext| record.path.ends_with(ext))
            {
                self.outcome.affected_infofiles.insert(record.path.clone());
            }

            // queue the parent directory for the cleanup phase
            if let Some(parent) = live.parent() {
                let parent = parent.to_path_buf();
                if directories_cache.insert(parent.clone()) {
                    if parent.is_dir() && parent.is_symlink() {
                        directories.insert((parent, DirKind::Link));
                    } else if parent.is_dir() {
                        directories.insert((parent, DirKind::Dir));
                    }
                }
            }
        }

        // keep the ledger consistent for later diff/merge passes
        if !kept_by_collision.is_empty() {
            filter_content_file(ledger.path(), |path| !kept_by_collision.contains(path))?;
        }

        self.prune_directories(directories);
        Ok(())
    }

    /// Remove emptied directories, longest path first, looping until a
    /// pass removes nothing so emptied parents cascade.
    fn prune_directories(&self, directories: BTreeSet<(PathBuf, DirKind)>) {
        let mut candidates: Vec<(PathBuf, DirKind)> = directories.into_iter().collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        loop {
            let mut taint = false;
            for (dir, kind) in &candidates {
                let empty = match fs::read_dir(dir) {
                    Ok(mut entries) => entries.next().is_none(),
                    Err(_) => continue,
                };
                if !empty {
                    continue;
                }
                let removed = match kind {
                    DirKind::Dir => fs::remove_dir(dir),
                    DirKind::Link => fs::remove_file(dir),
                };
                if removed.is_ok() {
                    taint = true;
                }
            }
            if !taint {
                break;
            }
        }
    }
}
