// src/install.rs

//! Filesystem installer
//!
//! Walks an unpacked package image and merges it onto the live root. The
//! live filesystem is treated as potentially inconsistent: wrong node
//! kinds are repaired after a QA warning instead of aborting, circular
//! symlinks are handled through the literal path, and file moves tolerate
//! crossing devices. Config-protected destinations are redirected to
//! `._cfg` siblings unless the live file provably was never modified.

use crate::codes;
use crate::error::Result;
use crate::hooks::PackageHooks;
use crate::protect::{ProtectSets, handle_config_protect};
use crate::repository::{PackageId, Repository};
use crate::settings::ClientSettings;
use crate::verify::sha256_file;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Extensions of info documents tracked for the hook layer
const INFO_EXTS: [&str; 2] = [".gz", ".bz2"];

/// Directories holding info documents, from INFOPATH and INFODIR
pub fn info_directories() -> Vec<String> {
    let mut dirs: Vec<String> = std::env::var("INFOPATH")
        .unwrap_or_default()
        .split(':')
        .chain(std::env::var("INFODIR").unwrap_or_default().split(':'))
        .filter(|d| !d.is_empty())
        .map(|d| d.trim_end_matches('/').to_string())
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Move a file into place, recreating symlinks and falling back to
/// copy-and-remove when the rename crosses devices. Returns whether the
/// destination now carries the content.
pub fn move_file(src: &Path, dest: &Path) -> io::Result<bool> {
    let meta = src.symlink_metadata()?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(dest)?;
        }
        std::os::unix::fs::symlink(&target, dest)?;
        fs::remove_file(src)?;
        return Ok(true);
    }

    match fs::rename(src, dest) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(src, dest)?;
            let _ = std::os::unix::fs::chown(dest, Some(meta.uid()), Some(meta.gid()));
            fs::remove_file(src)?;
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

/// What the merge produced, handed to registration and the hook layer
#[derive(Debug, Default)]
pub struct InstallOutcome {
    /// Live paths now owned by the package (canonical directory identity)
    pub items_installed: HashSet<String>,
    /// Live paths deliberately not installed (disabled split-debug payloads)
    pub items_not_installed: HashSet<String>,
    /// Package-relative directories whose content changed
    pub affected_directories: BTreeSet<String>,
    /// Info documents among the affected files
    pub affected_infofiles: BTreeSet<String>,
    /// (package path, content hash) pairs for the automerge registry
    pub automerge_entries: Vec<(String, String)>,
}

/// One package image merge onto the live root
pub struct Installer<'a> {
    pub settings: &'a ClientSettings,
    pub hooks: &'a dyn PackageHooks,
    pub installed: &'a dyn Repository,
    pub protect: ProtectSets,
    /// Package being replaced, exempt from collision protection
    pub replaced_package_id: Option<PackageId>,
    /// Automerge digests recorded when the replaced package was installed
    pub already_protected: HashMap<String, String>,
    pub outcome: InstallOutcome,
    info_dirs: Vec<String>,
}

impl<'a> Installer<'a> {
    pub fn new(
        settings: &'a ClientSettings,
        hooks: &'a dyn PackageHooks,
        installed: &'a dyn Repository,
        protect: ProtectSets,
        replaced_package_id: Option<PackageId>,
        already_protected: HashMap<String, String>,
    ) -> Self {
        Self {
            settings,
            hooks,
            installed,
            protect,
            replaced_package_id,
            already_protected,
            outcome: InstallOutcome::default(),
            info_dirs: info_directories(),
        }
    }

    /// Merge the unpacked image onto the live root. Returns a step code:
    /// 0 on success, 1 on an unrecoverable node-kind conflict, 4 on a
    /// failed file move or permission setup.
    pub fn merge_image(&mut self, image_dir: &Path) -> Result<i32> {
        self.walk(image_dir, image_dir)
    }

    fn walk(&mut self, image_dir: &Path, current: &Path) -> Result<i32> {
        let mut subdirs: Vec<PathBuf> = Vec::new();
        let mut recurse: Vec<PathBuf> = Vec::new();
        let mut files: Vec<PathBuf> = Vec::new();

        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                subdirs.push(path.clone());
                recurse.push(path);
            } else if file_type.is_symlink() && path.is_dir() {
                // directory symlinks are treated as directories but the
                // walk does not follow them
                subdirs.push(path);
            } else {
                files.push(path);
            }
        }
        subdirs.sort();
        files.sort();
        recurse.sort();

        for subdir in &subdirs {
            let st = self.merge_subdir(image_dir, subdir)?;
            if st != 0 {
                return Ok(st);
            }
        }
        for file in &files {
            let st = self.merge_file(image_dir, file)?;
            if st != 0 {
                return Ok(st);
            }
        }
        for subdir in &recurse {
            let st = self.walk(image_dir, subdir)?;
            if st != 0 {
                return Ok(st);
            }
        }
        Ok(0)
    }

    /// Package-relative absolute path of an image entry
    fn package_path(image_dir: &Path, entry: &Path) -> String {
        let rel = entry.strip_prefix(image_dir).unwrap_or(entry);
        format!("/{}", rel.to_string_lossy())
    }

    fn splitdebug_excluded(&self, package_path: &str) -> bool {
        !self.settings.splitdebug
            && self
                .settings
                .splitdebug_dirs
                .iter()
                .any(|d| package_path.starts_with(d.as_str()))
    }

    /// Canonical identity a live path is recorded under: resolved parent
    /// directory plus base name
    pub(crate) fn installed_identity(path: &Path) -> String {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        let parent = fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
        let base = path.file_name().unwrap_or_default();
        parent.join(base).to_string_lossy().into_owned()
    }

    fn merge_subdir(&mut self, image_dir: &Path, imagepath_dir: &Path) -> Result<i32> {
        let package_path = Self::package_path(image_dir, imagepath_dir);
        let rootdir = self.settings.live_path(&package_path);

        if self.splitdebug_excluded(&package_path) {
            self.outcome
                .items_not_installed
                .insert(rootdir.to_string_lossy().into_owned());
            return Ok(0);
        }

        // broken symlink on the live system
        if rootdir.is_symlink() && !rootdir.exists() {
            fs::remove_file(&rootdir)?;
        } else if rootdir.is_file() {
            // a file where a directory belongs: move it aside and go on
            warn!(
                "QA: {} is a file when it should be a directory",
                rootdir.display()
            );
            let parent = rootdir.parent().unwrap_or_else(|| Path::new("/"));
            let name = rootdir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (_, aside) = tempfile::Builder::new()
                .prefix(&name)
                .tempfile_in(parent)?
                .keep()
                .map_err(|e| crate::error::Error::Io(e.error))?;
            fs::rename(&rootdir, &aside)?;
            warn!("file moved: {} -> {}", rootdir.display(), aside.display());
        }

        if imagepath_dir.is_symlink() {
            if !rootdir.is_symlink() && rootdir.is_dir() {
                // the live system has a real directory here; leave it be
                warn!(
                    "QA: symlink expected, directory found: {}",
                    rootdir.display()
                );
                return Ok(0);
            }

            let tolink = fs::read_link(imagepath_dir)?;
            let live_tolink = fs::read_link(&rootdir).ok();
            if live_tolink.as_deref() != Some(tolink.as_path()) {
                let mut sym_failed = false;
                if rootdir.symlink_metadata().is_ok() {
                    if let Err(err) = fs::remove_file(&rootdir) {
                        sym_failed = true;
                        warn!("cannot remove {}: {}", rootdir.display(), err);
                    }
                }
                if !sym_failed {
                    std::os::unix::fs::symlink(&tolink, &rootdir)?;
                }
            }
        } else if !rootdir.is_dir() {
            if let Err(err) = fs::create_dir(&rootdir) {
                match err.kind() {
                    io::ErrorKind::AlreadyExists => {}
                    io::ErrorKind::NotFound => {
                        // missing parents; create the whole tree, tolerant
                        // of a concurrent creation
                        if let Err(err2) = fs::create_dir_all(&rootdir) {
                            if err2.kind() != io::ErrorKind::AlreadyExists {
                                return Err(err2.into());
                            }
                        }
                    }
                    _ => return Err(err.into()),
                }
            }
        }

        if !rootdir.is_symlink() {
            let meta = fs::metadata(imagepath_dir)?;
            let applied = std::os::unix::fs::chown(&rootdir, Some(meta.uid()), Some(meta.gid()))
                .and_then(|()| fs::set_permissions(&rootdir, meta.permissions()));
            if let Err(err) = applied {
                match err.kind() {
                    io::ErrorKind::PermissionDenied
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::NotADirectory => {
                        // unwritable destination, keep going
                    }
                    _ => {
                        warn!(
                            "error during workdir setup {}: {}",
                            rootdir.display(),
                            err
                        );
                        return Ok(codes::MOVE_FAILED);
                    }
                }
            }
        }

        self.outcome
            .items_installed
            .insert(Self::installed_identity(&rootdir));
        Ok(0)
    }

    fn merge_file(&mut self, image_dir: &Path, fromfile: &Path) -> Result<i32> {
        let package_path = Self::package_path(image_dir, fromfile);
        let live = self.settings.live_path(&package_path);

        let package_dir = match package_path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => "/".to_string(),
        };
        self.outcome
            .affected_directories
            .insert(package_dir.clone());
        if self.info_dirs.iter().any(|d| *d == package_dir)
            && INFO_EXTS.iter().any(|ext| package_path.ends_with(ext))
        {
            self.outcome
                .affected_infofiles
                .insert(package_path.clone());
        }

        if self.splitdebug_excluded(&package_path) {
            self.outcome
                .items_not_installed
                .insert(live.to_string_lossy().into_owned());
            return Ok(0);
        }

        if self.settings.collision_protect > 1 {
            let owners = self
                .installed
                .file_owners(&package_path)
                .unwrap_or_default();
            let other_owner = !owners.is_empty()
                && !self
                    .replaced_package_id
                    .map(|id| owners.contains(&id))
                    .unwrap_or(false);
            if other_owner {
                warn!(
                    "QA: collision found during install for {} - cannot overwrite",
                    live.display()
                );
                return Ok(0);
            }
        }

        let outcome = handle_config_protect(
            &self.protect,
            self.hooks,
            Some(fromfile),
            &live,
            true,
            false,
        )?;
        let mut skip = outcome.skip;
        let mut final_dest = outcome.dest;

        // collect the automerge digest of the incoming config file
        if outcome.in_mask && fromfile.exists() {
            match sha256_file(fromfile) {
                Ok(digest) => self
                    .outcome
                    .automerge_entries
                    .push((package_path.clone(), digest)),
                Err(err) => warn!("failed to hash {}: {}", fromfile.display(), err),
            }
        }

        if outcome.protected {
            if let Some(recorded) = self.already_protected.get(&package_path) {
                let live_digest = sha256_file(&live).unwrap_or_else(|_| "?".to_string());
                if *recorded == live_digest {
                    // the user never touched it; merge straight over
                    info!(
                        "automerging config file, never modified: {}",
                        live.display()
                    );
                    skip = false;
                    final_dest = live.clone();
                }
            }
        }

        if skip {
            return Ok(0);
        }

        let literal_real = |path: &Path| match fs::canonicalize(path) {
            Ok(real) => real,
            Err(err) => {
                // io::ErrorKind::FilesystemLoop is still unstable (io_error_more);
                // match the underlying ELOOP (40 on Linux) raw OS error instead.
                if err.raw_os_error() == Some(40) {
                    warn!("QA: circular symlink issue: {}", path.display());
                }
                path.to_path_buf()
            }
        };
        let from_real = literal_real(fromfile);
        let to_real = literal_real(&final_dest);
        if from_real == to_real && final_dest.is_symlink() {
            // the destination aliases the source; drop it before the move
            if let Err(err) = fs::remove_file(&final_dest) {
                warn!(
                    "failed to cope with oddity of {}: {}",
                    final_dest.display(),
                    err
                );
            }
        }

        if final_dest.is_dir() && !final_dest.is_symlink() {
            warn!(
                "fatal: file expected, directory found: {}",
                final_dest.display()
            );
            return Ok(codes::FAILED);
        }

        match move_file(fromfile, &final_dest) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "QA: file move error: {} => {}",
                    fromfile.display(),
                    final_dest.display()
                );
                return Ok(codes::MOVE_FAILED);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                // broken packages happen; keep moving forward
                warn!(
                    "error during file move to system, ignored: {} => {}: {}",
                    fromfile.display(),
                    final_dest.display(),
                    err
                );
            }
            Err(err) => {
                warn!(
                    "QA: file move error: {} => {}: {}",
                    fromfile.display(),
                    final_dest.display(),
                    err
                );
                return Ok(codes::MOVE_FAILED);
            }
        }

        self.outcome
            .items_installed
            .insert(Self::installed_identity(&final_dest));
        Ok(0)
    }
}
