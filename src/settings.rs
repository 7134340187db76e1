// src/settings.rs

//! Client settings
//!
//! Runtime configuration for the transaction engine: mirror lists per
//! repository, config-protection paths, enabled hash families, delta
//! support and the on-disk locations the engine works with. Loaded from a
//! JSON file; every field has a usable default so tests can build a
//! settings value directly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Mirror list for one repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryMirrors {
    /// Ranked package mirror URIs, best first
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// Engine-wide client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Repositories currently enabled, keyed by repository id
    pub available: HashMap<String, RepositoryMirrors>,
    /// Repositories disabled but still usable as a mirror source for
    /// packages that were installed from them
    pub excluded: HashMap<String, RepositoryMirrors>,

    /// Differential-download support
    pub delta_support: bool,
    /// Collision protection level: 0 off, 1 on removal, 2 also on install
    pub collision_protect: u8,
    /// Signature families verified when present (any of "sha256",
    /// "sha512", "gpg")
    pub package_hashes: Vec<String>,

    /// Config-protected path prefixes
    pub config_protect: Vec<String>,
    /// Mask prefixes overriding protection within a protected prefix
    pub config_protect_mask: Vec<String>,
    /// Paths whose protection is unconditionally suppressed
    pub config_protect_skip: Vec<String>,

    /// Split-debug payload installation
    pub splitdebug: bool,
    /// Directories holding split-debug files
    pub splitdebug_dirs: Vec<String>,

    /// Download store for package archives
    pub packages_dir: PathBuf,
    /// Scratch area for unpack images and temporary ledgers
    pub unpack_dir: PathBuf,
    /// Live filesystem root the transaction mutates
    pub system_root: PathBuf,
    /// Directory holding per-repository armored public keys
    pub keystore_dir: PathBuf,
    /// Exclusive resource lock file
    pub lock_path: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            available: HashMap::new(),
            excluded: HashMap::new(),
            delta_support: true,
            collision_protect: 1,
            package_hashes: vec![
                "sha256".to_string(),
                "sha512".to_string(),
                "gpg".to_string(),
            ],
            config_protect: vec!["/etc".to_string()],
            config_protect_mask: vec![],
            config_protect_skip: vec![],
            splitdebug: false,
            splitdebug_dirs: vec!["/usr/lib/debug".to_string()],
            packages_dir: PathBuf::from("/var/lib/galena/packages"),
            unpack_dir: PathBuf::from("/var/tmp/galena"),
            system_root: PathBuf::from("/"),
            keystore_dir: PathBuf::from("/var/lib/galena/keys"),
            lock_path: PathBuf::from("/var/lib/galena/.galena_resources.lock"),
        }
    }
}

impl ClientSettings {
    /// Load settings from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let settings = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::ParseError(format!("invalid settings file: {}", e)))?;
        Ok(settings)
    }

    /// Standard on-disk path for a remote package file
    pub fn fetch_disk_path(&self, download: &str) -> PathBuf {
        self.packages_dir.join(download.trim_start_matches('/'))
    }

    /// Whether a signature family is enabled for verification
    pub fn hash_enabled(&self, family: &str) -> bool {
        self.package_hashes.iter().any(|h| h == family)
    }

    /// Map an absolute package path onto the live root
    pub fn live_path(&self, path: &str) -> PathBuf {
        self.system_root.join(path.trim_start_matches('/'))
    }
}
