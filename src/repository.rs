// src/repository.rs

//! Repository metadata interface
//!
//! The engine never talks SQL directly; everything it needs from the
//! package metadata store goes through the [`Repository`] trait. The same
//! trait serves the remote repositories (read side) and the installed
//! packages repository (read/write side). The SQLite implementation lives
//! in [`crate::db`].

use crate::content::{EntryType, SafetyRecord};
use crate::error::Result;
use std::collections::HashMap;

/// Package identifier inside one repository
pub type PackageId = i64;

/// Package scope: packages sharing key and slot replace each other
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySlot {
    pub key: String,
    pub slot: String,
}

impl KeySlot {
    pub fn new(key: &str, slot: &str) -> Self {
        Self {
            key: key.to_string(),
            slot: slot.to_string(),
        }
    }
}

/// Recorded signatures for one downloadable file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureMap {
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    /// Armored detached OpenPGP signature
    pub gpg: Option<String>,
}

/// An extra payload of a package (e.g. the split-debug file)
#[derive(Debug, Clone)]
pub struct ExtraDownload {
    pub download: String,
    /// Payload kind, "debug" for split-debug files
    pub kind: String,
    pub digest: String,
    pub signatures: SignatureMap,
}

/// One file to fetch: base package payload or an extra download
#[derive(Debug, Clone)]
pub struct DownloadDescriptor {
    pub package_id: PackageId,
    pub repository_id: String,
    /// Repository-relative remote path
    pub download: String,
    pub digest: String,
    pub signatures: SignatureMap,
}

/// Full metadata for registering a package into the installed repository
#[derive(Debug, Clone, Default)]
pub struct PackageData {
    pub atom: String,
    pub key: String,
    pub slot: String,
    pub version: String,
    pub download: String,
    pub digest: String,
    pub signatures: SignatureMap,
    pub extra_downloads: Vec<ExtraDownload>,
    pub config_protect: Vec<String>,
    pub config_protect_mask: Vec<String>,
    /// Repository the package originally came from, when the current one
    /// only shadows it
    pub original_repository: Option<String>,
}

/// Read/write metadata oracle for one repository
pub trait Repository {
    /// Repository identifier
    fn name(&self) -> &str;

    /// Whether the package id still exists (targets can vanish while an
    /// action is queued)
    fn is_package_available(&self, package_id: PackageId) -> Result<bool>;

    fn atom(&self, package_id: PackageId) -> Result<String>;
    fn version(&self, package_id: PackageId) -> Result<String>;
    fn download_url(&self, package_id: PackageId) -> Result<String>;
    fn digest(&self, package_id: PackageId) -> Result<String>;
    fn signatures(&self, package_id: PackageId) -> Result<SignatureMap>;
    fn extra_downloads(&self, package_id: PackageId) -> Result<Vec<ExtraDownload>>;
    fn key_slot(&self, package_id: PackageId) -> Result<Option<KeySlot>>;

    /// Package ids matching a key+slot scope
    fn search_key_slot(&self, key_slot: &KeySlot) -> Result<Vec<PackageId>>;

    /// Package content ordered by path; descending when `reverse` is set
    fn content(&self, package_id: PackageId, reverse: bool) -> Result<Vec<(String, EntryType)>>;

    /// Content-safety snapshots recorded for the package
    fn content_safety(&self, package_id: PackageId) -> Result<Vec<SafetyRecord>>;

    fn config_protect(&self, package_id: PackageId) -> Result<Vec<String>>;
    fn config_protect_mask(&self, package_id: PackageId) -> Result<Vec<String>>;

    /// The repository the package was originally published in, when this
    /// repository logically shadows another one
    fn original_repository(&self, package_id: PackageId) -> Result<Option<String>>;

    /// Owners of a path, for collision detection
    fn file_owners(&self, path: &str) -> Result<Vec<PackageId>>;

    /// Recorded automerge digests (path -> content hash at install time)
    fn automerge_map(&self, package_id: PackageId) -> Result<HashMap<String, String>>;

    /// Register a package and its content; returns the new package id
    fn add_package(
        &self,
        data: &PackageData,
        content: &[(String, EntryType)],
        content_safety: &[SafetyRecord],
    ) -> Result<PackageId>;

    /// Drop a package and all its recorded content
    fn remove_package(&self, package_id: PackageId) -> Result<()>;

    /// Record automerge digests for a freshly installed package
    fn record_automerge(&self, package_id: PackageId, entries: &[(String, String)]) -> Result<()>;
}
