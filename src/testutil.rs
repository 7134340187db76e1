// src/testutil.rs

//! Configurable in-memory metadata oracle for unit tests

use crate::content::{EntryType, SafetyRecord};
use crate::error::{Error, Result};
use crate::repository::{
    ExtraDownload, KeySlot, PackageData, PackageId, Repository, SignatureMap,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Metadata held for one stub package
#[derive(Debug, Clone, Default)]
pub struct StubPackage {
    pub atom: String,
    pub version: String,
    pub download: String,
    pub digest: String,
    pub signatures: SignatureMap,
    pub extra_downloads: Vec<ExtraDownload>,
    pub key_slot: Option<KeySlot>,
    pub content: Vec<(String, EntryType)>,
    pub content_safety: Vec<SafetyRecord>,
    pub config_protect: Vec<String>,
    pub config_protect_mask: Vec<String>,
    pub original_repository: Option<String>,
    pub automerge: HashMap<String, String>,
}

/// Repository stub backed by plain maps
#[derive(Debug, Default)]
pub struct StubRepo {
    pub repo_name: String,
    inner: Mutex<HashMap<PackageId, StubPackage>>,
}

impl StubRepo {
    pub fn new(name: &str) -> Self {
        Self {
            repo_name: name.to_string(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, package_id: PackageId, package: StubPackage) {
        self.inner.lock().unwrap().insert(package_id, package);
    }

    fn with<T>(&self, package_id: PackageId, f: impl FnOnce(&StubPackage) -> T) -> Result<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&package_id)
            .map(f)
            .ok_or_else(|| Error::NotFoundError(format!("package {}", package_id)))
    }
}

impl Repository for StubRepo {
    fn name(&self) -> &str {
        &self.repo_name
    }

    fn is_package_available(&self, package_id: PackageId) -> Result<bool> {
        Ok(self.inner.lock().unwrap().contains_key(&package_id))
    }

    fn atom(&self, package_id: PackageId) -> Result<String> {
        self.with(package_id, |p| p.atom.clone())
    }

    fn version(&self, package_id: PackageId) -> Result<String> {
        self.with(package_id, |p| p.version.clone())
    }

    fn download_url(&self, package_id: PackageId) -> Result<String> {
        self.with(package_id, |p| p.download.clone())
    }

    fn digest(&self, package_id: PackageId) -> Result<String> {
        self.with(package_id, |p| p.digest.clone())
    }

    fn signatures(&self, package_id: PackageId) -> Result<SignatureMap> {
        self.with(package_id, |p| p.signatures.clone())
    }

    fn extra_downloads(&self, package_id: PackageId) -> Result<Vec<ExtraDownload>> {
        self.with(package_id, |p| p.extra_downloads.clone())
    }

    fn key_slot(&self, package_id: PackageId) -> Result<Option<KeySlot>> {
        self.with(package_id, |p| p.key_slot.clone())
    }

    fn search_key_slot(&self, key_slot: &KeySlot) -> Result<Vec<PackageId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .iter()
            .filter(|(_, p)| p.key_slot.as_ref() == Some(key_slot))
            .map(|(id, _)| *id)
            .collect())
    }

    fn content(&self, package_id: PackageId, reverse: bool) -> Result<Vec<(String, EntryType)>> {
        self.with(package_id, |p| {
            let mut content = p.content.clone();
            content.sort_by(|a, b| a.0.cmp(&b.0));
            if reverse {
                content.reverse();
            }
            content
        })
    }

    fn content_safety(&self, package_id: PackageId) -> Result<Vec<SafetyRecord>> {
        self.with(package_id, |p| p.content_safety.clone())
    }

    fn config_protect(&self, package_id: PackageId) -> Result<Vec<String>> {
        self.with(package_id, |p| p.config_protect.clone())
    }

    fn config_protect_mask(&self, package_id: PackageId) -> Result<Vec<String>> {
        self.with(package_id, |p| p.config_protect_mask.clone())
    }

    fn original_repository(&self, package_id: PackageId) -> Result<Option<String>> {
        self.with(package_id, |p| p.original_repository.clone())
    }

    fn file_owners(&self, path: &str) -> Result<Vec<PackageId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .iter()
            .filter(|(_, p)| p.content.iter().any(|(c, _)| c == path))
            .map(|(id, _)| *id)
            .collect())
    }

    fn automerge_map(&self, package_id: PackageId) -> Result<HashMap<String, String>> {
        self.with(package_id, |p| p.automerge.clone())
    }

    fn add_package(
        &self,
        data: &PackageData,
        content: &[(String, EntryType)],
        content_safety: &[SafetyRecord],
    ) -> Result<PackageId> {
        let mut inner = self.inner.lock().unwrap();
        let key_slot = KeySlot::new(&data.key, &data.slot);
        inner.retain(|_, p| p.key_slot.as_ref() != Some(&key_slot));
        let package_id = inner.keys().max().copied().unwrap_or(0) + 1;
        inner.insert(
            package_id,
            StubPackage {
                atom: data.atom.clone(),
                version: data.version.clone(),
                download: data.download.clone(),
                digest: data.digest.clone(),
                signatures: data.signatures.clone(),
                extra_downloads: data.extra_downloads.clone(),
                key_slot: Some(key_slot),
                content: content.to_vec(),
                content_safety: content_safety.to_vec(),
                config_protect: data.config_protect.clone(),
                config_protect_mask: data.config_protect_mask.clone(),
                original_repository: data.original_repository.clone(),
                automerge: HashMap::new(),
            },
        );
        Ok(package_id)
    }

    fn remove_package(&self, package_id: PackageId) -> Result<()> {
        self.inner.lock().unwrap().remove(&package_id);
        Ok(())
    }

    fn record_automerge(&self, package_id: PackageId, entries: &[(String, String)]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.get_mut(&package_id) {
            p.automerge.extend(entries.iter().cloned());
        }
        Ok(())
    }
}
