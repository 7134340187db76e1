// src/db/mod.rs

//! SQLite-backed package metadata store
//!
//! Default implementation of the [`Repository`] trait. One database holds
//! one repository: the installed-packages store and every remote
//! repository cache use the same schema.

pub mod models;
pub mod schema;

use crate::content::{EntryType, SafetyRecord};
use crate::error::{Error, Result};
use crate::repository::{
    ExtraDownload, KeySlot, PackageData, PackageId, Repository, SignatureMap,
};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Initialize a new metadata database at the specified path.
///
/// Creates the database file and sets up the schema. This is idempotent -
/// calling it on an existing database is safe.
pub fn init(db_path: &str) -> Result<()> {
    debug!("Initializing database at: {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    schema::migrate(&conn)?;

    info!("Database initialized successfully");
    Ok(())
}

/// Open an existing metadata database
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        return Err(Error::DatabaseNotFound(db_path.to_string()));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    Ok(conn)
}

/// SQLite-backed repository
pub struct SqliteRepository {
    name: String,
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Create (or open) the database at `db_path` and wrap it
    pub fn create(name: &str, db_path: &str) -> Result<Self> {
        init(db_path)?;
        let conn = open(db_path)?;
        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing database
    pub fn open_at(name: &str, db_path: &str) -> Result<Self> {
        let conn = open(db_path)?;
        schema::migrate(&conn)?;
        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// In-memory repository, mainly for tests
    pub fn in_memory(name: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        schema::migrate(&conn)?;
        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Register a package directly, for repository population
    pub fn register(
        &self,
        data: &PackageData,
        content: &[(String, EntryType)],
        content_safety: &[SafetyRecord],
    ) -> Result<PackageId> {
        self.add_package(data, content, content_safety)
    }

    fn package(&self, package_id: PackageId) -> Result<models::PackageRow> {
        let conn = self.conn.lock().unwrap();
        models::PackageRow::find_by_id(&conn, package_id)?
            .ok_or_else(|| Error::NotFoundError(format!("package {}", package_id)))
    }
}

fn split_paths(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

impl Repository for SqliteRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_package_available(&self, package_id: PackageId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Ok(models::PackageRow::find_by_id(&conn, package_id)?.is_some())
    }

    fn atom(&self, package_id: PackageId) -> Result<String> {
        Ok(self.package(package_id)?.atom)
    }

    fn version(&self, package_id: PackageId) -> Result<String> {
        Ok(self.package(package_id)?.version)
    }

    fn download_url(&self, package_id: PackageId) -> Result<String> {
        Ok(self.package(package_id)?.download)
    }

    fn digest(&self, package_id: PackageId) -> Result<String> {
        Ok(self.package(package_id)?.digest)
    }

    fn signatures(&self, package_id: PackageId) -> Result<SignatureMap> {
        Ok(self.package(package_id)?.signatures)
    }

    fn extra_downloads(&self, package_id: PackageId) -> Result<Vec<ExtraDownload>> {
        let conn = self.conn.lock().unwrap();
        models::extra_downloads_for(&conn, package_id)
    }

    fn key_slot(&self, package_id: PackageId) -> Result<Option<KeySlot>> {
        let row = self.package(package_id)?;
        Ok(Some(KeySlot::new(&row.key, &row.slot)))
    }

    fn search_key_slot(&self, key_slot: &KeySlot) -> Result<Vec<PackageId>> {
        let conn = self.conn.lock().unwrap();
        let rows = models::PackageRow::find_by_key_slot(&conn, &key_slot.key, &key_slot.slot)?;
        Ok(rows.into_iter().filter_map(|r| r.id).collect())
    }

    fn content(&self, package_id: PackageId, reverse: bool) -> Result<Vec<(String, EntryType)>> {
        let conn = self.conn.lock().unwrap();
        models::content_for(&conn, package_id, reverse)
    }

    fn content_safety(&self, package_id: PackageId) -> Result<Vec<SafetyRecord>> {
        let conn = self.conn.lock().unwrap();
        models::content_safety_for(&conn, package_id)
    }

    fn config_protect(&self, package_id: PackageId) -> Result<Vec<String>> {
        Ok(split_paths(&self.package(package_id)?.config_protect))
    }

    fn config_protect_mask(&self, package_id: PackageId) -> Result<Vec<String>> {
        Ok(split_paths(&self.package(package_id)?.config_protect_mask))
    }

    fn original_repository(&self, package_id: PackageId) -> Result<Option<String>> {
        Ok(self.package(package_id)?.original_repository)
    }

    fn file_owners(&self, path: &str) -> Result<Vec<PackageId>> {
        let conn = self.conn.lock().unwrap();
        models::file_owners(&conn, path)
    }

    fn automerge_map(&self, package_id: PackageId) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        models::automerge_for(&conn, package_id)
    }

    fn add_package(
        &self,
        data: &PackageData,
        content: &[(String, EntryType)],
        content_safety: &[SafetyRecord],
    ) -> Result<PackageId> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // one package per key+slot scope: replace any previous entry
        let previous = models::PackageRow::find_by_key_slot(&tx, &data.key, &data.slot)?;
        for row in previous {
            if let Some(id) = row.id {
                models::PackageRow::delete(&tx, id)?;
            }
        }

        let mut row = models::PackageRow::new(
            data.atom.clone(),
            data.key.clone(),
            data.slot.clone(),
            data.version.clone(),
        );
        row.download = data.download.clone();
        row.digest = data.digest.clone();
        row.signatures = data.signatures.clone();
        row.config_protect = data.config_protect.join(" ");
        row.config_protect_mask = data.config_protect_mask.join(" ");
        row.original_repository = data.original_repository.clone();
        row.install_date = Some(chrono::Utc::now().to_rfc3339());

        let id = row.insert(&tx)?;
        models::insert_content(&tx, id, content)?;
        models::insert_content_safety(&tx, id, content_safety)?;
        models::insert_extra_downloads(&tx, id, &data.extra_downloads)?;

        tx.commit()?;
        Ok(id)
    }

    fn remove_package(&self, package_id: PackageId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        models::PackageRow::delete(&conn, package_id)
    }

    fn record_automerge(&self, package_id: PackageId, entries: &[(String, String)]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        models::insert_automerge(&conn, package_id, entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_data(atom: &str, version: &str) -> PackageData {
        PackageData {
            atom: atom.to_string(),
            key: "app-misc/sample".to_string(),
            slot: "0".to_string(),
            version: version.to_string(),
            download: format!("amd64/sample-{}.tar.xz", version),
            digest: "ab12".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        init(&db_path).unwrap();
        assert!(Path::new(&db_path).exists());

        let conn = open(&db_path).unwrap();
        let result: i32 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(result, 1);
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open("/nonexistent/path/galena.db");
        assert!(matches!(result, Err(Error::DatabaseNotFound(_))));
    }

    #[test]
    fn test_add_and_query_package() {
        let repo = SqliteRepository::in_memory("main").unwrap();
        let id = repo
            .add_package(
                &sample_data("app-misc/sample-1.0", "1.0.0"),
                &[
                    ("/usr/bin/sample".to_string(), EntryType::Obj),
                    ("/usr/bin".to_string(), EntryType::Dir),
                ],
                &[],
            )
            .unwrap();

        assert!(repo.is_package_available(id).unwrap());
        assert_eq!(repo.atom(id).unwrap(), "app-misc/sample-1.0");
        assert_eq!(
            repo.key_slot(id).unwrap().unwrap(),
            KeySlot::new("app-misc/sample", "0")
        );
        assert_eq!(repo.content(id, false).unwrap().len(), 2);
        assert_eq!(repo.file_owners("/usr/bin/sample").unwrap(), vec![id]);
    }

    #[test]
    fn test_add_package_replaces_same_scope() {
        let repo = SqliteRepository::in_memory("__system__").unwrap();
        let old = repo
            .add_package(&sample_data("app-misc/sample-1.0", "1.0.0"), &[], &[])
            .unwrap();
        let new = repo
            .add_package(&sample_data("app-misc/sample-2.0", "2.0.0"), &[], &[])
            .unwrap();

        assert!(!repo.is_package_available(old).unwrap());
        assert!(repo.is_package_available(new).unwrap());
        let matches = repo
            .search_key_slot(&KeySlot::new("app-misc/sample", "0"))
            .unwrap();
        assert_eq!(matches, vec![new]);
    }

    #[test]
    fn test_remove_package_drops_content() {
        let repo = SqliteRepository::in_memory("__system__").unwrap();
        let id = repo
            .add_package(
                &sample_data("app-misc/sample-1.0", "1.0.0"),
                &[("/usr/bin/sample".to_string(), EntryType::Obj)],
                &[],
            )
            .unwrap();

        repo.remove_package(id).unwrap();
        assert!(!repo.is_package_available(id).unwrap());
        assert!(repo.file_owners("/usr/bin/sample").unwrap().is_empty());
    }

    #[test]
    fn test_automerge_round_trip() {
        let repo = SqliteRepository::in_memory("__system__").unwrap();
        let id = repo
            .add_package(&sample_data("app-misc/sample-1.0", "1.0.0"), &[], &[])
            .unwrap();
        repo.record_automerge(id, &[("/etc/sample.conf".to_string(), "cd34".to_string())])
            .unwrap();

        let map = repo.automerge_map(id).unwrap();
        assert_eq!(map.get("/etc/sample.conf").unwrap(), "cd34");
    }
}
