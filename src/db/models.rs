// src/db/models.rs

//! Data models for the package metadata tables
//!
//! Rust structs corresponding to database rows, with methods for the
//! queries the transaction engine issues through the repository trait.

use crate::content::{EntryType, SafetyRecord};
use crate::error::Result;
use crate::repository::{ExtraDownload, SignatureMap};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// A package row in the metadata store
#[derive(Debug, Clone)]
pub struct PackageRow {
    pub id: Option<i64>,
    pub atom: String,
    pub key: String,
    pub slot: String,
    pub version: String,
    pub download: String,
    pub digest: String,
    pub signatures: SignatureMap,
    pub config_protect: String,
    pub config_protect_mask: String,
    pub original_repository: Option<String>,
    pub install_date: Option<String>,
}

impl PackageRow {
    pub fn new(atom: String, key: String, slot: String, version: String) -> Self {
        Self {
            id: None,
            atom,
            key,
            slot,
            version,
            download: String::new(),
            digest: String::new(),
            signatures: SignatureMap::default(),
            config_protect: String::new(),
            config_protect_mask: String::new(),
            original_repository: None,
            install_date: None,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (atom, key, slot, version, download, digest,
                sig_sha256, sig_sha512, sig_gpg,
                config_protect, config_protect_mask, original_repository, install_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &self.atom,
                &self.key,
                &self.slot,
                &self.version,
                &self.download,
                &self.digest,
                &self.signatures.sha256,
                &self.signatures.sha512,
                &self.signatures.gpg,
                &self.config_protect,
                &self.config_protect_mask,
                &self.original_repository,
                &self.install_date,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, atom, key, slot, version, download, digest,
                    sig_sha256, sig_sha512, sig_gpg,
                    config_protect, config_protect_mask, original_repository, install_date
             FROM packages WHERE id = ?1",
        )?;
        let row = stmt.query_row([id], Self::from_row).optional()?;
        Ok(row)
    }

    /// Find all packages sharing a key and slot
    pub fn find_by_key_slot(conn: &Connection, key: &str, slot: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, atom, key, slot, version, download, digest,
                    sig_sha256, sig_sha512, sig_gpg,
                    config_protect, config_protect_mask, original_repository, install_date
             FROM packages WHERE key = ?1 AND slot = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([key, slot], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a package by ID; content rows cascade
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE id = ?1", [id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            atom: row.get(1)?,
            key: row.get(2)?,
            slot: row.get(3)?,
            version: row.get(4)?,
            download: row.get(5)?,
            digest: row.get(6)?,
            signatures: SignatureMap {
                sha256: row.get(7)?,
                sha512: row.get(8)?,
                gpg: row.get(9)?,
            },
            config_protect: row.get(10)?,
            config_protect_mask: row.get(11)?,
            original_repository: row.get(12)?,
            install_date: row.get(13)?,
        })
    }
}

fn parse_ftype(raw: String) -> rusqlite::Result<EntryType> {
    raw.parse::<EntryType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// Insert the content rows of a package
pub fn insert_content(
    conn: &Connection,
    package_id: i64,
    content: &[(String, EntryType)],
) -> Result<()> {
    let mut stmt =
        conn.prepare("INSERT INTO content (package_id, path, ftype) VALUES (?1, ?2, ?3)")?;
    for (path, ftype) in content {
        stmt.execute(params![package_id, path, ftype.as_str()])?;
    }
    Ok(())
}

/// Content of a package ordered by path, descending when `reverse`
pub fn content_for(
    conn: &Connection,
    package_id: i64,
    reverse: bool,
) -> Result<Vec<(String, EntryType)>> {
    let sql = if reverse {
        "SELECT path, ftype FROM content WHERE package_id = ?1 ORDER BY path DESC"
    } else {
        "SELECT path, ftype FROM content WHERE package_id = ?1 ORDER BY path ASC"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([package_id], |row| {
            let path: String = row.get(0)?;
            let ftype = parse_ftype(row.get(1)?)?;
            Ok((path, ftype))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Package ids owning a path
pub fn file_owners(conn: &Connection, path: &str) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT package_id FROM content WHERE path = ?1 ORDER BY package_id")?;
    let rows = stmt
        .query_map([path], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert content-safety snapshots of a package
pub fn insert_content_safety(
    conn: &Connection,
    package_id: i64,
    records: &[SafetyRecord],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO content_safety (package_id, path, sha256, mtime) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for record in records {
        stmt.execute(params![package_id, record.path, record.sha256, record.mtime])?;
    }
    Ok(())
}

/// Content-safety snapshots of a package, ordered by path
pub fn content_safety_for(conn: &Connection, package_id: i64) -> Result<Vec<SafetyRecord>> {
    let mut stmt = conn.prepare(
        "SELECT path, sha256, mtime FROM content_safety WHERE package_id = ?1 ORDER BY path",
    )?;
    let rows = stmt
        .query_map([package_id], |row| {
            Ok(SafetyRecord {
                path: row.get(0)?,
                sha256: row.get(1)?,
                mtime: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Replace the automerge rows of a package
pub fn insert_automerge(
    conn: &Connection,
    package_id: i64,
    entries: &[(String, String)],
) -> Result<()> {
    let mut stmt =
        conn.prepare("INSERT INTO automerge (package_id, path, digest) VALUES (?1, ?2, ?3)")?;
    for (path, digest) in entries {
        stmt.execute(params![package_id, path, digest])?;
    }
    Ok(())
}

/// Automerge digests of a package keyed by path
pub fn automerge_for(
    conn: &Connection,
    package_id: i64,
) -> Result<std::collections::HashMap<String, String>> {
    let mut stmt =
        conn.prepare("SELECT path, digest FROM automerge WHERE package_id = ?1")?;
    let rows = stmt
        .query_map([package_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<std::collections::HashMap<String, String>, _>>()?;
    Ok(rows)
}

/// Insert the extra download rows of a package
pub fn insert_extra_downloads(
    conn: &Connection,
    package_id: i64,
    extras: &[ExtraDownload],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO extra_downloads
            (package_id, download, kind, digest, sig_sha256, sig_sha512, sig_gpg)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for extra in extras {
        stmt.execute(params![
            package_id,
            extra.download,
            extra.kind,
            extra.digest,
            extra.signatures.sha256,
            extra.signatures.sha512,
            extra.signatures.gpg,
        ])?;
    }
    Ok(())
}

/// Extra downloads recorded for a package
pub fn extra_downloads_for(conn: &Connection, package_id: i64) -> Result<Vec<ExtraDownload>> {
    let mut stmt = conn.prepare(
        "SELECT download, kind, digest, sig_sha256, sig_sha512, sig_gpg
         FROM extra_downloads WHERE package_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([package_id], |row| {
            Ok(ExtraDownload {
                download: row.get(0)?,
                kind: row.get(1)?,
                digest: row.get(2)?,
                signatures: SignatureMap {
                    sha256: row.get(3)?,
                    sha512: row.get(4)?,
                    gpg: row.get(5)?,
                },
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn sample_package(conn: &Connection) -> i64 {
        let mut row = PackageRow::new(
            "app-misc/sample-1.0".to_string(),
            "app-misc/sample".to_string(),
            "0".to_string(),
            "1.0.0".to_string(),
        );
        row.download = "amd64/sample-1.0.tar.xz".to_string();
        row.digest = "ab12".to_string();
        row.insert(conn).unwrap()
    }

    #[test]
    fn test_package_round_trip() {
        let conn = test_db();
        let id = sample_package(&conn);

        let found = PackageRow::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.atom, "app-misc/sample-1.0");
        assert_eq!(found.key, "app-misc/sample");
        assert_eq!(found.digest, "ab12");
        assert!(found.signatures.gpg.is_none());
    }

    #[test]
    fn test_find_by_key_slot() {
        let conn = test_db();
        sample_package(&conn);
        sample_package(&conn);

        let rows = PackageRow::find_by_key_slot(&conn, "app-misc/sample", "0").unwrap();
        assert_eq!(rows.len(), 2);
        let rows = PackageRow::find_by_key_slot(&conn, "app-misc/sample", "2").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_content_ordering_and_owners() {
        let conn = test_db();
        let id = sample_package(&conn);
        insert_content(
            &conn,
            id,
            &[
                ("/usr/bin/sample".to_string(), EntryType::Obj),
                ("/usr/bin".to_string(), EntryType::Dir),
                ("/usr/share/doc/sample".to_string(), EntryType::Dir),
            ],
        )
        .unwrap();

        let forward = content_for(&conn, id, false).unwrap();
        assert_eq!(forward[0].0, "/usr/bin");
        let reverse = content_for(&conn, id, true).unwrap();
        assert_eq!(reverse[0].0, "/usr/share/doc/sample");

        assert_eq!(file_owners(&conn, "/usr/bin/sample").unwrap(), vec![id]);
        assert!(file_owners(&conn, "/nonexistent").unwrap().is_empty());
    }

    #[test]
    fn test_safety_and_automerge_round_trip() {
        let conn = test_db();
        let id = sample_package(&conn);

        insert_content_safety(
            &conn,
            id,
            &[SafetyRecord {
                path: "/etc/sample.conf".to_string(),
                sha256: "cd34".to_string(),
                mtime: 1700000000.5,
            }],
        )
        .unwrap();
        let safety = content_safety_for(&conn, id).unwrap();
        assert_eq!(safety.len(), 1);
        assert!((safety[0].mtime - 1700000000.5).abs() < 1e-9);

        insert_automerge(
            &conn,
            id,
            &[("/etc/sample.conf".to_string(), "cd34".to_string())],
        )
        .unwrap();
        let automerge = automerge_for(&conn, id).unwrap();
        assert_eq!(automerge.get("/etc/sample.conf").unwrap(), "cd34");
    }
}
