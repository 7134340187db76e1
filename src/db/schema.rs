// src/db/schema.rs

//! Database schema definitions and migrations
//!
//! SQLite schema for the package metadata store and a small migration
//! system to evolve it over time.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates the metadata tables the transaction engine queries:
/// - packages: per-package scope, download and signature metadata
/// - extra_downloads: additional payloads (split-debug files)
/// - content: the package file list, ordered by path at query time
/// - content_safety: last-known-good snapshots of protected files
/// - automerge: config-file digests recorded at install time
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            atom TEXT NOT NULL,
            key TEXT NOT NULL,
            slot TEXT NOT NULL DEFAULT '0',
            version TEXT NOT NULL,
            download TEXT NOT NULL,
            digest TEXT NOT NULL,
            sig_sha256 TEXT,
            sig_sha512 TEXT,
            sig_gpg TEXT,
            config_protect TEXT NOT NULL DEFAULT '',
            config_protect_mask TEXT NOT NULL DEFAULT '',
            original_repository TEXT,
            install_date TEXT
        );
        CREATE INDEX idx_packages_key_slot ON packages(key, slot);

        CREATE TABLE extra_downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
            download TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'data',
            digest TEXT NOT NULL,
            sig_sha256 TEXT,
            sig_sha512 TEXT,
            sig_gpg TEXT
        );

        CREATE TABLE content (
            package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            ftype TEXT NOT NULL CHECK(ftype IN ('obj', 'dir', 'sym'))
        );
        CREATE INDEX idx_content_package ON content(package_id);
        CREATE INDEX idx_content_path ON content(path);

        CREATE TABLE content_safety (
            package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            mtime REAL NOT NULL
        );

        CREATE TABLE automerge (
            package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            digest TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
