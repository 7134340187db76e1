// src/delta.rs

//! Differential download engine
//!
//! When an installed predecessor of a package exists and its archive is
//! still in the download store, a binary delta can be fetched instead of
//! the full archive. A delta is a zstd frame of the new archive compressed
//! against the predecessor archive as dictionary, prefixed by a fixed
//! header carrying the uncompressed size.
//!
//! Every failure here falls back to the ordinary full download; the engine
//! never propagates apply errors to the pipeline.

use crate::error::{Error, Result};
use crate::repository::{PackageId, Repository};
use crate::settings::ClientSettings;
use crate::transport::{AbortCheck, FetchStatus, Transport};
use crate::verify::sha256_file;
use semver::Version;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Subdirectory next to the package files holding the deltas
pub const DELTA_SUBDIR: &str = "deltas";

/// Delta file extension
pub const DELTA_EXT: &str = ".edelta";

/// Bounded delta download/apply attempts before falling back
pub const MAX_DELTA_ATTEMPTS: u32 = 2;

const DELTA_MAGIC: &[u8; 8] = b"GDELTA01";
const DELTA_HEADER_LEN: usize = 16;

/// Delta identifier derived from the digests of both archive versions
pub fn delta_id(old_digest: &str, new_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(old_digest.as_bytes());
    hasher.update(new_digest.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

/// Delta file name for a target package file name
pub fn delta_file_name(new_file_name: &str, id: &str) -> String {
    let stem = Path::new(new_file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| new_file_name.to_string());
    format!("{}.{}{}", stem, id, DELTA_EXT)
}

/// Delta URL living in the delta subpath beside the target URL
pub fn delta_url(target_url: &str, old_digest: &str, new_digest: &str) -> String {
    let (dir, file) = match target_url.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", target_url),
    };
    let name = delta_file_name(file, &delta_id(old_digest, new_digest));
    if dir.is_empty() {
        format!("{}/{}", DELTA_SUBDIR, name)
    } else {
        format!("{}/{}/{}", dir, DELTA_SUBDIR, name)
    }
}

/// Produce a delta transforming `old` into `new` at `out`
pub fn create_delta(old: &Path, new: &Path, out: &Path) -> Result<()> {
    let old_bytes = fs::read(old)?;
    let new_bytes = fs::read(new)?;
    let mut compressor = zstd::bulk::Compressor::with_dictionary(19, &old_bytes)?;
    let frame = compressor.compress(&new_bytes)?;

    let mut data = Vec::with_capacity(DELTA_HEADER_LEN + frame.len());
    data.extend_from_slice(DELTA_MAGIC);
    data.extend_from_slice(&(new_bytes.len() as u64).to_le_bytes());
    data.extend_from_slice(&frame);
    fs::write(out, data)?;
    Ok(())
}

/// Apply a delta against the predecessor archive, writing the
/// reconstructed file to `out`
pub fn apply_delta(old: &Path, delta: &Path, out: &Path) -> Result<()> {
    let old_bytes = fs::read(old)?;
    let data = fs::read(delta)?;
    if data.len() < DELTA_HEADER_LEN || &data[..8] != DELTA_MAGIC {
        return Err(Error::ParseError(format!(
            "not a delta file: {}",
            delta.display()
        )));
    }
    let size = u64::from_le_bytes(data[8..DELTA_HEADER_LEN].try_into().unwrap()) as usize;

    let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&old_bytes)?;
    let new_bytes = decompressor.decompress(&data[DELTA_HEADER_LEN..], size)?;
    if new_bytes.len() != size {
        return Err(Error::ParseError(format!(
            "delta for {} decoded to {} bytes, expected {}",
            out.display(),
            new_bytes.len(),
            size
        )));
    }
    fs::write(out, new_bytes)?;
    Ok(())
}

/// Pick the best installed predecessor among several key+slot matches
pub(crate) fn best_installed(installed: &dyn Repository, ids: &[PackageId]) -> Option<PackageId> {
    ids.iter()
        .copied()
        .max_by_key(|id| {
            let version = installed.version(*id).ok();
            (
                version.as_deref().and_then(|v| Version::parse(v).ok()),
                *id,
            )
        })
}

/// Delta engine wired to one transaction's collaborators
pub struct DeltaEngine<'a> {
    pub settings: &'a ClientSettings,
    pub transport: &'a dyn Transport,
    pub repository: &'a dyn Repository,
    pub installed: &'a dyn Repository,
}

impl DeltaEngine<'_> {
    /// Locate the verified installed predecessor archive for a package, or
    /// `None` when delta download cannot apply.
    fn predecessor_archive(
        &self,
        package_id: PackageId,
        download_path: &Path,
    ) -> Option<(PathBuf, String)> {
        let key_slot = self.repository.key_slot(package_id).ok()??;
        let ids = self.installed.search_key_slot(&key_slot).ok()?;
        let best = best_installed(self.installed, &ids)?;

        let installed_url = self.installed.download_url(best).ok()?;
        let installed_digest = self.installed.digest(best).ok()?;
        let installed_path = self.settings.fetch_disk_path(&installed_url);

        if installed_path == download_path {
            // the file we would patch is the file we need to produce
            return None;
        }
        Some((installed_path, installed_digest))
    }

    /// Try to reconstruct the target package file from a delta.
    ///
    /// Returns `(0, rate)` when the file was reconstructed and verified,
    /// `(1, rate)` when delta download does not apply or failed (the caller
    /// falls back to the full download), `(-1, 0)` on unrecoverable local
    /// I/O and `(-100, rate)` on cancellation.
    pub fn try_delta_fetch(
        &self,
        package_id: PackageId,
        url: &str,
        download_path: &Path,
        expected_digest: &str,
        resume: bool,
        abort: AbortCheck,
    ) -> (i32, u64) {
        if !self.settings.delta_support {
            return (1, 0);
        }
        if !self.transport.supports_deltas(url) {
            return (1, 0);
        }

        let Some((installed_path, installed_digest)) =
            self.predecessor_archive(package_id, download_path)
        else {
            return (1, 0);
        };

        // the predecessor copy must still match its recorded digest
        match sha256_file(&installed_path) {
            Ok(digest) if digest == installed_digest => {}
            _ => {
                debug!(
                    "predecessor archive {} unusable for delta",
                    installed_path.display()
                );
                return (1, 0);
            }
        }

        if let Some(parent) = download_path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("cannot create download directory: {}", err);
                return (-1, 0);
            }
        }

        let delta_url = delta_url(url, &installed_digest, expected_digest);
        let mut delta_save = download_path.as_os_str().to_os_string();
        delta_save.push(DELTA_EXT);
        let delta_save = PathBuf::from(delta_save);

        let mut delta_resume = resume;
        let mut transfer_rate = 0;
        for _attempt in 0..MAX_DELTA_ATTEMPTS {
            let result = self
                .transport
                .fetch(&delta_url, &delta_save, delta_resume, abort);
            transfer_rate = result.transfer_rate;
            match result.status {
                FetchStatus::Delivered(_) => {}
                FetchStatus::Cancelled => return (-100, transfer_rate),
                _ => {
                    delta_resume = false;
                    continue;
                }
            }

            let mut tmp = download_path.as_os_str().to_os_string();
            tmp.push(".edelta_pkg_tmp");
            let tmp = PathBuf::from(tmp);

            match apply_delta(&installed_path, &delta_save, &tmp) {
                Ok(()) => {}
                Err(err) => {
                    debug!("delta apply failed: {}", err);
                    let _ = fs::remove_file(&tmp);
                    delta_resume = false;
                    continue;
                }
            }

            match sha256_file(&tmp) {
                Ok(digest) if digest == expected_digest => {}
                _ => {
                    debug!("delta candidate digest mismatch, discarding");
                    let _ = fs::remove_file(&tmp);
                    delta_resume = false;
                    continue;
                }
            }

            if fs::rename(&tmp, download_path).is_err() {
                let _ = fs::remove_file(&tmp);
                return (1, transfer_rate);
            }
            return (0, transfer_rate);
        }

        (1, transfer_rate)
    }

    /// Pre-seed a missing download path with the installed predecessor
    /// archive so the subsequent plain download turns into a resume.
    /// Best effort: every failure just leaves the path cold.
    pub fn preseed_download_path(
        &self,
        package_id: PackageId,
        url: &str,
        download_path: &Path,
        resume: bool,
    ) {
        if !resume {
            return;
        }
        if !self.transport.supports_deltas(url) {
            return;
        }
        if download_path.is_file() {
            // an existing partial file is already a resume candidate
            return;
        }
        let Some((installed_path, _)) = self.predecessor_archive(package_id, download_path) else {
            return;
        };

        let mut tmp = download_path.as_os_str().to_os_string();
        tmp.push(".setup_differential_download");
        let tmp = PathBuf::from(tmp);

        let seeded = (|| -> std::io::Result<()> {
            if let Some(parent) = download_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&installed_path, &tmp)?;
            fs::rename(&tmp, download_path)?;
            Ok(())
        })();

        match seeded {
            Ok(()) => debug!(
                "pre-seeded {} from {}",
                download_path.display(),
                installed_path.display()
            ),
            Err(err) => {
                debug!("differential download setup failed: {}", err);
                let _ = fs::remove_file(&tmp);
            }
        }
    }
}
