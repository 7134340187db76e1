// src/verify.rs

//! Package file integrity verification
//!
//! Verifies a downloaded file against its recorded digest and signature
//! families. The cheap size/digest comparison always runs; the expensive
//! signature checks are skipped when a side-file records that the file
//! already passed a full verification and its mtime has not changed since.
//!
//! Outcomes are the pipeline's integer codes: 0 verified, 1 mismatch.
//! The bounded mismatch/re-fetch loop lives in the download coordinator.

use crate::repository::SignatureMap;
use crate::settings::ClientSettings;
use sequoia_openpgp as openpgp;
use openpgp::Cert;
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use sha2::{Digest, Sha256, Sha512};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of the side-file caching the mtime of the last full verification
pub const MTIME_SUFFIX: &str = ".mtime";

/// Bounded attempts of the mismatch/forced-refetch loop
pub const MAX_VERIFY_ATTEMPTS: u32 = 5;

/// Hex SHA-256 of a file's content
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex SHA-512 of a file's content
pub fn sha512_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// The file's mtime rendered the way the side-file stores it
fn file_mtime_string(path: &Path) -> io::Result<String> {
    let mtime = fs::metadata(path)?.modified()?;
    let since_epoch = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(format!(
        "{}.{:09}",
        since_epoch.as_secs(),
        since_epoch.subsec_nanos()
    ))
}

/// Package file verifier
pub struct Verifier<'a> {
    settings: &'a ClientSettings,
}

impl<'a> Verifier<'a> {
    pub fn new(settings: &'a ClientSettings) -> Self {
        Self { settings }
    }

    /// Verify a downloaded file. Returns 0 when the digest matches and all
    /// enabled signature families validate, 1 otherwise.
    pub fn verify(
        &self,
        path: &Path,
        expected_digest: &str,
        signatures: &SignatureMap,
        repository_id: &str,
    ) -> i32 {
        debug!("checking package digest for {}", path.display());

        let actual = match sha256_file(path) {
            Ok(actual) => actual,
            Err(err) => {
                warn!("digest validation error for {}: {}", path.display(), err);
                return 1;
            }
        };
        if actual != expected_digest {
            warn!("invalid digest for {}", path.display());
            return 1;
        }

        // the digest is fine; skip the signature pass if the file has not
        // been touched since it last fully validated
        if !self.mtime_unchanged(path) {
            if !self.validate_signatures(path, signatures, repository_id) {
                warn!("invalid signatures for {}", path.display());
                return 1;
            }
        }

        self.store_mtime(path);
        0
    }

    fn mtime_side_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(MTIME_SUFFIX);
        PathBuf::from(name)
    }

    fn mtime_unchanged(&self, path: &Path) -> bool {
        let stored = match fs::read_to_string(Self::mtime_side_path(path)) {
            Ok(stored) => stored,
            Err(_) => return false,
        };
        match file_mtime_string(path) {
            Ok(current) => current == stored.trim(),
            Err(_) => false,
        }
    }

    fn store_mtime(&self, path: &Path) {
        // best effort; a missing side-file only costs a re-verification
        if let Ok(current) = file_mtime_string(path) {
            if let Err(err) = fs::write(Self::mtime_side_path(path), current) {
                warn!("unable to store verification mtime: {}", err);
            }
        }
    }

    fn validate_signatures(
        &self,
        path: &Path,
        signatures: &SignatureMap,
        repository_id: &str,
    ) -> bool {
        let families: [(&str, Option<&String>); 3] = [
            ("sha256", signatures.sha256.as_ref()),
            ("sha512", signatures.sha512.as_ref()),
            ("gpg", signatures.gpg.as_ref()),
        ];

        for (family, value) in families {
            let Some(value) = value else { continue };
            if !self.settings.hash_enabled(family) {
                info!("{} signature check disabled", family);
                continue;
            }

            let valid = match family {
                "sha256" => sha256_file(path).ok().map(|h| h == *value),
                "sha512" => sha512_file(path).ok().map(|h| h == *value),
                "gpg" => self.verify_gpg(repository_id, path, value),
                _ => None,
            };

            match valid {
                Some(true) => {
                    info!("{} signature validated for {}", family, path.display());
                }
                Some(false) => {
                    warn!(
                        "{} signature for {} does not match the recorded one",
                        family,
                        path.display()
                    );
                    return false;
                }
                None => {
                    warn!(
                        "{} signature verification temporarily unavailable for {}",
                        family,
                        path.display()
                    );
                }
            }
        }
        true
    }

    /// Verify an armored detached OpenPGP signature against the repository
    /// public key. `None` means the check could not run (no key material).
    fn verify_gpg(&self, repository_id: &str, path: &Path, armored_sig: &str) -> Option<bool> {
        let key_path = self
            .settings
            .keystore_dir
            .join(format!("{}.asc", repository_id));
        if !key_path.is_file() {
            return None;
        }
        let cert = match Cert::from_file(&key_path) {
            Ok(cert) => cert,
            Err(err) => {
                warn!("unreadable repository key {}: {}", key_path.display(), err);
                return None;
            }
        };

        let policy = StandardPolicy::new();
        let helper = KeyStoreHelper { certs: vec![cert] };
        let mut verifier = match DetachedVerifierBuilder::from_bytes(armored_sig.as_bytes())
            .and_then(|b| b.with_policy(&policy, None, helper))
        {
            Ok(verifier) => verifier,
            Err(err) => {
                warn!("malformed detached signature: {}", err);
                return Some(false);
            }
        };

        match verifier.verify_file(path) {
            Ok(()) => Some(true),
            Err(err) => {
                warn!("signature verification failed: {}", err);
                Some(false)
            }
        }
    }
}

struct KeyStoreHelper {
    certs: Vec<Cert>,
}

impl VerificationHelper for KeyStoreHelper {
    fn get_certs(&mut self, _ids: &[openpgp::KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(|r| r.is_ok()) {
                    return Ok(());
                }
            }
        }
        Err(openpgp::Error::InvalidOperation("no valid signature".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn settings_in(dir: &Path) -> ClientSettings {
        let mut settings = ClientSettings::default();
        settings.keystore_dir = dir.join("keys");
        settings
    }

    fn write_file(path: &Path, data: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(data).unwrap();
    }

    #[test]
    fn test_digest_match_and_mismatch() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path());
        let verifier = Verifier::new(&settings);

        let file = dir.path().join("pkg.tar.xz");
        write_file(&file, b"payload");
        let digest = sha256_file(&file).unwrap();

        let sigs = SignatureMap::default();
        assert_eq!(verifier.verify(&file, &digest, &sigs, "main"), 0);
        assert_eq!(verifier.verify(&file, "deadbeef", &sigs, "main"), 1);
    }

    #[test]
    fn test_signature_mismatch_fails() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path());
        let verifier = Verifier::new(&settings);

        let file = dir.path().join("pkg.tar.xz");
        write_file(&file, b"payload");
        let digest = sha256_file(&file).unwrap();

        let sigs = SignatureMap {
            sha512: Some("not-a-real-sha512".to_string()),
            ..Default::default()
        };
        assert_eq!(verifier.verify(&file, &digest, &sigs, "main"), 1);
    }

    #[test]
    fn test_disabled_family_is_skipped() {
        let dir = tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.package_hashes = vec!["sha256".to_string()];
        let verifier = Verifier::new(&settings);

        let file = dir.path().join("pkg.tar.xz");
        write_file(&file, b"payload");
        let digest = sha256_file(&file).unwrap();

        let sigs = SignatureMap {
            sha512: Some("garbage".to_string()),
            ..Default::default()
        };
        assert_eq!(verifier.verify(&file, &digest, &sigs, "main"), 0);
    }

    #[test]
    fn test_mtime_cache_skips_signature_pass() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path());
        let verifier = Verifier::new(&settings);

        let file = dir.path().join("pkg.tar.xz");
        write_file(&file, b"payload");
        let digest = sha256_file(&file).unwrap();

        let bad_sigs = SignatureMap {
            sha512: Some("garbage".to_string()),
            ..Default::default()
        };
        // full pass fails on the bad signature
        assert_eq!(verifier.verify(&file, &digest, &bad_sigs, "main"), 1);

        // a good full pass records the mtime...
        let good_sigs = SignatureMap {
            sha512: Some(sha512_file(&file).unwrap()),
            ..Default::default()
        };
        assert_eq!(verifier.verify(&file, &digest, &good_sigs, "main"), 0);

        // ...after which even a bad signature map passes, because the
        // signature checks are skipped for an unchanged file
        assert_eq!(verifier.verify(&file, &digest, &bad_sigs, "main"), 0);
    }

    #[test]
    fn test_gpg_without_key_material_is_unavailable_not_fatal() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path());
        let verifier = Verifier::new(&settings);

        let file = dir.path().join("pkg.tar.xz");
        write_file(&file, b"payload");
        let digest = sha256_file(&file).unwrap();

        let sigs = SignatureMap {
            gpg: Some("-----BEGIN PGP SIGNATURE-----\n...".to_string()),
            ..Default::default()
        };
        assert_eq!(verifier.verify(&file, &digest, &sigs, "main"), 0);
    }

    #[test]
    fn test_missing_file_is_a_mismatch() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path());
        let verifier = Verifier::new(&settings);

        let missing = dir.path().join("nope.tar.xz");
        let sigs = SignatureMap::default();
        assert_eq!(verifier.verify(&missing, "anything", &sigs, "main"), 1);
    }
}
