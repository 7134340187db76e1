// src/download.rs

//! Mirror selection and download coordination
//!
//! Builds the ranked mirror list for a repository, walks it with a
//! per-mirror failure budget, and drives single- and batch-file fetches
//! through the transport, trying a binary delta before every full
//! download. Result codes follow the taxonomy in [`crate::codes`] and are
//! returned to callers unchanged.

use crate::codes;
use crate::delta::DeltaEngine;
use crate::mirrors::{BAN_PENALTY, BAN_THRESHOLD, DECAY, MirrorStatus};
use crate::repository::{DownloadDescriptor, PackageId, Repository};
use crate::settings::ClientSettings;
use crate::transport::{AbortCheck, FetchRequest, FetchStatus, Transport};
use crate::verify::{MAX_VERIFY_ATTEMPTS, MTIME_SUFFIX, Verifier};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Short representative name of a mirror URL for log lines
fn url_name(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or(rest);
            format!("{}://{}", scheme, host)
        }
        None => url.to_string(),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Check a candidate mirror against the failure-score map.
///
/// Returns true when the mirror is currently banned; in that case the
/// penalty/decay cycle is advanced: a freshly banned mirror is pinned to
/// the threshold and pushed far above it, an already penalized one decays
/// toward reuse, and one at the edge is reset to zero.
pub(crate) fn mirror_fail_check(status: &MirrorStatus, url: &str) -> bool {
    let score = status.failing_score(url);
    if score < BAN_THRESHOLD {
        return false;
    }
    warn!(
        "mirror {} - maximum failure threshold reached",
        url_name(url)
    );
    if score == BAN_THRESHOLD {
        status.set_failing_score(url, BAN_THRESHOLD);
        status.add_failing(url, BAN_PENALTY);
    } else if score > BAN_THRESHOLD + 1 {
        status.add_failing(url, DECAY);
    } else {
        status.set_failing_score(url, 0);
    }
    true
}

/// Outcome of one plain file download
struct FileFetch {
    code: i32,
    bytes: u64,
    rate: u64,
    resumed: bool,
}

impl FileFetch {
    fn code(code: i32) -> Self {
        Self {
            code,
            bytes: 0,
            rate: 0,
            resumed: false,
        }
    }
}

/// Download coordinator for one transaction
pub struct DownloadCoordinator<'a> {
    pub settings: &'a ClientSettings,
    pub transport: &'a dyn Transport,
    pub repository: &'a dyn Repository,
    pub installed: &'a dyn Repository,
    pub status: &'a MirrorStatus,
}

impl<'a> DownloadCoordinator<'a> {
    fn delta_engine(&self) -> DeltaEngine<'_> {
        DeltaEngine {
            settings: self.settings,
            transport: self.transport,
            repository: self.repository,
            installed: self.installed,
        }
    }

    /// Ordered, deduplicated mirror URIs for a repository, merged with the
    /// mirrors of the repository it shadows (a repository that has been
    /// logically moved keeps serving packages from its original home).
    pub fn build_uris(&self, original_repo: Option<&str>, repository_id: &str) -> Vec<String> {
        let mut uris: Vec<String> = Vec::new();

        if let Some(orig) = original_repo {
            if orig != repository_id {
                if let Some(repo) = self.settings.available.get(orig) {
                    uris.extend(repo.mirrors.iter().cloned());
                } else if let Some(repo) = self.settings.excluded.get(orig) {
                    uris.extend(repo.mirrors.iter().cloned());
                }
            }
        }
        if let Some(repo) = self.settings.available.get(repository_id) {
            uris.extend(repo.mirrors.iter().cloned());
        }

        let mut seen = std::collections::HashSet::new();
        uris.retain(|u| seen.insert(u.clone()));
        uris
    }

    /// Download one package file, failing over between mirrors.
    ///
    /// Returns 0 on success, 1 when the operator cancelled, 3 when every
    /// mirror of the repository has been tried and dropped.
    pub fn download_package(
        &self,
        package_id: PackageId,
        download: &str,
        download_path: &Path,
        digest: &str,
        resume: bool,
        abort: AbortCheck,
    ) -> i32 {
        let original_repo = self
            .repository
            .original_repository(package_id)
            .ok()
            .flatten();
        let uris = self.build_uris(original_repo.as_deref(), self.repository.name());
        let mut remaining = uris.clone();

        let mut mirror_count = 0u32;
        for uri in &uris {
            if remaining.is_empty() {
                self.status.set_working_mirror(None);
                return codes::MIRRORS_EXHAUSTED;
            }

            self.status.set_working_mirror(Some(uri.as_str()));
            mirror_count += 1;
            let url = join_url(uri, download);

            if mirror_fail_check(self.status, uri) {
                remaining.retain(|u| u != uri);
                continue;
            }

            let mut do_resume = resume;
            let mut timeout_tries = codes::TIMEOUT_RETRIES;

            loop {
                info!(
                    "( mirror #{} ) downloading from {}",
                    mirror_count,
                    url_name(uri)
                );

                let (delta_code, delta_rate) = self.delta_engine().try_delta_fetch(
                    package_id,
                    &url,
                    download_path,
                    digest,
                    do_resume,
                    abort,
                );

                let fetch = if delta_code > 0 {
                    // no delta available, fall back to the full download
                    self.download_file(
                        &url,
                        download_path,
                        Some(digest),
                        do_resume,
                        Some(package_id),
                        abort,
                    )
                } else {
                    FileFetch {
                        code: delta_code,
                        bytes: 0,
                        rate: delta_rate,
                        resumed: false,
                    }
                };

                if fetch.code == codes::OK {
                    info!(
                        "( mirror #{} ) successfully downloaded from {} at {} bytes/sec",
                        mirror_count,
                        url_name(uri),
                        fetch.rate
                    );
                    self.status.set_working_mirror(None);
                    return codes::OK;
                }

                if fetch.resumed
                    && !matches!(
                        fetch.code,
                        codes::FETCH_NOT_FOUND | codes::FETCH_TIMEOUT | codes::FETCH_CANCELLED
                    )
                {
                    // the partial file may be the problem; retry cold
                    do_resume = false;
                    continue;
                }

                match fetch.code {
                    codes::FETCH_IO_ERROR => {
                        warn!(
                            "( mirror #{} ) error downloading from {} - file not available",
                            mirror_count,
                            url_name(uri)
                        );
                    }
                    codes::FETCH_CHECKSUM_ERROR => {
                        self.status.add_failing(uri, 1);
                        warn!(
                            "( mirror #{} ) error downloading from {} - wrong checksum",
                            mirror_count,
                            url_name(uri)
                        );
                        if fetch.bytes < 1 && do_resume {
                            // a falsely "complete" corrupt partial file:
                            // nothing was transferred, so disable resume and
                            // retry once from scratch
                            warn!("disabling resume");
                            do_resume = false;
                            continue;
                        }
                    }
                    codes::FETCH_NOT_FOUND => {
                        self.status.add_failing(uri, 3);
                        warn!(
                            "( mirror #{} ) error downloading from {} - not found",
                            mirror_count,
                            url_name(uri)
                        );
                    }
                    codes::FETCH_TIMEOUT => {
                        timeout_tries -= 1;
                        if timeout_tries > 0 {
                            warn!(
                                "( mirror #{} ) timeout from {}, retrying on this mirror",
                                mirror_count,
                                url_name(uri)
                            );
                        } else {
                            warn!(
                                "( mirror #{} ) timeout from {}, giving up",
                                mirror_count,
                                url_name(uri)
                            );
                        }
                    }
                    codes::FETCH_CANCELLED => {
                        warn!("( mirror #{} ) discarded download", mirror_count);
                    }
                    _ => {
                        self.status.add_failing(uri, 5);
                        warn!(
                            "( mirror #{} ) error downloading from {} - unknown reason",
                            mirror_count,
                            url_name(uri)
                        );
                    }
                }

                if fetch.code == codes::FETCH_TIMEOUT && timeout_tries > 0 {
                    continue;
                }
                if fetch.code == codes::FETCH_CANCELLED {
                    self.status.set_working_mirror(None);
                    return codes::FAILED;
                }

                remaining.retain(|u| u != uri);
                if remaining.is_empty() {
                    self.status.set_working_mirror(None);
                    return codes::MIRRORS_EXHAUSTED;
                }
                break;
            }
        }

        // success returns from inside the loop; reaching this point means
        // every mirror was banned or dropped
        self.status.set_working_mirror(None);
        codes::MIRRORS_EXHAUSTED
    }

    /// One plain file download attempt against one mirror
    fn download_file(
        &self,
        url: &str,
        download_path: &Path,
        digest: Option<&str>,
        resume: bool,
        package_id: Option<PackageId>,
        abort: AbortCheck,
    ) -> FileFetch {
        if let Some(parent) = download_path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("cannot create download directory: {}", err);
                return FileFetch::code(codes::FETCH_IO_ERROR);
            }
        }

        let existed_before = download_path.is_file();

        if let Some(package_id) = package_id {
            self.delta_engine()
                .preseed_download_path(package_id, url, download_path, resume);
        }

        let result = self.transport.fetch(url, download_path, resume, abort);

        let cleanup = |keep_partial: bool| {
            if !keep_partial {
                let _ = fs::remove_file(download_path);
            }
        };
        let disk_matches = || match digest {
            Some(digest) => crate::verify::sha256_file(download_path)
                .map(|d| d == digest)
                .unwrap_or(false),
            None => false,
        };

        match result.status {
            FetchStatus::Cancelled => FileFetch {
                code: codes::FETCH_CANCELLED,
                bytes: result.bytes_transferred,
                rate: result.transfer_rate,
                resumed: result.resumed,
            },
            FetchStatus::NotFound => {
                // the network may be gone while the file is already here
                if disk_matches() {
                    FileFetch::code(codes::OK)
                } else {
                    FileFetch {
                        code: codes::FETCH_NOT_FOUND,
                        bytes: result.bytes_transferred,
                        rate: result.transfer_rate,
                        resumed: result.resumed,
                    }
                }
            }
            FetchStatus::Timeout => {
                if disk_matches() {
                    FileFetch::code(codes::OK)
                } else {
                    FileFetch {
                        code: codes::FETCH_TIMEOUT,
                        bytes: result.bytes_transferred,
                        rate: result.transfer_rate,
                        resumed: result.resumed,
                    }
                }
            }
            FetchStatus::Error => {
                if disk_matches() {
                    FileFetch::code(codes::OK)
                } else {
                    cleanup(existed_before && resume);
                    FileFetch {
                        code: codes::FETCH_IO_ERROR,
                        bytes: result.bytes_transferred,
                        rate: result.transfer_rate,
                        resumed: result.resumed,
                    }
                }
            }
            FetchStatus::Delivered(actual) => {
                if let Some(digest) = digest {
                    if actual != digest {
                        // not properly downloaded
                        cleanup(existed_before && resume);
                        return FileFetch {
                            code: codes::FETCH_CHECKSUM_ERROR,
                            bytes: result.bytes_transferred,
                            rate: result.transfer_rate,
                            resumed: result.resumed,
                        };
                    }
                }
                FileFetch {
                    code: codes::OK,
                    bytes: result.bytes_transferred,
                    rate: result.transfer_rate,
                    resumed: result.resumed,
                }
            }
        }
    }

    /// Fetch one file and verify it, re-fetching without resume on
    /// mismatch, up to the bounded attempt budget. Fetch-layer codes are
    /// returned unchanged; persistent verification failure returns 1.
    pub fn fetch_and_verify(
        &self,
        descriptor: &DownloadDescriptor,
        download_path: &Path,
        resume: bool,
        abort: AbortCheck,
    ) -> i32 {
        let verifier = Verifier::new(self.settings);

        if download_path.is_file()
            && verifier.verify(
                download_path,
                &descriptor.digest,
                &descriptor.signatures,
                &descriptor.repository_id,
            ) == codes::OK
        {
            return codes::OK;
        }

        let mut resume = resume;
        for attempt in 0..MAX_VERIFY_ATTEMPTS {
            let fetch_st = self.download_package(
                descriptor.package_id,
                &descriptor.download,
                download_path,
                &descriptor.digest,
                resume,
                abort,
            );
            if fetch_st != codes::OK {
                return fetch_st;
            }

            if verifier.verify(
                download_path,
                &descriptor.digest,
                &descriptor.signatures,
                &descriptor.repository_id,
            ) == codes::OK
            {
                return codes::OK;
            }

            warn!(
                "verification failed for {} (attempt {}), forcing re-fetch",
                download_path.display(),
                attempt + 1
            );
            let _ = fs::remove_file(download_path);
            let mut mtime_file = download_path.as_os_str().to_os_string();
            mtime_file.push(MTIME_SUFFIX);
            let _ = fs::remove_file(PathBuf::from(mtime_file));
            resume = false;
        }
        codes::FAILED
    }

    /// Download a batch of files in coordinated transfers.
    ///
    /// Returns `(0, [])` when everything arrived and verified, `(1, [])`
    /// on cancellation, and `(3, pending)` when some repository ran out of
    /// mirrors, with the descriptors still pending.
    pub fn download_packages(
        &self,
        list: &[DownloadDescriptor],
        resume: bool,
        abort: AbortCheck,
    ) -> (i32, Vec<DownloadDescriptor>) {
        if list.is_empty() {
            return (codes::OK, Vec::new());
        }

        let verifier = Verifier::new(self.settings);

        // ranked mirrors per involved repository
        let mut repo_uris: HashMap<String, Vec<String>> = HashMap::new();
        for descriptor in list {
            let original = self
                .repository
                .original_repository(descriptor.package_id)
                .ok()
                .flatten();
            let uris = self.build_uris(original.as_deref(), &descriptor.repository_id);
            let entry = repo_uris
                .entry(descriptor.repository_id.clone())
                .or_default();
            for uri in uris {
                if !entry.contains(&uri) {
                    entry.push(uri);
                }
            }
        }
        let mut remaining = repo_uris.clone();

        let mut d_list: Vec<DownloadDescriptor> = list.to_vec();

        loop {
            let mut do_resume = resume;
            let mut timeout_tries = codes::TIMEOUT_RETRIES;

            'inner: loop {
                // resolve the current best mirror per pending file
                let mut fetch_list: Vec<(DownloadDescriptor, String, String, PathBuf)> = Vec::new();
                for descriptor in &d_list {
                    let best = loop {
                        let Some(candidate) = remaining
                            .get(&descriptor.repository_id)
                            .and_then(|v| v.first().cloned())
                        else {
                            break None;
                        };
                        self.status.set_working_mirror(Some(candidate.as_str()));
                        if mirror_fail_check(self.status, &candidate) {
                            if let Some(v) = remaining.get_mut(&descriptor.repository_id) {
                                v.retain(|u| u != &candidate);
                            }
                            continue;
                        }
                        break Some(candidate);
                    };

                    let Some(best) = best else {
                        // one file failed for good, give up with everything
                        self.status.set_working_mirror(None);
                        return (codes::MIRRORS_EXHAUSTED, d_list);
                    };

                    let url = join_url(&best, &descriptor.download);
                    let path = self.settings.fetch_disk_path(&descriptor.download);
                    info!(
                        "[{}] @ {}",
                        Path::new(&descriptor.download)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| descriptor.download.clone()),
                        url_name(&best)
                    );
                    fetch_list.push((descriptor.clone(), best, url, path));
                }

                // delta pre-pass: reconstruct what we can before transferring
                let mut done = vec![false; fetch_list.len()];
                for (idx, (descriptor, _mirror, url, path)) in fetch_list.iter().enumerate() {
                    if path.is_file()
                        && verifier.verify(
                            path,
                            &descriptor.digest,
                            &descriptor.signatures,
                            &descriptor.repository_id,
                        ) == codes::OK
                    {
                        done[idx] = true;
                        continue;
                    }
                    let (delta_code, _rate) = self.delta_engine().try_delta_fetch(
                        descriptor.package_id,
                        url,
                        path,
                        &descriptor.digest,
                        do_resume,
                        abort,
                    );
                    match delta_code {
                        codes::OK => done[idx] = true,
                        codes::FETCH_CANCELLED => {
                            self.status.set_working_mirror(None);
                            return (codes::FAILED, Vec::new());
                        }
                        _ => {}
                    }
                }

                let pending: Vec<usize> = (0..fetch_list.len()).filter(|i| !done[*i]).collect();
                if pending.is_empty() {
                    self.status.set_working_mirror(None);
                    info!("all files reconstructed or already verified");
                    return (codes::OK, Vec::new());
                }

                let requests: Vec<FetchRequest> = pending
                    .iter()
                    .map(|&i| FetchRequest {
                        url: fetch_list[i].2.clone(),
                        dest: fetch_list[i].3.clone(),
                    })
                    .collect();
                let batch = self.transport.fetch_many(&requests, do_resume, abort);

                // evaluate per-file outcomes
                let mut failed: Vec<(DownloadDescriptor, i32)> = Vec::new();
                let mut cancelled = false;
                for (slot, &idx) in pending.iter().enumerate() {
                    let (descriptor, mirror, _url, path) = &fetch_list[idx];
                    let result = &batch.results[slot];
                    let code = match &result.status {
                        FetchStatus::Delivered(actual) => {
                            if *actual != descriptor.digest {
                                if !do_resume {
                                    let _ = fs::remove_file(path);
                                }
                                codes::FETCH_CHECKSUM_ERROR
                            } else if verifier.verify(
                                path,
                                &descriptor.digest,
                                &descriptor.signatures,
                                &descriptor.repository_id,
                            ) == codes::OK
                            {
                                codes::OK
                            } else {
                                codes::FETCH_CHECKSUM_ERROR
                            }
                        }
                        FetchStatus::NotFound => codes::FETCH_NOT_FOUND,
                        FetchStatus::Timeout => codes::FETCH_TIMEOUT,
                        FetchStatus::Error => codes::FETCH_IO_ERROR,
                        FetchStatus::Cancelled => codes::FETCH_CANCELLED,
                    };
                    match code {
                        codes::OK => {}
                        codes::FETCH_CANCELLED => cancelled = true,
                        codes::FETCH_CHECKSUM_ERROR => {
                            self.status.add_failing(mirror, 1);
                            warn!("wrong checksum for {}", descriptor.download);
                            failed.push((descriptor.clone(), code));
                        }
                        codes::FETCH_NOT_FOUND | codes::FETCH_TIMEOUT | codes::FETCH_IO_ERROR => {
                            warn!("error {} downloading {}", code, descriptor.download);
                            failed.push((descriptor.clone(), code));
                        }
                        _ => {
                            self.status.add_failing(mirror, 5);
                            failed.push((descriptor.clone(), code));
                        }
                    }
                }

                if cancelled {
                    self.status.set_working_mirror(None);
                    return (codes::FAILED, Vec::new());
                }
                if failed.is_empty() {
                    self.status.set_working_mirror(None);
                    info!("aggregated transfer rate {} bytes/sec", batch.transfer_rate);
                    return (codes::OK, Vec::new());
                }

                // recompute the reduced retry list
                let all_timeouts = failed.iter().all(|(_, c)| *c == codes::FETCH_TIMEOUT);
                d_list = failed.into_iter().map(|(d, _)| d).collect();

                if all_timeouts {
                    timeout_tries -= 1;
                    if timeout_tries > 0 {
                        continue 'inner;
                    }
                } else if do_resume {
                    // partial files may be poisoned; retry the reduced list cold
                    do_resume = false;
                    continue 'inner;
                }

                // drop the current best mirror of every repository still failing
                let repos: std::collections::HashSet<String> =
                    d_list.iter().map(|d| d.repository_id.clone()).collect();
                for repo in &repos {
                    if let Some(v) = remaining.get_mut(repo) {
                        if !v.is_empty() {
                            v.remove(0);
                        }
                    }
                }
                if repos
                    .iter()
                    .any(|r| remaining.get(r).map(|v| v.is_empty()).unwrap_or(true))
                {
                    self.status.set_working_mirror(None);
                    return (codes::MIRRORS_EXHAUSTED, d_list);
                }
                break 'inner;
            }
        }
    }
}
