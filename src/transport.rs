// src/transport.rs

//! Download transport
//!
//! The coordinator drives transfers through the [`Transport`] trait: one
//! blocking single-file fetch, one blocking batch fetch returning an
//! aggregate transfer rate, and a delta-capability probe. Wall-clock
//! timeouts belong to the transport; the coordinator only counts them.
//!
//! Two implementations are provided: [`HttpTransport`] over a blocking
//! reqwest client, and [`FileTransport`] for `file://` mirrors.

use crate::error::{Error, Result};
use crate::verify::sha256_file;
use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming chunk size between abort checks
const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    /// Transfer completed; carries the hex SHA-256 of the file on disk
    Delivered(String),
    /// The remote file does not exist
    NotFound,
    /// The transfer timed out
    Timeout,
    /// Unrecoverable transport error
    Error,
    /// The abort check fired
    Cancelled,
}

/// One transfer result
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: FetchStatus,
    /// Bytes moved over the wire by this transfer (resumes excluded)
    pub bytes_transferred: u64,
    /// Bytes per second
    pub transfer_rate: u64,
    /// Whether an existing partial file was resumed
    pub resumed: bool,
}

impl FetchResult {
    fn failed(status: FetchStatus) -> Self {
        Self {
            status,
            bytes_transferred: 0,
            transfer_rate: 0,
            resumed: false,
        }
    }
}

/// One entry of a batch fetch
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
}

/// Batch fetch outcome: per-request results in request order plus the
/// aggregate transfer rate
#[derive(Debug)]
pub struct BatchResult {
    pub results: Vec<FetchResult>,
    pub transfer_rate: u64,
}

/// Abort predicate checked between transfer chunks
pub type AbortCheck<'a> = &'a (dyn Fn() -> bool + Sync);

/// Blocking download transport
pub trait Transport: Sync {
    /// Fetch one file to `dest`, resuming an existing partial file when
    /// `resume` is set
    fn fetch(&self, url: &str, dest: &Path, resume: bool, abort: AbortCheck) -> FetchResult;

    /// Fetch a set of files in one coordinated transfer
    fn fetch_many(&self, requests: &[FetchRequest], resume: bool, abort: AbortCheck) -> BatchResult {
        let started = Instant::now();
        let results: Vec<FetchResult> = requests
            .par_iter()
            .map(|req| self.fetch(&req.url, &req.dest, resume, abort))
            .collect();
        let total: u64 = results.iter().map(|r| r.bytes_transferred).sum();
        BatchResult {
            results,
            transfer_rate: rate(total, started.elapsed()),
        }
    }

    /// Whether delta files can be fetched next to this URL
    fn supports_deltas(&self, url: &str) -> bool;
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        bytes
    }
}

fn ensure_parent_dir(dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// HTTP(S) transport over a blocking reqwest client
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, dest: &Path, resume: bool, abort: AbortCheck) -> FetchResult {
        if abort() {
            return FetchResult::failed(FetchStatus::Cancelled);
        }
        if let Err(err) = ensure_parent_dir(dest) {
            warn!("cannot create download directory: {}", err);
            return FetchResult::failed(FetchStatus::Error);
        }

        let offset = if resume {
            fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        debug!("GET {} -> {} (offset {})", url, dest.display(), offset);
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(err) => {
                let status = if err.is_timeout() {
                    FetchStatus::Timeout
                } else {
                    FetchStatus::Error
                };
                warn!("transfer error for {}: {}", url, err);
                return FetchResult::failed(status);
            }
        };

        let resumed;
        let mut file = match response.status() {
            StatusCode::NOT_FOUND => return FetchResult::failed(FetchStatus::NotFound),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // nothing left to transfer; hand back whatever is on disk
                return match sha256_file(dest) {
                    Ok(digest) => FetchResult {
                        status: FetchStatus::Delivered(digest),
                        bytes_transferred: 0,
                        transfer_rate: 0,
                        resumed: true,
                    },
                    Err(_) => FetchResult::failed(FetchStatus::Error),
                };
            }
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                resumed = true;
                match OpenOptions::new().append(true).open(dest) {
                    Ok(file) => file,
                    Err(_) => return FetchResult::failed(FetchStatus::Error),
                }
            }
            status if status.is_success() => {
                // full body, even if we asked for a range
                resumed = false;
                match File::create(dest) {
                    Ok(file) => file,
                    Err(_) => return FetchResult::failed(FetchStatus::Error),
                }
            }
            status => {
                warn!("HTTP {} from {}", status, url);
                return FetchResult::failed(FetchStatus::Error);
            }
        };

        let started = Instant::now();
        let mut body = response;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred: u64 = 0;
        loop {
            if abort() {
                return FetchResult {
                    status: FetchStatus::Cancelled,
                    bytes_transferred: transferred,
                    transfer_rate: rate(transferred, started.elapsed()),
                    resumed,
                };
            }
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    let status = if err.kind() == io::ErrorKind::TimedOut {
                        FetchStatus::Timeout
                    } else {
                        FetchStatus::Error
                    };
                    return FetchResult {
                        status,
                        bytes_transferred: transferred,
                        transfer_rate: rate(transferred, started.elapsed()),
                        resumed,
                    };
                }
            };
            if file.write_all(&buf[..n]).is_err() {
                return FetchResult::failed(FetchStatus::Error);
            }
            transferred += n as u64;
        }
        if file.flush().is_err() {
            return FetchResult::failed(FetchStatus::Error);
        }

        match sha256_file(dest) {
            Ok(digest) => FetchResult {
                status: FetchStatus::Delivered(digest),
                bytes_transferred: transferred,
                transfer_rate: rate(transferred, started.elapsed()),
                resumed,
            },
            Err(_) => FetchResult::failed(FetchStatus::Error),
        }
    }

    fn supports_deltas(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }
}

/// Transport for `file://` mirrors (local or bind-mounted repositories)
#[derive(Debug, Default)]
pub struct FileTransport;

impl FileTransport {
    pub fn new() -> Self {
        Self
    }

    fn source_path(url: &str) -> Option<PathBuf> {
        url.strip_prefix("file://").map(PathBuf::from)
    }
}

impl Transport for FileTransport {
    fn fetch(&self, url: &str, dest: &Path, resume: bool, abort: AbortCheck) -> FetchResult {
        if abort() {
            return FetchResult::failed(FetchStatus::Cancelled);
        }
        let Some(source) = Self::source_path(url) else {
            return FetchResult::failed(FetchStatus::Error);
        };
        if !source.is_file() {
            return FetchResult::failed(FetchStatus::NotFound);
        }
        if ensure_parent_dir(dest).is_err() {
            return FetchResult::failed(FetchStatus::Error);
        }

        let offset = if resume {
            fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let started = Instant::now();
        let outcome = (|| -> io::Result<(u64, bool)> {
            let mut src = File::open(&source)?;
            let src_len = src.metadata()?.len();
            if offset > 0 && offset <= src_len {
                use std::io::Seek;
                src.seek(io::SeekFrom::Start(offset))?;
                let mut out = OpenOptions::new().append(true).open(dest)?;
                let n = io::copy(&mut src, &mut out)?;
                Ok((n, true))
            } else {
                let mut out = File::create(dest)?;
                let n = io::copy(&mut src, &mut out)?;
                Ok((n, false))
            }
        })();

        match outcome {
            Ok((transferred, resumed)) => match sha256_file(dest) {
                Ok(digest) => FetchResult {
                    status: FetchStatus::Delivered(digest),
                    bytes_transferred: transferred,
                    transfer_rate: rate(transferred, started.elapsed()),
                    resumed,
                },
                Err(_) => FetchResult::failed(FetchStatus::Error),
            },
            Err(_) => FetchResult::failed(FetchStatus::Error),
        }
    }

    fn supports_deltas(&self, url: &str) -> bool {
        url.starts_with("file://")
    }
}

/// Hex SHA-256 of an in-memory buffer
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const NO_ABORT: fn() -> bool = || false;

    #[test]
    fn test_file_transport_delivers_and_hashes() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("mirror/pkg.tar.xz");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"archive bytes").unwrap();

        let transport = FileTransport::new();
        let dest = dir.path().join("store/pkg.tar.xz");
        let url = format!("file://{}", source.display());
        let result = transport.fetch(&url, &dest, true, &NO_ABORT);

        assert_eq!(
            result.status,
            FetchStatus::Delivered(sha256_bytes(b"archive bytes"))
        );
        assert_eq!(result.bytes_transferred, 13);
        assert!(!result.resumed);
        assert_eq!(fs::read(&dest).unwrap(), b"archive bytes");
    }

    #[test]
    fn test_file_transport_not_found() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new();
        let dest = dir.path().join("pkg.tar.xz");
        let result = transport.fetch("file:///no/such/file", &dest, true, &NO_ABORT);
        assert_eq!(result.status, FetchStatus::NotFound);
    }

    #[test]
    fn test_file_transport_resumes_partial_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("pkg.tar.xz");
        fs::write(&source, b"0123456789").unwrap();
        let dest = dir.path().join("store/pkg.tar.xz");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"01234").unwrap();

        let transport = FileTransport::new();
        let url = format!("file://{}", source.display());
        let result = transport.fetch(&url, &dest, true, &NO_ABORT);

        assert!(result.resumed);
        assert_eq!(result.bytes_transferred, 5);
        assert_eq!(fs::read(&dest).unwrap(), b"0123456789");
    }

    #[test]
    fn test_file_transport_cancelled() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new();
        let dest = dir.path().join("pkg.tar.xz");
        let abort = || true;
        let result = transport.fetch("file:///ignored", &dest, true, &abort);
        assert_eq!(result.status, FetchStatus::Cancelled);
    }

    #[test]
    fn test_batch_fetch_aggregates() {
        let dir = tempdir().unwrap();
        for name in ["a", "b"] {
            fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }
        let transport = FileTransport::new();
        let requests = vec![
            FetchRequest {
                url: format!("file://{}/a", dir.path().display()),
                dest: dir.path().join("out/a"),
            },
            FetchRequest {
                url: format!("file://{}/missing", dir.path().display()),
                dest: dir.path().join("out/missing"),
            },
        ];
        let batch = transport.fetch_many(&requests, true, &NO_ABORT);
        assert_eq!(batch.results.len(), 2);
        assert!(matches!(batch.results[0].status, FetchStatus::Delivered(_)));
        assert_eq!(batch.results[1].status, FetchStatus::NotFound);
    }

    #[test]
    fn test_delta_capability_probe() {
        assert!(HttpTransport::new().unwrap().supports_deltas("https://mirror/x"));
        assert!(!HttpTransport::new().unwrap().supports_deltas("ftp://mirror/x"));
        assert!(FileTransport::new().supports_deltas("file:///mirror/x"));
    }
}
