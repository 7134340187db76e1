// src/content.rs

//! Streaming content-ledger format
//!
//! A content ledger is the line-oriented record of the files a package owns:
//! one record per line, `<package_id>|<type>|<path>`, with `0` standing in
//! for "no package id". Content-safety ledgers record the last-known-good
//! state of protected files as `<mtime>|<sha256>|<path>`.
//!
//! The ledgers are a durable wire format between metadata extraction and the
//! install/remove transaction: field order, the `0` sentinel and the
//! one-record-per-line framing must be preserved exactly.
//!
//! Readers are restartable: every call to `iter()` opens a fresh handle, so
//! a rolled-back transaction can replay the ledger from the start without
//! data loss. Merge and filter rewrite ledgers in one streaming pass and
//! swap the result into place with an atomic rename.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Staging suffix used by the merge/filter rewrite passes.
pub const TMP_SUFFIX: &str = "__filter_tmp";

/// Kind of filesystem node a content record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Obj,
    Dir,
    Sym,
}

impl EntryType {
    pub fn as_str(&self) -> &str {
        match self {
            EntryType::Obj => "obj",
            EntryType::Dir => "dir",
            EntryType::Sym => "sym",
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "obj" => Ok(EntryType::Obj),
            "dir" => Ok(EntryType::Dir),
            "sym" => Ok(EntryType::Sym),
            _ => Err(format!("Invalid entry type: {}", s)),
        }
    }
}

/// One content-ledger record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    /// Owning package id, 0 when unknown
    pub package_id: i64,
    pub ftype: EntryType,
    pub path: String,
}

/// One content-safety record: last-known-good state of a protected file
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyRecord {
    pub path: String,
    pub sha256: String,
    pub mtime: f64,
}

/// Read one full line, re-joining records whose line came back split before
/// the terminator. A record is complete only at `\n` or EOF.
fn read_joined_line<R: BufRead>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    while !line.ends_with(b"\n") {
        let part = reader.read_until(b'\n', &mut line)?;
        if part == 0 {
            // EOF without terminator, accept what we have
            break;
        }
        tracing::warn!("content ledger: re-joined a partial record line");
    }
    if line.ends_with(b"\n") {
        line.pop();
    }
    Ok(Some(line))
}

fn decode_line(raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw)
        .map_err(|e| Error::ParseError(format!("ledger record is not valid UTF-8: {}", e)))
}

/// Restartable cursor over a content ledger.
///
/// Holds only the path; `iter()` opens a new handle positioned at the start,
/// so iterating again after a rollback replays every record.
#[derive(Debug, Clone)]
pub struct ContentReader {
    path: PathBuf,
}

impl ContentReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a new iteration from the first record
    pub fn iter(&self) -> Result<ContentIter> {
        let file = File::open(&self.path)?;
        Ok(ContentIter {
            reader: BufReader::new(file),
            eof: false,
        })
    }
}

pub struct ContentIter {
    reader: BufReader<File>,
    eof: bool,
}

impl Iterator for ContentIter {
    type Item = Result<ContentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.eof {
            return None;
        }
        let raw = match read_joined_line(&mut self.reader) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.eof = true;
                return None;
            }
            Err(err) => return Some(Err(err.into())),
        };
        Some(parse_content_record(raw))
    }
}

fn parse_content_record(raw: Vec<u8>) -> Result<ContentRecord> {
    let line = decode_line(raw)?;
    let mut fields = line.splitn(3, '|');
    let (id, ftype, path) = match (fields.next(), fields.next(), fields.next()) {
        (Some(id), Some(ftype), Some(path)) => (id, ftype, path),
        _ => {
            return Err(Error::ParseError(format!(
                "malformed content record: {:?}",
                line
            )));
        }
    };
    let package_id = id
        .parse::<i64>()
        .map_err(|e| Error::ParseError(format!("bad package id {:?}: {}", id, e)))?;
    let ftype = ftype
        .parse::<EntryType>()
        .map_err(Error::ParseError)?;
    Ok(ContentRecord {
        package_id,
        ftype,
        path: path.to_string(),
    })
}

/// Buffered content-ledger writer.
///
/// The backing file is created as soon as the writer is constructed; the
/// atomic-rename passes depend on the file existing even when no record has
/// been written yet.
pub struct ContentWriter {
    file: BufWriter<File>,
}

impl ContentWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    /// Write one record. A `package_id` of `None` is recorded as the `0`
    /// sentinel.
    pub fn write(&mut self, package_id: Option<i64>, path: &str, ftype: EntryType) -> Result<()> {
        let id = package_id.unwrap_or(0);
        writeln!(self.file, "{}|{}|{}", id, ftype.as_str(), path)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Restartable cursor over a content-safety ledger
#[derive(Debug, Clone)]
pub struct SafetyReader {
    path: PathBuf,
}

impl SafetyReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn iter(&self) -> Result<SafetyIter> {
        let file = File::open(&self.path)?;
        Ok(SafetyIter {
            reader: BufReader::new(file),
            eof: false,
        })
    }
}

pub struct SafetyIter {
    reader: BufReader<File>,
    eof: bool,
}

impl Iterator for SafetyIter {
    type Item = Result<SafetyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.eof {
            return None;
        }
        let raw = match read_joined_line(&mut self.reader) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.eof = true;
                return None;
            }
            Err(err) => return Some(Err(err.into())),
        };
        Some(parse_safety_record(raw))
    }
}

fn parse_safety_record(raw: Vec<u8>) -> Result<SafetyRecord> {
    let line = decode_line(raw)?;
    let mut fields = line.splitn(3, '|');
    let (mtime, sha256, path) = match (fields.next(), fields.next(), fields.next()) {
        (Some(mtime), Some(sha256), Some(path)) => (mtime, sha256, path),
        _ => {
            return Err(Error::ParseError(format!(
                "malformed content-safety record: {:?}",
                line
            )));
        }
    };
    let mtime = mtime
        .parse::<f64>()
        .map_err(|e| Error::ParseError(format!("bad mtime {:?}: {}", mtime, e)))?;
    Ok(SafetyRecord {
        path: path.to_string(),
        sha256: sha256.to_string(),
        mtime,
    })
}

/// Buffered content-safety writer; same file-creation contract as
/// [`ContentWriter`].
pub struct SafetyWriter {
    file: BufWriter<File>,
}

impl SafetyWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, path: &str, sha256: &str, mtime: f64) -> Result<()> {
        writeln!(self.file, "{:.6}|{}|{}", mtime, sha256, path)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

fn swap_into_place(tmp: &Path, target: &Path, outcome: Result<()>) -> Result<()> {
    let res = outcome.and_then(|()| {
        fs::rename(tmp, target)?;
        Ok(())
    });
    if res.is_err() {
        match fs::remove_file(tmp) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    res
}

/// Merge a sorted diff into a sorted content ledger.
///
/// Both sides must be in descending path order. Ledger entries sorting
/// strictly after the current diff entry are copied through; otherwise the
/// diff entry is spliced in (its type wins) and, on an exact path match, the
/// ledger entry is consumed too. Runs in O(n+m) without materializing either
/// side, then atomically renames the result over the original.
pub fn merge_content_file(content_file: &Path, sorted_diff: &[(String, EntryType)]) -> Result<()> {
    let tmp = tmp_path(content_file);
    let reader = ContentReader::new(content_file);
    let mut writer = ContentWriter::new(&tmp)?;

    let outcome = (|| -> Result<()> {
        let mut ptr = 0usize;
        let mut last_package_id = 0i64;

        for record in reader.iter()? {
            let record = record?;
            last_package_id = record.package_id;

            loop {
                let Some((diff_path, diff_type)) = sorted_diff.get(ptr) else {
                    writer.write(Some(record.package_id), &record.path, record.ftype)?;
                    break;
                };

                if record.path.as_str() > diff_path.as_str() {
                    // descending order: the ledger entry comes first
                    writer.write(Some(record.package_id), &record.path, record.ftype)?;
                    break;
                }

                writer.write(Some(record.package_id), diff_path, *diff_type)?;
                ptr += 1;
                if record.path.as_str() == diff_path.as_str() {
                    // same path: the diff version replaces the ledger entry
                    break;
                }
            }
        }

        for (diff_path, diff_type) in &sorted_diff[ptr.min(sorted_diff.len())..] {
            writer.write(Some(last_package_id), diff_path, *diff_type)?;
        }
        writer.close()
    })();

    swap_into_place(&tmp, content_file, outcome)
}

/// Rewrite a content ledger keeping only records whose path satisfies the
/// predicate, with the same atomic-rename discipline as the merge.
pub fn filter_content_file<F>(content_file: &Path, mut keep: F) -> Result<()>
where
    F: FnMut(&str) -> bool,
{
    let tmp = tmp_path(content_file);
    let reader = ContentReader::new(content_file);
    let mut writer = ContentWriter::new(&tmp)?;

    let outcome = (|| -> Result<()> {
        for record in reader.iter()? {
            let record = record?;
            if keep(&record.path) {
                writer.write(Some(record.package_id), &record.path, record.ftype)?;
            }
        }
        writer.close()
    })();

    swap_into_place(&tmp, content_file, outcome)
}

fn tmp_path(content_file: &Path) -> PathBuf {
    let mut name = content_file.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Write a package's content into a fresh ledger file under `dir` and return
/// its path. When `filter_splitdebug` is set and splitdebug is disabled,
/// paths under the splitdebug directories are dropped from the ledger.
pub fn generate_content_file<I>(
    content: I,
    package_id: Option<i64>,
    filter_splitdebug: bool,
    splitdebug: bool,
    splitdebug_dirs: &[String],
    dir: &Path,
) -> Result<PathBuf>
where
    I: IntoIterator<Item = (String, EntryType)>,
{
    fs::create_dir_all(dir)?;
    let (_, path) = tempfile::Builder::new()
        .prefix("PackageContent")
        .tempfile_in(dir)
        .map_err(Error::Io)?
        .keep()
        .map_err(|e| Error::Io(e.error))?;

    let mut writer = ContentWriter::new(&path)?;
    for (entry_path, ftype) in content {
        if filter_splitdebug
            && !splitdebug
            && splitdebug_dirs.iter().any(|d| entry_path.starts_with(d))
        {
            continue;
        }
        writer.write(package_id, &entry_path, ftype)?;
    }
    writer.close()?;
    Ok(path)
}

/// Write content-safety records into a fresh ledger file under `dir` and
/// return its path.
pub fn generate_content_safety_file<I>(content_safety: I, dir: &Path) -> Result<PathBuf>
where
    I: IntoIterator<Item = SafetyRecord>,
{
    fs::create_dir_all(dir)?;
    let (_, path) = tempfile::Builder::new()
        .prefix("PackageContentSafety")
        .tempfile_in(dir)
        .map_err(Error::Io)?
        .keep()
        .map_err(|e| Error::Io(e.error))?;

    let mut writer = SafetyWriter::new(&path)?;
    for record in content_safety {
        writer.write(&record.path, &record.sha256, record.mtime)?;
    }
    writer.close()?;
    Ok(path)
}
