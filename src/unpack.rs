// src/unpack.rs

//! Package archive extraction
//!
//! Unpacks a package tarball into the image directory the installer later
//! merges onto the live root. Compression is detected from the file name;
//! zstd, xz, gzip and plain tar are supported.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::{debug, info};
use xz2::read::XzDecoder;

enum CompressionFormat {
    Zstd,
    Xz,
    Gzip,
    None,
}

fn detect_compression(path: &Path) -> Result<CompressionFormat> {
    let name = path.to_string_lossy();
    if name.ends_with(".tar.zst") {
        Ok(CompressionFormat::Zstd)
    } else if name.ends_with(".tar.xz") {
        Ok(CompressionFormat::Xz)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(CompressionFormat::Gzip)
    } else if name.ends_with(".tar") {
        Ok(CompressionFormat::None)
    } else {
        Err(Error::InitError(format!(
            "Unsupported package archive format: {}. Expected .tar[.zst|.xz|.gz]",
            name
        )))
    }
}

fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = match detect_compression(path)? {
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| Error::InitError(format!("Failed to create zstd decoder: {}", e)))?;
            Box::new(decoder)
        }
        CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
        CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
        CompressionFormat::None => Box::new(file),
    };
    Ok(Archive::new(reader))
}

/// Unpack a package archive into the image directory.
///
/// The image directory is created first so packages providing no files
/// still produce an image to merge.
pub fn unpack_package(package_path: &Path, image_dir: &Path) -> Result<()> {
    info!("unpacking {}", package_path.display());

    fs::create_dir_all(image_dir)?;

    let mut archive = open_archive(package_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.unpack(image_dir)?;

    debug!(
        "unpacked {} into {}",
        package_path.display(),
        image_dir.display()
    );
    Ok(())
}
