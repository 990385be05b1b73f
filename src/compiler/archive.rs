//! Blocking writers for consolidated artifacts.
//!
//! Every artifact is written to a temporary file next to its target and
//! renamed into place, so a reader never sees a half-written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder as TarBuilder;
use tempfile::NamedTempFile;

fn temp_beside(target: &Path) -> std::io::Result<NamedTempFile> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new()
        .prefix(".compile-")
        .suffix(".tmp")
        .tempfile_in(dir)
}

/// Writes `bytes` to `target` atomically.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = temp_beside(target)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Bundles `files` into a gzip-compressed tarball at `target`, each file
/// stored under its bare file name.
pub fn write_tar_gz(target: &Path, files: &[PathBuf]) -> std::io::Result<()> {
    let tmp = temp_beside(target)?;
    {
        let enc = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut tar = TarBuilder::new(enc);
        for file in files {
            let name = file.file_name().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("no file name in {}", file.display()),
                )
            })?;
            tar.append_path_with_name(file, name)?;
        }
        let enc = tar.into_inner()?;
        enc.finish()?;
    }
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Placeholder written when a bundle could not be built.
pub fn write_placeholder(target: &Path, files: &[PathBuf], reason: &str) -> std::io::Result<()> {
    let mut text = format!("archive unavailable: {}\n", reason);
    for file in files {
        text.push_str(&file.display().to_string());
        text.push('\n');
    }
    write_atomic(target, text.as_bytes())
}
