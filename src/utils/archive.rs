//! Archive extraction for downloaded packages.
//!
//! Hosted packages and the github tarball fallback ship as `.tar.gz`; stored
//! (uncompressed) `.zip` is accepted as a fallback format. Archives are
//! expanded into a scratch directory first and a lone top-level directory is
//! stripped, so `foo-1.0.0/lib/...` and `lib/...` layouts land identically.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

use crate::utils::fs::{copy_dir_all, ensure_dir};

/// Expand a gzipped tarball into `dest`, stripping a lone top-level
/// directory. Tarballs arrive as in-memory response bodies, hence a reader
/// rather than a path.
pub fn extract_tar_gz_reader<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let scratch = tempfile::tempdir_in(
        dest.parent().unwrap_or_else(|| Path::new(".")),
    )
    .context("Failed to create extraction scratch directory")?;

    let mut tar = tar::Archive::new(GzDecoder::new(reader));
    tar.unpack(scratch.path()).context("Malformed tar.gz archive")?;

    promote_stripped(scratch.path(), dest)
}

/// Expand a zip archive into `dest`, stripping a lone top-level directory.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
    let scratch = tempfile::tempdir_in(
        dest.parent().unwrap_or_else(|| Path::new(".")),
    )
    .context("Failed to create extraction scratch directory")?;

    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("Malformed zip archive: {}", archive.display()))?;
    zip.extract(scratch.path())
        .with_context(|| format!("Failed to extract archive: {}", archive.display()))?;

    promote_stripped(scratch.path(), dest)
}

/// Move extracted contents into `dest`. When the scratch directory holds
/// exactly one directory and nothing else, its contents are promoted
/// instead, stripping the archive's top-level directory.
fn promote_stripped(scratch: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;

    let entries: Vec<_> = fs::read_dir(scratch)
        .context("Failed to read extraction scratch directory")?
        .collect::<std::io::Result<_>>()?;

    let root = match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => only.path(),
        _ => scratch.to_path_buf(),
    };

    copy_dir_all(&root, dest)
}
