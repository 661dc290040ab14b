//! Filesystem utilities: atomic writes, directory management, symlinks.
//!
//! Writes that participate in the persisted state (lockfile, cache entries)
//! go through staging-then-rename so a crash never leaves a half-written
//! artifact behind. The staging location is always on the destination's
//! volume, keeping the final rename atomic.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Create `path` and any missing parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

/// Write `content` to `path` atomically: stage into a sibling temp file,
/// sync, then rename over the destination.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;

    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        file.sync_all().context("Failed to sync file to disk")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))
}

/// String convenience wrapper around [`atomic_write`].
pub fn atomic_write_str(path: &Path, content: &str) -> Result<()> {
    atomic_write(path, content.as_bytes())
}

/// Lexically normalize a path: collapse `.` components and fold `..` into
/// the preceding component. Performs no IO and resolves no symlinks.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// The canonical form of `path`: symlinks resolved when the path exists,
/// lexical normalization otherwise.
#[must_use]
pub fn resolve_symlinks(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| normalize_path(path))
}

/// Express `path` relative to `base`, or `None` when they share no lexical
/// prefix worth keeping (e.g. different roots).
#[must_use]
pub fn relative_from(path: &Path, base: &Path) -> Option<PathBuf> {
    let path = normalize_path(path);
    let base = normalize_path(base);
    let mut path_components = path.components();
    let mut base_components = base.components();
    let mut relative = PathBuf::new();
    loop {
        match (path_components.clone().next(), base_components.clone().next()) {
            (Some(p), Some(b)) if p == b => {
                path_components.next();
                base_components.next();
            }
            (_, Some(Component::Normal(_))) => {
                relative.push(Component::ParentDir);
                base_components.next();
            }
            (Some(_), Some(_)) => return None,
            (Some(p), None) => {
                relative.push(p);
                path_components.next();
            }
            (None, None) => {
                if relative.as_os_str().is_empty() {
                    relative.push(Component::CurDir);
                }
                return Some(relative);
            }
            (None, Some(_)) => {
                relative.push(Component::ParentDir);
                base_components.next();
            }
        }
    }
}

/// Recursively copy `src` into `dst`, creating `dst` if needed.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    ensure_dir(dst)?;
    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// Delete every entry inside `path`, creating the directory when missing.
/// Symlinked entries are unlinked, never followed.
pub fn empty_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return ensure_dir(path);
    }
    for entry in fs::read_dir(path)
        .with_context(|| format!("Failed to read directory: {}", path.display()))?
    {
        let entry = entry?;
        let entry_path = entry.path();
        // file_type() reports the symlink itself, not its target.
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&entry_path)
                .with_context(|| format!("Failed to remove: {}", entry_path.display()))?;
        } else {
            fs::remove_file(&entry_path)
                .with_context(|| format!("Failed to remove: {}", entry_path.display()))?;
        }
    }
    Ok(())
}

/// Create a directory symlink at `link` pointing to `target`, replacing any
/// existing entry at `link`.
pub fn relink_dir(target: &Path, link: &Path) -> Result<()> {
    ensure_parent_dir(link)?;
    if link.symlink_metadata().is_ok() {
        if link.symlink_metadata()?.file_type().is_dir() {
            fs::remove_dir_all(link)?;
        } else {
            fs::remove_file(link)?;
        }
    }
    symlink::symlink_dir(target, link).with_context(|| {
        format!("Failed to link {} -> {}", link.display(), target.display())
    })
}
