//! Filesystem side of the engine: the storage directory holding finished packages.

use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, trace, warn};

use crate::util::has_package_extension;

/// Creates `dir` and its parents if missing
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
        debug!(path = ?dir, "Created directory");
    }
    Ok(())
}

/// Moves a finished payload to its destination, replacing any existing file.
///
/// Uses a plain rename when possible. Across filesystems the payload is first
/// copied next to the destination and then renamed, so `dest` never holds a
/// partially written file.
pub async fn move_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    debug!(from = ?src, to = ?dest, "Moving payload into storage");

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::try_exists(dest).await? {
        trace!(path = ?dest, "Removing existing file at destination");
        tokio::fs::remove_file(dest).await?;
    }

    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            trace!(error = %e, "Rename crosses filesystems, copying instead");
            copy_into_place(src, dest).await
        }
        Err(e) => Err(e),
    }
}

/// Copies `src` into a temporary file beside `dest`, renames it over `dest`
/// and removes `src`. The staged copy is deleted if any step fails.
pub async fn copy_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let staged = tempfile::Builder::new()
        .prefix(".incoming-")
        .tempfile_in(parent)?
        .into_temp_path();
    tokio::fs::copy(src, &staged).await?;
    staged.persist(dest).map_err(|e| e.error)?;

    if let Err(e) = tokio::fs::remove_file(src).await {
        warn!(path = ?src, error = %e, "Failed to remove source after copy");
    }

    debug!(from = ?src, to = ?dest, "Payload copied across filesystems");
    Ok(())
}

/// Lists package files directly inside `dir` with their sizes, sorted by name
pub fn scan_packages(dir: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut packages = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if !metadata.is_file() {
            continue;
        }
        if !path.to_str().is_some_and(has_package_extension) {
            trace!(path = ?path, "Skipping non-package file");
            continue;
        }

        packages.push((path, metadata.len()));
    }

    packages.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(packages)
}

/// Picks the first free variant of `filename` in `dir`: `app.ipa`,
/// `app (1).ipa`, `app (2).ipa`, ...
pub fn free_destination(dir: &Path, filename: &str, is_taken: impl Fn(&Path) -> bool) -> PathBuf {
    let candidate = dir.join(filename);
    if !is_taken(&candidate) {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){extension}")))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or(candidate)
}
