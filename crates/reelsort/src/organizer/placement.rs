//! Destination resolution and the physical move.

use std::path::{Path, PathBuf};

use crate::config::CollisionPolicy;
use crate::error::StorageError;

const MAX_NUMBERED_NAMES: u32 = 10_000;

/// Where a file will go and how the slot was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub destination: PathBuf,
    /// An existing file in the catch-all folder will be replaced.
    pub overwrite: bool,
    /// The requested name was taken and a numbered one was chosen.
    pub renamed: bool,
}

fn exists(path: &Path) -> bool {
    // symlink_metadata also sees broken symlinks
    std::fs::symlink_metadata(path).is_ok()
}

/// Resolves `relative` under `library` against what is already on disk.
///
/// Inside `catch_all` an existing file is overwritten. Elsewhere the
/// collision policy decides between `name_1.ext`, `name_2.ext`, ... and
/// refusing the move.
pub fn plan_destination(
    library: &Path,
    catch_all: Option<&Path>,
    relative: &Path,
    policy: CollisionPolicy,
) -> Result<PlannedMove, StorageError> {
    let destination = library.join(relative);
    if destination == library {
        return Err(StorageError::InvalidDestination(
            relative.display().to_string(),
        ));
    }

    if !exists(&destination) {
        return Ok(PlannedMove {
            destination,
            overwrite: false,
            renamed: false,
        });
    }

    if catch_all.is_some_and(|dir| destination.starts_with(dir)) {
        return Ok(PlannedMove {
            destination,
            overwrite: true,
            renamed: false,
        });
    }

    match policy {
        CollisionPolicy::Fail => Err(StorageError::FileExists(destination)),
        CollisionPolicy::Rename => {
            let destination = numbered_alternative(&destination)?;
            Ok(PlannedMove {
                destination,
                overwrite: false,
                renamed: true,
            })
        }
    }
}

/// First free `stem_N.ext` next to `taken`, starting at 1.
fn numbered_alternative(taken: &Path) -> Result<PathBuf, StorageError> {
    let directory = taken.parent().unwrap_or_else(|| Path::new(""));
    let stem = taken
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = taken
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for counter in 1..=MAX_NUMBERED_NAMES {
        let candidate = directory.join(format!("{}_{}{}", stem, counter, ext));
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }

    Err(StorageError::FileExists(taken.to_path_buf()))
}

pub fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Moves `src` to `dst`: `rename` when both live on one file system,
/// copy then remove otherwise.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if !exists(src) {
        return Err(StorageError::SourceMissing(src.to_path_buf()));
    }

    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let move_error = |source| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };
    std::fs::copy(src, dst).map_err(move_error)?;
    std::fs::remove_file(src).map_err(move_error)?;
    Ok(())
}

/// Carries out a planned move, replacing the destination when allowed.
pub fn execute(source: &Path, planned: &PlannedMove) -> Result<(), StorageError> {
    if let Some(parent) = planned.destination.parent() {
        ensure_directory(parent)?;
    }

    if planned.overwrite && exists(&planned.destination) {
        std::fs::remove_file(&planned.destination).map_err(|e| StorageError::RemoveFile {
            path: planned.destination.clone(),
            source: e,
        })?;
    }

    move_file(source, &planned.destination)
}
