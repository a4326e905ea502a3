//! Directory copy and replace-by-rename.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{UpdaterError, UpdaterResult};

/// Recursively copy the contents of `src` into `dst` (created if missing).
pub fn copy_dir(src: &Path, dst: &Path) -> UpdaterResult<()> {
    std::fs::create_dir_all(dst)
        .map_err(|e| UpdaterError::fs(format!("Failed to create {}", dst.display()), e))?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| {
            UpdaterError::fs(
                format!("Failed to walk {}", src.display()),
                e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")),
            )
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| UpdaterError::fs(format!("Failed to create {}", target.display()), e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                UpdaterError::fs(format!("Failed to copy {}", entry.path().display()), e)
            })?;
        }
    }

    Ok(())
}

/// Replace `target` with a copy of `source`.
///
/// The copy lands in a hidden staging directory next to `target` first, so a
/// failed copy never touches the live directory. The live directory is then
/// renamed aside, the staged copy renamed into place, and the old tree
/// deleted. If the final rename fails the old tree is put back.
pub fn replace_dir(source: &Path, target: &Path) -> UpdaterResult<()> {
    replace_dir_with(source, target, |from, to| std::fs::rename(from, to))
}

fn replace_dir_with<R>(source: &Path, target: &Path, rename: R) -> UpdaterResult<()>
where
    R: Fn(&Path, &Path) -> std::io::Result<()>,
{
    let parent = target
        .parent()
        .ok_or_else(|| UpdaterError::Config(format!("{} has no parent", target.display())))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| UpdaterError::Config(format!("{} has no name", target.display())))?;

    let staging = tempfile::Builder::new()
        .prefix(&format!(".{name}.incoming-"))
        .tempdir_in(parent)
        .map_err(|e| UpdaterError::fs(format!("Failed to create staging dir in {}", parent.display()), e))?;

    copy_dir(source, staging.path())?;

    let retired = if target.exists() {
        let retired = retired_path(parent, &name);
        rename(target, retired.as_path()).map_err(|e| {
            UpdaterError::fs(format!("Failed to move aside {}", target.display()), e)
        })?;
        Some(retired)
    } else {
        None
    };

    if let Err(e) = rename(staging.path(), target) {
        if let Some(ref retired) = retired {
            if let Err(restore) = rename(retired.as_path(), target) {
                tracing::error!(
                    path = ?target,
                    retired = ?retired,
                    error = %restore,
                    "Failed to put previous version back"
                );
            }
        }
        return Err(UpdaterError::fs(format!("Failed to move new version into {}", target.display()), e));
    }

    if let Some(retired) = retired {
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            tracing::warn!(path = ?retired, error = %e, "Failed to delete retired directory");
        }
    }

    Ok(())
}

/// Remove a directory tree if present.
pub fn remove_dir_if_exists(path: &Path) -> UpdaterResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdaterError::fs(format!("Failed to delete {}", path.display()), e)),
    }
}

fn retired_path(parent: &Path, name: &str) -> PathBuf {
    parent.join(format!(".{name}.retired-{}", uuid::Uuid::new_v4().simple()))
}
