//! Per-package leases.
//!
//! Install, update and restore of the same package must not overlap, even
//! across processes (a cron run racing a manual update). Each package slug
//! maps to an exclusive `flock`-style lock file; acquisition never waits.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::plugin::{UpdaterError, UpdaterResult};

/// Hands out leases keyed by package slug.
#[derive(Debug, Clone)]
pub struct PackageLocks {
    dir: PathBuf,
}

/// Held lease; released on drop.
#[derive(Debug)]
pub struct PackageLease {
    slug: String,
    file: File,
}

impl PackageLease {
    /// Slug this lease covers.
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl Drop for PackageLease {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(slug = %self.slug, error = %e, "Failed to release package lease");
        }
    }
}

impl PackageLocks {
    /// Locks live as `<dir>/<slug>.lock`.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Directory holding lock files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the lease for `slug`, failing with [`UpdaterError::Busy`] if held.
    pub fn acquire(&self, slug: &str) -> UpdaterResult<PackageLease> {
        if slug.is_empty() || slug.contains(['/', '\\']) || slug.starts_with('.') {
            return Err(UpdaterError::Config(format!("Invalid package slug '{slug}'")));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            UpdaterError::fs(format!("Failed to create lock directory {}", self.dir.display()), e)
        })?;

        let path = self.dir.join(format!("{slug}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| UpdaterError::fs(format!("Failed to open lock {}", path.display()), e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(slug, "Package lease acquired");
                Ok(PackageLease { slug: slug.to_string(), file })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                tracing::warn!(slug, "Package is busy");
                Err(UpdaterError::Busy { slug: slug.to_string() })
            }
            Err(e) => Err(UpdaterError::fs(format!("Failed to lock {}", path.display()), e)),
        }
    }
}
