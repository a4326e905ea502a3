//! Pre-update snapshots with single-version retention.
//!
//! Archives live at `<backups_dir>/<slug>/<slug>-<version>-<unix_ts>.zip`
//! and contain the package folder itself (`<slug>/...`), so restoring is a
//! plain extraction. After every successful snapshot all other archives for
//! the slug are removed: only the version that preceded the latest update
//! is kept.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

use super::{archive, fs_ops, UpdaterError, UpdaterResult};
use crate::core::PackageLocks;

/// One backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Archive file name.
    pub archive_file: String,
    /// Full path of the archive.
    pub path: PathBuf,
    /// Package slug (folder name).
    pub package_slug: String,
    /// Version that was backed up.
    pub version: String,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// Archive size in bytes.
    pub size_bytes: u64,
}

/// Creates, lists and restores package backups.
pub struct BackupManager {
    backups_dir: PathBuf,
    plugins_dir: PathBuf,
    temp_dir: PathBuf,
    locks: PackageLocks,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl BackupManager {
    /// Create a backup manager.
    pub fn new(backups_dir: PathBuf, plugins_dir: PathBuf, temp_dir: PathBuf, locks: PackageLocks) -> Self {
        Self {
            backups_dir,
            plugins_dir,
            temp_dir,
            locks,
            clock: Arc::new(|| Utc::now().timestamp()),
        }
    }

    /// Override the timestamp source.
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Root directory for all backups.
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    fn slug_dir(&self, slug: &str) -> UpdaterResult<PathBuf> {
        validate_slug(slug)?;
        Ok(self.backups_dir.join(slug))
    }

    /// Snapshot `package_dir` as `version`.
    ///
    /// Returns `Ok(None)` without doing anything for single-file packages
    /// living directly in the plugins root, or if the directory is gone.
    /// The caller is expected to hold the package lease.
    pub fn create_backup(&self, package_dir: &Path, version: &str) -> UpdaterResult<Option<BackupRecord>> {
        if package_dir == self.plugins_dir || package_dir.parent() != Some(self.plugins_dir.as_path()) {
            tracing::info!(path = ?package_dir, "Skipping backup for package outside a plugin folder");
            return Ok(None);
        }
        if !package_dir.is_dir() {
            tracing::warn!(path = ?package_dir, "Package directory missing, nothing to back up");
            return Ok(None);
        }

        let slug = package_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UpdaterError::Config(format!("{} has no name", package_dir.display())))?;
        let slug_dir = self.slug_dir(&slug)?;
        std::fs::create_dir_all(&slug_dir)
            .map_err(|e| UpdaterError::fs(format!("Failed to create {}", slug_dir.display()), e))?;

        let version = sanitize_version(version);
        let timestamp = (self.clock)();
        let archive_file = format!("{slug}-{version}-{timestamp}.zip");
        let archive_path = slug_dir.join(&archive_file);

        // Write under a non-.zip name so listing never sees a partial archive.
        let partial = tempfile::Builder::new()
            .prefix(".backup-")
            .suffix(".partial")
            .tempfile_in(&slug_dir)
            .map_err(|e| UpdaterError::fs("Failed to create temporary backup file", e))?;
        let size_bytes = archive::create_from_dir(package_dir, partial.path())?;
        partial.persist(&archive_path).map_err(|e| {
            UpdaterError::fs(format!("Failed to finalize {}", archive_path.display()), e.error)
        })?;

        tracing::info!(slug = %slug, version = %version, file = %archive_file, "Backup created");
        self.prune(&slug_dir, &archive_file)?;

        Ok(Some(BackupRecord {
            archive_file,
            path: archive_path,
            package_slug: slug,
            version,
            created_at: Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now),
            size_bytes,
        }))
    }

    /// Delete every `.zip` in `slug_dir` except `keep`.
    fn prune(&self, slug_dir: &Path, keep: &str) -> UpdaterResult<()> {
        for path in zip_files(slug_dir)? {
            if path.file_name().is_some_and(|n| n == keep) {
                continue;
            }
            std::fs::remove_file(&path)
                .map_err(|e| UpdaterError::fs(format!("Failed to delete old backup {}", path.display()), e))?;
            tracing::debug!(path = ?path, "Old backup removed");
        }
        Ok(())
    }

    /// Backups for `slug`, newest first. Unparseable file names are skipped.
    pub fn get_backups(&self, slug: &str) -> UpdaterResult<Vec<BackupRecord>> {
        let slug_dir = self.slug_dir(slug)?;
        if !slug_dir.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = Regex::new(&format!(r"^{}-(.+)-(\d+)\.zip$", regex::escape(slug)))
            .map_err(|e| UpdaterError::Config(e.to_string()))?;

        let mut backups: Vec<BackupRecord> = zip_files(&slug_dir)?
            .into_iter()
            .filter_map(|path| {
                let archive_file = path.file_name()?.to_string_lossy().into_owned();
                let caps = pattern.captures(&archive_file)?;
                let version = caps.get(1)?.as_str().to_string();
                let timestamp: i64 = caps.get(2)?.as_str().parse().ok()?;
                let created_at = Utc.timestamp_opt(timestamp, 0).single()?;
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

                Some(BackupRecord {
                    archive_file,
                    path,
                    package_slug: slug.to_string(),
                    version,
                    created_at,
                    size_bytes,
                })
            })
            .collect();

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Whether any backup archive exists for `slug`.
    pub fn has_backup(&self, slug: &str) -> bool {
        self.slug_dir(slug).ok().and_then(|dir| zip_files(&dir).ok()).is_some_and(|f| !f.is_empty())
    }

    /// Replace the live `plugins/<slug>` directory with the contents of a backup.
    pub fn restore_backup(&self, slug: &str, archive_file: &str) -> UpdaterResult<()> {
        let slug_dir = self.slug_dir(slug)?;
        if archive_file.is_empty() || archive_file.contains(['/', '\\']) || archive_file.starts_with('.') {
            return Err(UpdaterError::Config(format!("Invalid backup file name '{archive_file}'")));
        }

        let archive_path = slug_dir.join(archive_file);
        if !archive_path.is_file() {
            return Err(UpdaterError::BackupNotFound(archive_path));
        }

        let _lease = self.locks.acquire(slug)?;
        tracing::info!(slug, file = archive_file, "Restoring backup");

        let extract_dir = tempfile::Builder::new()
            .prefix("mrp_restore_")
            .tempdir_in(&self.temp_dir)
            .map_err(|e| UpdaterError::fs(format!("Failed to create temp dir in {}", self.temp_dir.display()), e))?;

        archive::extract(&archive_path, extract_dir.path())?;
        let source = archive::single_top_level_dir(extract_dir.path())?;

        let target = self.plugins_dir.join(slug);
        fs_ops::replace_dir(&source, &target)?;

        tracing::info!(slug, "Backup restored");
        Ok(())
    }

    /// Remove every backup for `slug`.
    pub fn delete_backups(&self, slug: &str) -> UpdaterResult<()> {
        fs_ops::remove_dir_if_exists(&self.slug_dir(slug)?)
    }
}

fn zip_files(dir: &Path) -> UpdaterResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(UpdaterError::fs(format!("Failed to list {}", dir.display()), e)),
    };

    Ok(entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "zip"))
        .collect())
}

fn validate_slug(slug: &str) -> UpdaterResult<()> {
    if slug.is_empty() || slug.contains(['/', '\\']) || slug.starts_with('.') {
        return Err(UpdaterError::Config(format!("Invalid package slug '{slug}'")));
    }
    Ok(())
}

fn sanitize_version(version: &str) -> String {
    let cleaned: String = version
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
