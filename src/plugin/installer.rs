//! Package download, validation and live-directory swap.
//!
//! An update walks through
//!
//! ```text
//! Idle -> Downloading -> Validating -> BackingUp -> Deactivating -> Extracting
//!      -> Swapping -> Reactivating -> Done
//! ```
//!
//! with `Failed` reachable from every step. Fresh installs skip backup,
//! deactivation and reactivation. Deactivation happens only after the
//! archive is downloaded, validated and backed up, so network and quota
//! failures never touch the running plugin. A failure after deactivation
//! leaves the plugin deactivated and the error says so.
//!
//! The downloaded file and the extraction directory are `tempfile` guards and
//! are removed on every exit path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::backup::{BackupManager, BackupRecord};
use super::error::BlockReason;
use super::host::{InstalledPluginRecord, PluginHost};
use super::http::HttpClient;
use super::{archive, fs_ops, UpdaterError, UpdaterResult};
use crate::core::{PackageLease, PackageLocks};

/// Default timeout for package downloads.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Header explaining a 429 refusal.
pub const BLOCK_REASON_HEADER: &str = "x-mrs-block-reason";

/// Installer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Idle,
    Downloading,
    Validating,
    BackingUp,
    Deactivating,
    Extracting,
    Swapping,
    Reactivating,
    Done,
    Failed(String),
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Downloading => write!(f, "downloading"),
            Self::Validating => write!(f, "validating"),
            Self::BackingUp => write!(f, "backing up"),
            Self::Deactivating => write!(f, "deactivating"),
            Self::Extracting => write!(f, "extracting"),
            Self::Swapping => write!(f, "swapping"),
            Self::Reactivating => write!(f, "reactivating"),
            Self::Done => write!(f, "done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Callback invoked on every state change.
pub type StateObserver = Arc<dyn Fn(&InstallState) + Send + Sync>;

/// Result of a successful install or update.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    /// Folder the package was installed into.
    pub folder: String,
    /// Main plugin file after the swap, if one was found.
    pub plugin_file: Option<String>,
    /// Version installed before the update.
    pub previous_version: Option<String>,
    /// Backup taken before the swap.
    pub backup: Option<BackupRecord>,
    /// Whether the plugin was reactivated.
    pub reactivated: bool,
    /// States visited, in order.
    pub trail: Vec<InstallState>,
}

/// Drives one package through the install state machine.
pub struct PackageInstaller {
    http: Arc<dyn HttpClient>,
    host: Arc<dyn PluginHost>,
    backups: Arc<BackupManager>,
    locks: PackageLocks,
    temp_dir: PathBuf,
    timeout: Duration,
    observer: Option<StateObserver>,
}

/// State bookkeeping for one run.
struct Run {
    trail: Vec<InstallState>,
    observer: Option<StateObserver>,
    label: String,
}

impl Run {
    fn enter(&mut self, state: InstallState) {
        tracing::info!(package = %self.label, state = %state, "Installer state");
        if let Some(observer) = &self.observer {
            observer(&state);
        }
        self.trail.push(state);
    }

    fn fail(&mut self, error: &UpdaterError) {
        tracing::error!(package = %self.label, error = %error, kind = error.kind(), "Install failed");
        let state = InstallState::Failed(error.to_string());
        if let Some(observer) = &self.observer {
            observer(&state);
        }
        self.trail.push(state);
    }
}

impl PackageInstaller {
    /// Create an installer. Temporary files go to `temp_dir`.
    pub fn new(
        http: Arc<dyn HttpClient>,
        host: Arc<dyn PluginHost>,
        backups: Arc<BackupManager>,
        locks: PackageLocks,
        temp_dir: PathBuf,
    ) -> Self {
        Self { http, host, backups, locks, temp_dir, timeout: DEFAULT_DOWNLOAD_TIMEOUT, observer: None }
    }

    /// Override the download timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Receive every state change.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Install or update a package.
    ///
    /// `installed_path` is the main file of the plugin being updated
    /// (`acme-seo/acme-seo.php`); pass an empty string for a fresh install.
    pub fn update_package(&self, installed_path: &str, package_url: &str) -> UpdaterResult<InstallOutcome> {
        let label = if installed_path.trim().is_empty() { package_url } else { installed_path };
        let mut run = Run { trail: vec![InstallState::Idle], observer: self.observer.clone(), label: label.to_string() };

        let result = self.run(&mut run, installed_path.trim(), package_url.trim());
        if let Err(e) = &result {
            run.fail(e);
        }
        result
    }

    fn run(&self, run: &mut Run, installed_path: &str, package_url: &str) -> UpdaterResult<InstallOutcome> {
        if package_url.is_empty() {
            return Err(UpdaterError::Config("package URL is empty".to_string()));
        }

        let existing = if installed_path.is_empty() {
            None
        } else {
            let record = self
                .host
                .installed_plugins()?
                .into_iter()
                .find(|r| r.path == installed_path)
                .ok_or_else(|| UpdaterError::PluginNotFound(installed_path.to_string()))?;
            Some(record)
        };

        run.enter(InstallState::Downloading);
        let download = self.download(package_url)?;

        run.enter(InstallState::Validating);
        validate_download(download.path())?;

        let mut leases = Vec::new();
        let mut backup = None;
        let mut was_active = false;

        if let Some(record) = &existing {
            leases.push(self.locks.acquire(&lock_key(record))?);

            run.enter(InstallState::BackingUp);
            match record.folder() {
                Some(folder) => {
                    backup = self.backups.create_backup(&self.host.plugins_dir().join(folder), &record.version)?;
                }
                None => tracing::info!(plugin = %record.path, "Single-file plugin, skipping backup"),
            }

            was_active = self.host.is_active(&record.path);
            if was_active {
                run.enter(InstallState::Deactivating);
                self.host.deactivate(&record.path)?;
            }
        }

        let deactivated = existing.as_ref().filter(|_| was_active).map(|r| r.path.clone());
        let wrap = |e: UpdaterError| match &deactivated {
            Some(plugin) => UpdaterError::LeftDeactivated { plugin: plugin.clone(), source: Box::new(e) },
            None => e,
        };

        let folder = self.extract_and_swap(run, download.path(), &mut leases).map_err(wrap)?;
        drop(download);

        let mut reactivated = false;
        let plugin_file = if was_active {
            run.enter(InstallState::Reactivating);
            let file = self
                .main_file(&folder, existing.as_ref())
                .and_then(|file| file.ok_or_else(|| UpdaterError::PluginNotFound(format!("{folder}/"))))
                .map_err(wrap)?;
            self.host.activate(&file).map_err(wrap)?;
            reactivated = true;
            Some(file)
        } else {
            self.main_file(&folder, existing.as_ref())?
        };

        drop(leases);
        run.enter(InstallState::Done);
        tracing::info!(folder = %folder, reactivated, "Package installed");

        Ok(InstallOutcome {
            folder,
            plugin_file,
            previous_version: existing.map(|r| r.version),
            backup,
            reactivated,
            trail: std::mem::take(&mut run.trail),
        })
    }

    fn download(&self, url: &str) -> UpdaterResult<tempfile::NamedTempFile> {
        if !self.temp_dir.is_dir() {
            return Err(UpdaterError::fs(
                format!("Temporary directory {} is not available", self.temp_dir.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "missing temp directory"),
            ));
        }

        let response = self.http.get(url, self.timeout)?;
        if response.status == 429 {
            let reason = BlockReason::from_header(response.header(BLOCK_REASON_HEADER));
            tracing::warn!(url, reason = %reason, "Download refused by repository");
            return Err(UpdaterError::DownloadLimitExceeded { reason });
        }
        if response.status != 200 {
            return Err(UpdaterError::HttpStatus { url: url.to_string(), status: response.status });
        }

        let mut file = tempfile::Builder::new()
            .prefix("mrp-download-")
            .suffix(".zip")
            .tempfile_in(&self.temp_dir)
            .map_err(|e| UpdaterError::fs(format!("Failed to create download file in {}", self.temp_dir.display()), e))?;
        file.write_all(&response.body).map_err(|e| UpdaterError::fs("Failed to write downloaded package", e))?;
        file.flush().map_err(|e| UpdaterError::fs("Failed to write downloaded package", e))?;

        tracing::debug!(url, bytes = response.body.len(), path = ?file.path(), "Package downloaded");
        Ok(file)
    }

    fn extract_and_swap(
        &self,
        run: &mut Run,
        archive_path: &Path,
        leases: &mut Vec<PackageLease>,
    ) -> UpdaterResult<String> {
        run.enter(InstallState::Extracting);
        let extract_dir = tempfile::Builder::new()
            .prefix("mrp_unzip_")
            .tempdir_in(&self.temp_dir)
            .map_err(|e| UpdaterError::fs(format!("Failed to create extraction dir in {}", self.temp_dir.display()), e))?;

        archive::extract(archive_path, extract_dir.path())?;
        let source = archive::single_top_level_dir(extract_dir.path())?;
        let folder = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UpdaterError::Archive("top-level folder has no name".to_string()))?;

        run.enter(InstallState::Swapping);
        if !leases.iter().any(|lease| lease.slug() == folder) {
            leases.push(self.locks.acquire(&folder)?);
        }
        fs_ops::replace_dir(&source, &self.host.plugins_dir().join(&folder))?;

        Ok(folder)
    }

    /// Main plugin file inside `folder`, preferring the file that was active before.
    fn main_file(&self, folder: &str, previous: Option<&InstalledPluginRecord>) -> UpdaterResult<Option<String>> {
        let candidates: Vec<InstalledPluginRecord> = self
            .host
            .installed_plugins()?
            .into_iter()
            .filter(|r| r.folder() == Some(folder))
            .collect();

        let same_path = previous.and_then(|p| candidates.iter().find(|r| r.path == p.path));
        let same_name = previous.and_then(|p| {
            let name = p.path.rsplit('/').next().unwrap_or(&p.path);
            candidates.iter().find(|r| r.path.rsplit('/').next() == Some(name))
        });

        Ok(same_path.or(same_name).or_else(|| candidates.first()).map(|r| r.path.clone()))
    }
}

/// Lease key for an installed plugin: its folder, or the file stem for
/// single-file plugins.
fn lock_key(record: &InstalledPluginRecord) -> String {
    match record.folder() {
        Some(folder) => folder.to_string(),
        None => Path::new(&record.path)
            .file_stem()
            .map_or_else(|| record.path.clone(), |s| s.to_string_lossy().into_owned()),
    }
}

fn validate_download(path: &Path) -> UpdaterResult<()> {
    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| UpdaterError::fs(format!("Downloaded file {} is missing", path.display()), e))?;
    if !meta.is_file() {
        return Err(UpdaterError::fs(
            format!("Downloaded path {} is not a regular file", path.display()),
            std::io::Error::other("not a regular file"),
        ));
    }
    if meta.len() == 0 {
        return Err(UpdaterError::Archive("downloaded package is empty".to_string()));
    }
    if !archive::has_zip_magic(path)? {
        tracing::warn!(path = ?path, "Downloaded file does not start with a zip signature, trying anyway");
    }
    Ok(())
}
