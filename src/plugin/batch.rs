//! Unattended update runs.
//!
//! One plugin's failure is recorded and the run moves on to the next.

use serde::Serialize;

use super::fetcher::{ManifestFetcher, RepositoryError};
use super::host::PluginHost;
use super::installer::PackageInstaller;
use super::manifest::RepositoryConfig;
use super::resolver::resolve;

/// One plugin handled by a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub slug: String,
    pub plugin_file: String,
    pub from_version: String,
    pub to_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Summary of an automatic update run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// `false` when automatic updates are switched off and nothing ran.
    pub enabled: bool,
    pub updated: Vec<BatchItem>,
    pub skipped: Vec<BatchItem>,
    pub failed: Vec<BatchItem>,
    pub repository_errors: Vec<RepositoryError>,
}

impl BatchReport {
    /// A report for a disabled run.
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Update every installed plugin with a newer version available.
///
/// Manifests are always fetched fresh. Candidates whose download quota is
/// exhausted are skipped.
pub fn run_automatic_updates(
    repos: &[RepositoryConfig],
    fetcher: &ManifestFetcher,
    host: &dyn PluginHost,
    installer: &PackageInstaller,
) -> BatchReport {
    let mut report = BatchReport { enabled: true, ..BatchReport::default() };

    let (manifest, repository_errors) = fetcher.scan_all(repos, true);
    report.repository_errors = repository_errors;

    let installed = match host.installed_plugins() {
        Ok(installed) => installed,
        Err(e) => {
            tracing::error!(error = %e, "Could not list installed plugins");
            return report;
        }
    };

    let plan = resolve(&manifest, &installed);
    tracing::info!(candidates = plan.updates.len(), "Automatic update run");

    for candidate in plan.updates {
        let mut item = BatchItem {
            slug: candidate.entry.slug.clone(),
            plugin_file: candidate.installed.path.clone(),
            from_version: candidate.installed.version.clone(),
            to_version: candidate.entry.version.clone(),
            message: None,
        };

        if !candidate.entry.can_download() {
            tracing::info!(slug = %item.slug, "Download quota exhausted, skipping");
            item.message = Some("download limit reached".to_string());
            report.skipped.push(item);
            continue;
        }

        match installer.update_package(&candidate.installed.path, &candidate.entry.download_url) {
            Ok(_) => {
                tracing::info!(slug = %item.slug, version = %item.to_version, "Updated");
                report.updated.push(item);
            }
            Err(e) => {
                tracing::warn!(slug = %item.slug, error = %e, "Automatic update failed, continuing");
                item.message = Some(e.to_string());
                report.failed.push(item);
            }
        }
    }

    report
}
