//! Repository manifest fetching and multi-repository merge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::http::HttpClient;
use super::manifest::{parse_manifest, PluginManifestEntry, RepositoryConfig, ScanResult, TOKEN_EXPIRES_HEADER};
use super::version::is_newer;
use super::{UpdaterError, UpdaterResult};
use crate::core::ApiCache;

/// A repository that could not be scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryError {
    pub url: String,
    pub kind: &'static str,
    pub message: String,
}

/// Default timeout for manifest requests.
pub const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(25);

/// Fetches manifests through the API cache.
pub struct ManifestFetcher {
    http: Arc<dyn HttpClient>,
    cache: Arc<ApiCache>,
    site_url: String,
    timeout: Duration,
}

impl ManifestFetcher {
    /// Create a fetcher identifying itself as `site_url`.
    pub fn new(http: Arc<dyn HttpClient>, cache: Arc<ApiCache>, site_url: impl Into<String>) -> Self {
        Self { http, cache, site_url: site_url.into(), timeout: DEFAULT_MANIFEST_TIMEOUT }
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cache key for a repository; distinct URLs or tokens never collide.
    pub fn cache_key(repo: &RepositoryConfig) -> String {
        format!("plugins_list_{}{}", repo.url, repo.token.as_deref().unwrap_or_default())
    }

    /// Build the manifest request URL.
    pub fn request_url(&self, repo: &RepositoryConfig) -> UpdaterResult<String> {
        let base = repo.url.trim();
        if base.is_empty() {
            return Err(UpdaterError::Config("repository URL is empty".to_string()));
        }

        let mut params = vec![("requesting_site_url", self.site_url.as_str())];
        if let Some(token) = repo.token.as_deref().filter(|t| !t.is_empty()) {
            params.push(("client_token", token));
        }

        let url = reqwest::Url::parse_with_params(base, &params)
            .map_err(|e| UpdaterError::Config(format!("invalid repository URL '{base}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UpdaterError::Config(format!("unsupported URL scheme in '{base}'")));
        }

        Ok(url.into())
    }

    /// Fetch and parse one repository's manifest, using the cache unless
    /// `force_refresh` is set.
    pub fn scan_for_plugins(&self, repo: &RepositoryConfig, force_refresh: bool) -> UpdaterResult<ScanResult> {
        let url = self.request_url(repo)?;
        let key = Self::cache_key(repo);

        self.cache.get_or_fetch(
            &key,
            || {
                tracing::info!(repo = %repo.url, "Fetching repository manifest");
                let response = self.http.get(&url, self.timeout)?;
                if response.status != 200 {
                    return Err(UpdaterError::HttpStatus { url: repo.url.clone(), status: response.status });
                }

                let result = parse_manifest(&response.body, &repo.url, response.header(TOKEN_EXPIRES_HEADER))?;
                tracing::info!(repo = %repo.url, plugins = result.plugins.len(), "Manifest parsed");
                Ok(result)
            },
            force_refresh,
        )
    }

    /// Scan every repository and merge the successful results.
    ///
    /// A failing repository is logged and reported; it does not stop the others.
    pub fn scan_all(
        &self,
        repos: &[RepositoryConfig],
        force_refresh: bool,
    ) -> (BTreeMap<String, PluginManifestEntry>, Vec<RepositoryError>) {
        let mut results = Vec::with_capacity(repos.len());
        let mut errors = Vec::new();

        for repo in repos {
            match self.scan_for_plugins(repo, force_refresh) {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(repo = %repo.url, error = %e, "Repository scan failed");
                    errors.push(RepositoryError { url: repo.url.clone(), kind: e.kind(), message: e.to_string() });
                }
            }
        }

        (merge_manifests(results), errors)
    }
}

/// Merge manifests by slug. A strictly newer version replaces an existing
/// entry; ties keep the entry seen first.
pub fn merge_manifests<I>(results: I) -> BTreeMap<String, PluginManifestEntry>
where
    I: IntoIterator<Item = ScanResult>,
{
    let mut merged: BTreeMap<String, PluginManifestEntry> = BTreeMap::new();

    for result in results {
        for (slug, entry) in result.plugins {
            match merged.get(&slug) {
                Some(existing) if !is_newer(&entry.version, &existing.version) => {
                    tracing::debug!(slug = %slug, kept = %existing.version, ignored = %entry.version, "Duplicate slug");
                }
                _ => {
                    merged.insert(slug, entry);
                }
            }
        }
    }

    merged
}
