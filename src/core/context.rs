//! Explicit application context.
//!
//! Everything a request handler needs is built once here and passed down;
//! there is no global instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::cache::{ApiCache, CacheInfo};
use super::config::{Config, Settings};
use super::lock::PackageLocks;
use super::store::{FileStore, KvStore};
use crate::plugin::{
    resolve, run_automatic_updates, BackupManager, BackupRecord, BatchReport, DirectoryHost,
    HttpClient, InstallOutcome, ManifestFetcher, PackageInstaller, PluginHost, PluginManifestEntry,
    RepositoryConfig, RepositoryError, ReqwestClient, UpdatePlan, UpdaterError, UpdaterResult,
};

/// Store key of the cached pending-update count.
pub const UPDATE_COUNT_KEY: &str = "mrp_update_count";

/// How long the pending-update count is reused.
pub const UPDATE_COUNT_TTL_SECS: i64 = 3600;

/// Merged manifest of every configured repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub plugins: BTreeMap<String, PluginManifestEntry>,
    pub repository_errors: Vec<RepositoryError>,
}

/// Update plan plus the repositories that could not be scanned.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
    pub plan: UpdatePlan,
    pub repository_errors: Vec<RepositoryError>,
}

/// Cache state of one repository.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryCacheInfo {
    pub url: String,
    #[serde(flatten)]
    pub info: CacheInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedCount {
    count: usize,
    stored_at: i64,
}

/// Application context shared by every operation.
pub struct AppContext {
    config: RwLock<Config>,
    store: Arc<dyn KvStore>,
    cache: Arc<ApiCache>,
    fetcher: ManifestFetcher,
    host: Arc<dyn PluginHost>,
    backups: Arc<BackupManager>,
    installer: PackageInstaller,
}

impl AppContext {
    /// Build the production context: file-backed store, reqwest transport
    /// and a directory host.
    ///
    /// Repository URLs are not checked here; a malformed one is reported by
    /// the fetcher as that repository's error, so local operations such as
    /// restoring a backup keep working.
    pub fn from_config(mut config: Config) -> anyhow::Result<Self> {
        if config.source().is_none() {
            if let Some(dir) = Config::config_dir() {
                config.set_source(dir.join("config.toml"));
            }
        }

        for dir in [config.plugins_dir(), config.backups_dir(), config.state_dir(), config.temp_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", dir.display()))?;
        }

        let state_dir = config.state_dir();
        let store: Arc<dyn KvStore> = Arc::new(FileStore::new(state_dir.join("store.json"))?);
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(&config.user_agent())?);
        let host: Arc<dyn PluginHost> = Arc::new(DirectoryHost::new(config.plugins_dir(), &state_dir)?);

        Ok(Self::with_parts(config, http, store, host))
    }

    /// Assemble a context from explicit collaborators.
    pub fn with_parts(
        config: Config,
        http: Arc<dyn HttpClient>,
        store: Arc<dyn KvStore>,
        host: Arc<dyn PluginHost>,
    ) -> Self {
        let cache = Arc::new(ApiCache::new(store.clone(), config.cache.ttl_seconds));
        let locks = PackageLocks::new(config.state_dir().join("locks"));
        let backups = Arc::new(BackupManager::new(
            config.backups_dir(),
            host.plugins_dir().to_path_buf(),
            config.temp_dir(),
            locks.clone(),
        ));

        let fetcher = ManifestFetcher::new(http.clone(), cache.clone(), config.general.site_url.clone())
            .with_timeout(config.manifest_timeout());
        let installer = PackageInstaller::new(http, host.clone(), backups.clone(), locks, config.temp_dir())
            .with_timeout(config.download_timeout());

        Self { config: RwLock::new(config), store, cache, fetcher, host, backups, installer }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn repositories(&self) -> Vec<RepositoryConfig> {
        self.config.read().repositories.clone()
    }

    pub fn host(&self) -> &dyn PluginHost {
        self.host.as_ref()
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Scan and merge every configured repository.
    pub fn scan(&self, force_refresh: bool) -> ScanReport {
        let (plugins, repository_errors) = self.fetcher.scan_all(&self.repositories(), force_refresh);
        ScanReport { plugins, repository_errors }
    }

    /// Resolve the merged manifest against the installed plugins.
    pub fn plan(&self, force_refresh: bool) -> UpdaterResult<PlanReport> {
        let scan = self.scan(force_refresh);
        let installed = self.host.installed_plugins()?;
        Ok(PlanReport { plan: resolve(&scan.plugins, &installed), repository_errors: scan.repository_errors })
    }

    /// Update an installed plugin to the version offered by its repository.
    pub fn update_plugin(&self, plugin_file: &str) -> UpdaterResult<InstallOutcome> {
        let plan = self.plan(false)?.plan;
        let candidate = plan
            .updates
            .iter()
            .find(|c| c.installed.path == plugin_file)
            .ok_or_else(|| UpdaterError::PluginNotFound(format!("no update available for {plugin_file}")))?;

        let outcome = self.installer.update_package(plugin_file, &candidate.entry.download_url)?;
        self.refresh_after_install();
        Ok(outcome)
    }

    /// Reinstall an installed plugin from its repository even if it is up to date.
    pub fn force_update(&self, plugin_file: &str) -> UpdaterResult<InstallOutcome> {
        let plan = self.plan(true)?.plan;
        let url = plan
            .updates
            .iter()
            .find(|c| c.installed.path == plugin_file)
            .map(|c| c.entry.download_url.clone())
            .or_else(|| {
                plan.up_to_date
                    .iter()
                    .find(|u| u.installed.path == plugin_file)
                    .map(|u| u.entry.download_url.clone())
            })
            .ok_or_else(|| UpdaterError::PluginNotFound(format!("{plugin_file} is not offered by any repository")))?;

        let outcome = self.installer.update_package(plugin_file, &url)?;
        self.refresh_after_install();
        Ok(outcome)
    }

    /// Install a plugin that is not installed yet.
    pub fn install_plugin(&self, slug: &str) -> UpdaterResult<InstallOutcome> {
        let scan = self.scan(false);
        let entry = scan
            .plugins
            .get(slug)
            .filter(|e| e.user_has_access)
            .ok_or_else(|| UpdaterError::PluginNotFound(format!("'{slug}' is not offered by any repository")))?;

        let outcome = self.installer.update_package("", &entry.download_url)?;
        self.refresh_after_install();
        Ok(outcome)
    }

    pub fn activate_plugin(&self, plugin_file: &str) -> UpdaterResult<()> {
        self.host.activate(plugin_file)
    }

    pub fn get_backups(&self, slug: &str) -> UpdaterResult<Vec<BackupRecord>> {
        self.backups.get_backups(slug)
    }

    pub fn has_backup(&self, slug: &str) -> bool {
        self.backups.has_backup(slug)
    }

    /// Restore a backup over the live directory.
    pub fn rollback_plugin(&self, slug: &str, archive_file: &str) -> UpdaterResult<()> {
        self.backups.restore_backup(slug, archive_file)?;
        self.forget_update_count();
        Ok(())
    }

    /// Cache state of every configured repository.
    pub fn cache_info(&self) -> UpdaterResult<Vec<RepositoryCacheInfo>> {
        self.repositories()
            .iter()
            .map(|repo| {
                Ok(RepositoryCacheInfo {
                    url: repo.url.clone(),
                    info: self.cache.cache_info(&ManifestFetcher::cache_key(repo))?,
                })
            })
            .collect()
    }

    /// Drop the cached manifest of repositories matching `url`, or all of them.
    pub fn invalidate_cache(&self, url: Option<&str>) -> UpdaterResult<usize> {
        let mut invalidated = 0;
        for repo in self.repositories().iter().filter(|r| url.map_or(true, |u| r.url == u)) {
            self.cache.invalidate(&ManifestFetcher::cache_key(repo))?;
            invalidated += 1;
        }
        self.forget_update_count();
        Ok(invalidated)
    }

    /// Drop every cache entry and the cached update count.
    pub fn clear_cache(&self) -> UpdaterResult<usize> {
        let removed = self.cache.clear_all()?;
        self.forget_update_count();
        Ok(removed)
    }

    /// Unattended update of every plugin with a newer version.
    pub fn auto_update(&self) -> BatchReport {
        if !self.config.read().general.auto_update_enabled {
            tracing::info!("Automatic updates are disabled");
            return BatchReport::disabled();
        }

        let report = run_automatic_updates(&self.repositories(), &self.fetcher, self.host.as_ref(), &self.installer);
        if !report.updated.is_empty() {
            if let Err(e) = self.clear_cache() {
                tracing::warn!(error = %e, "Failed to clear cache after automatic updates");
            }
        }

        tracing::info!(
            updated = report.updated.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Automatic update run finished"
        );
        report
    }

    /// Number of pending updates, reused for an hour unless `force_refresh`.
    pub fn update_count(&self, force_refresh: bool) -> UpdaterResult<usize> {
        let now = Utc::now().timestamp();

        if !force_refresh {
            let cached = self
                .store
                .get(UPDATE_COUNT_KEY)?
                .and_then(|raw| serde_json::from_value::<CachedCount>(raw).ok())
                .filter(|c| now - c.stored_at <= UPDATE_COUNT_TTL_SECS);
            if let Some(cached) = cached {
                return Ok(cached.count);
            }
        }

        let count = self.plan(force_refresh)?.plan.update_count();
        let raw = serde_json::to_value(CachedCount { count, stored_at: now })
            .map_err(|e| UpdaterError::Json(e.to_string()))?;
        self.store.set(UPDATE_COUNT_KEY, raw)?;
        Ok(count)
    }

    /// A download consumes quota, so cached manifests and the count are stale.
    fn refresh_after_install(&self) {
        if let Err(e) = self.clear_cache() {
            tracing::warn!(error = %e, "Failed to clear cache after install");
        }
    }

    fn forget_update_count(&self) {
        if let Err(e) = self.store.delete(UPDATE_COUNT_KEY) {
            tracing::warn!(error = %e, "Failed to drop cached update count");
        }
    }

    /// Replace the user settings, persist them and drop every cache.
    pub fn save_settings(&self, settings: Settings) -> UpdaterResult<()> {
        let mut config = self.config.write();
        let mut snapshot = config.clone();
        snapshot.apply_settings(settings)?;

        if snapshot.source().is_some() {
            snapshot.save().map_err(|e| UpdaterError::Config(format!("Failed to save settings: {e}")))?;
        }
        *config = snapshot.clone();
        drop(config);

        self.cache.set_ttl(snapshot.cache.ttl_seconds);
        self.clear_cache()?;
        tracing::info!(repositories = snapshot.repositories.len(), "Settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryStore;
    use crate::plugin::HttpResponse;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingHttp {
        body: String,
        calls: Mutex<usize>,
    }

    impl HttpClient for CountingHttp {
        fn get(&self, _url: &str, _timeout: Duration) -> UpdaterResult<HttpResponse> {
            *self.calls.lock() += 1;
            Ok(HttpResponse::new(200, self.body.clone()))
        }
    }

    fn context(temp: &TempDir, http: Arc<CountingHttp>) -> AppContext {
        let mut config = Config::default();
        config.paths.plugins_dir = Some(temp.path().join("plugins").to_string_lossy().into_owned());
        config.paths.backups_dir = Some(temp.path().join("backups").to_string_lossy().into_owned());
        config.paths.state_dir = Some(temp.path().join("state").to_string_lossy().into_owned());
        config.paths.temp_dir = Some(temp.path().join("tmp").to_string_lossy().into_owned());
        config.repositories.push(RepositoryConfig::new("https://repo.example/api", None));

        let host = Arc::new(DirectoryHost::new(config.plugins_dir(), &config.state_dir()).unwrap());
        AppContext::with_parts(config, http, Arc::new(MemoryStore::new()), host)
    }

    const BODY: &str = r#"[{"slug": "acme-seo", "title": {"rendered": "Acme SEO"},
        "meta": {"mtf_versao": "2.0.0", "mtf_url": "https://repo.example/acme.zip"}}]"#;

    #[test]
    fn test_update_count_is_cached_and_invalidated() {
        let temp = TempDir::new().unwrap();
        let http = Arc::new(CountingHttp { body: BODY.to_string(), ..CountingHttp::default() });
        let ctx = context(&temp, http.clone());

        let dir = temp.path().join("plugins/acme-seo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("acme-seo.php"), "<?php\n/* Plugin Name: Acme SEO\n Version: 1.0.0 */").unwrap();

        assert_eq!(ctx.update_count(false).unwrap(), 1);
        assert_eq!(ctx.update_count(false).unwrap(), 1);
        assert_eq!(*http.calls.lock(), 1);

        ctx.clear_cache().unwrap();
        assert_eq!(ctx.update_count(false).unwrap(), 1);
        assert_eq!(*http.calls.lock(), 2);
    }

    #[test]
    fn test_save_settings_replaces_repositories_and_clears_cache() {
        let temp = TempDir::new().unwrap();
        let http = Arc::new(CountingHttp { body: BODY.to_string(), ..CountingHttp::default() });
        let ctx = context(&temp, http.clone());

        ctx.scan(false);
        assert!(ctx.cache_info().unwrap()[0].info.exists);

        ctx.save_settings(Settings {
            repositories: vec![RepositoryConfig::new("https://repo.example/api", None)],
            auto_update_enabled: true,
            cache_ttl_seconds: 120,
        })
        .unwrap();

        let info = ctx.cache_info().unwrap();
        assert!(!info[0].info.exists);
        assert!(ctx.config().general.auto_update_enabled);
        assert_eq!(ctx.cache.ttl(), 120);
    }

    #[test]
    fn test_failed_settings_write_keeps_previous_settings() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let mut config = Config::default();
        config.paths.plugins_dir = Some(temp.path().join("plugins").to_string_lossy().into_owned());
        config.paths.state_dir = Some(temp.path().join("state").to_string_lossy().into_owned());
        config.set_source(blocker.join("config.toml"));
        let host = Arc::new(DirectoryHost::new(config.plugins_dir(), &config.state_dir()).unwrap());
        let http = Arc::new(CountingHttp { body: BODY.to_string(), ..CountingHttp::default() });
        let ctx = AppContext::with_parts(config, http, Arc::new(MemoryStore::new()), host);

        let result = ctx.save_settings(Settings {
            repositories: vec![RepositoryConfig::new("https://repo.example/api", None)],
            auto_update_enabled: true,
            cache_ttl_seconds: 120,
        });

        assert!(matches!(result, Err(UpdaterError::Config(_))));
        let config = ctx.config();
        assert!(!config.general.auto_update_enabled);
        assert!(config.repositories.is_empty());
        assert_eq!(ctx.cache.ttl(), 3600);
    }

    #[test]
    fn test_auto_update_disabled_does_nothing() {
        let temp = TempDir::new().unwrap();
        let http = Arc::new(CountingHttp { body: BODY.to_string(), ..CountingHttp::default() });
        let ctx = context(&temp, http.clone());

        let report = ctx.auto_update();
        assert!(!report.enabled);
        assert_eq!(*http.calls.lock(), 0);
    }
}
