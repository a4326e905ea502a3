//! Configuration management.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::{RepositoryConfig, UpdaterError, UpdaterResult};

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = ".plugin-repo.toml";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Manifest cache settings
    pub cache: CacheConfig,

    /// Timeouts and user agent
    pub network: NetworkConfig,

    /// Where plugins, backups and state live
    pub paths: PathsConfig,

    /// Connected repositories
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    /// File this configuration was loaded from
    #[serde(skip)]
    source: Option<PathBuf>,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// URL this installation identifies itself with (`requesting_site_url`)
    pub site_url: String,

    /// Whether `auto-update` runs install anything
    pub auto_update_enabled: bool,
}

/// Manifest cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds a manifest stays fresh; 0 disables serving from cache
    pub ttl_seconds: u64,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout for manifest requests
    pub manifest_timeout_secs: u64,

    /// Timeout for package downloads
    pub download_timeout_secs: u64,

    /// User agent override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Filesystem locations. `~` is expanded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backups_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
}

/// The user-editable subset written by `save_settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub repositories: Vec<RepositoryConfig>,
    pub auto_update_enabled: bool,
    pub cache_ttl_seconds: u64,
}

impl Config {
    /// Load configuration.
    ///
    /// Looks for config in:
    /// 1. `explicit`, if given (must exist)
    /// 2. `.plugin-repo.toml` in current directory
    /// 3. `~/.config/plugin-repo/config.toml`
    /// 4. Falls back to defaults
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match Self::lookup_path(explicit) {
            Some(path) if explicit.is_some() || path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// File `load` reads: the explicit path, `./.plugin-repo.toml` if present,
    /// else the global config file (which may not exist yet).
    pub fn lookup_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            return Some(local_config);
        }

        Self::global_config_path()
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let mut config: Self = toml::from_str(&content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save to the file this config came from, or the global config file.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = match &self.source {
            Some(path) => path.clone(),
            None => Self::global_config_path()
                .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        tracing::info!(path = ?path, "Configuration saved");
        Ok(path)
    }

    /// Copy safe to print: repository tokens are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for repo in &mut config.repositories {
            repo.token = repo.token.as_deref().map(mask_token);
        }
        config
    }

    /// File this configuration was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Set the file `save` writes to.
    pub fn set_source(&mut self, path: PathBuf) {
        self.source = Some(path);
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("plugin-repo"))
    }

    /// Get the data directory path (plugins, backups, state).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("plugin-repo"))
    }

    fn global_config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }

    /// Reject repositories with empty or unparseable URLs.
    pub fn validate(&self) -> UpdaterResult<()> {
        for (index, repo) in self.repositories.iter().enumerate() {
            let url = repo.url.trim();
            if url.is_empty() {
                return Err(UpdaterError::Config(format!("repository #{} has an empty URL", index + 1)));
            }
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| UpdaterError::Config(format!("repository URL '{url}' is invalid: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(UpdaterError::Config(format!("repository URL '{url}' must use http or https")));
            }
        }
        Ok(())
    }

    /// The user-editable settings.
    pub fn settings(&self) -> Settings {
        Settings {
            repositories: self.repositories.clone(),
            auto_update_enabled: self.general.auto_update_enabled,
            cache_ttl_seconds: self.cache.ttl_seconds,
        }
    }

    /// Replace the user-editable settings wholesale. Blank repository rows are dropped.
    pub fn apply_settings(&mut self, settings: Settings) -> UpdaterResult<()> {
        let mut next = self.clone();
        next.repositories = settings
            .repositories
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .map(|r| RepositoryConfig::new(r.url.trim(), r.token.map(|t| t.trim().to_string())))
            .collect();
        next.general.auto_update_enabled = settings.auto_update_enabled;
        next.cache.ttl_seconds = settings.cache_ttl_seconds;
        next.validate()?;

        *self = next;
        Ok(())
    }

    fn data_subdir(name: &str) -> PathBuf {
        Self::data_dir().unwrap_or_else(|| PathBuf::from(".plugin-repo")).join(name)
    }

    /// Live plugin installation directory.
    pub fn plugins_dir(&self) -> PathBuf {
        self.paths.plugins_dir.as_deref().map_or_else(|| Self::data_subdir("plugins"), expand)
    }

    /// Backup archive root.
    pub fn backups_dir(&self) -> PathBuf {
        self.paths.backups_dir.as_deref().map_or_else(|| Self::data_subdir("backups"), expand)
    }

    /// Cache store, activation state and lock files.
    pub fn state_dir(&self) -> PathBuf {
        self.paths.state_dir.as_deref().map_or_else(|| Self::data_subdir("state"), expand)
    }

    /// Scratch space for downloads and extraction.
    pub fn temp_dir(&self) -> PathBuf {
        self.paths.temp_dir.as_deref().map_or_else(std::env::temp_dir, expand)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.network.manifest_timeout_secs.max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.network.download_timeout_secs.max(1))
    }

    /// User agent sent with every request.
    pub fn user_agent(&self) -> String {
        self.network.user_agent.clone().unwrap_or_else(|| {
            format!("plugin-repo/{}; {}", env!("CARGO_PKG_VERSION"), self.general.site_url)
        })
    }
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { site_url: "http://localhost".to_string(), auto_update_enabled: false }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: super::cache::DEFAULT_TTL_SECS }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { manifest_timeout_secs: 25, download_timeout_secs: 300, user_agent: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.general.auto_update_enabled);
        assert_eq!(config.cache.ttl_seconds, 3600);
        assert_eq!(config.manifest_timeout(), Duration::from_secs(25));
        assert_eq!(config.download_timeout(), Duration::from_secs(300));
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn test_redacted_masks_tokens() {
        let mut config = Config::default();
        config.repositories = vec![
            RepositoryConfig::new("https://a.example/api", Some("abcdefghijkl1234".to_string())),
            RepositoryConfig::new("https://b.example/api", Some("short".to_string())),
            RepositoryConfig::new("https://c.example/api", None),
        ];

        let shown = config.redacted();
        assert_eq!(shown.repositories[0].token.as_deref(), Some("****1234"));
        assert_eq!(shown.repositories[1].token.as_deref(), Some("****"));
        assert_eq!(shown.repositories[2].token, None);
        assert_eq!(config.repositories[0].token.as_deref(), Some("abcdefghijkl1234"));

        let printed = toml::to_string_pretty(&shown).unwrap();
        assert!(!printed.contains("abcdefghijkl"));
    }

    #[test]
    fn test_lookup_path_prefers_explicit() {
        let explicit = Path::new("/etc/plugin-repo/custom.toml");
        assert_eq!(Config::lookup_path(Some(explicit)).as_deref(), Some(explicit));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[cache]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            site_url = "https://shop.example"
            auto_update_enabled = true

            [cache]
            ttl_seconds = 0

            [paths]
            plugins_dir = "/srv/wp/plugins"

            [[repositories]]
            url = "https://repo.example/api"
            token = "secret"

            [[repositories]]
            url = "https://other.example/api"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.general.auto_update_enabled);
        assert_eq!(config.cache.ttl_seconds, 0);
        assert_eq!(config.plugins_dir(), PathBuf::from("/srv/wp/plugins"));
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.repositories[0].token.as_deref(), Some("secret"));
        assert_eq!(config.repositories[1].token, None);
        assert!(config.user_agent().ends_with("; https://shop.example"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let mut config = Config::default();
        config.repositories.push(RepositoryConfig::new("not a url", None));
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));

        config.repositories = vec![RepositoryConfig::new("", None)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_settings_replaces_wholesale() {
        let mut config = Config::default();
        config.repositories.push(RepositoryConfig::new("https://old.example/api", None));

        config
            .apply_settings(Settings {
                repositories: vec![
                    RepositoryConfig::new(" https://new.example/api ", Some(" tok ".to_string())),
                    RepositoryConfig::new("  ", None),
                ],
                auto_update_enabled: true,
                cache_ttl_seconds: 60,
            })
            .unwrap();

        assert_eq!(config.repositories, vec![RepositoryConfig::new("https://new.example/api", Some("tok".to_string()))]);
        assert!(config.general.auto_update_enabled);
        assert_eq!(config.cache.ttl_seconds, 60);

        let rejected = config.apply_settings(Settings {
            repositories: vec![RepositoryConfig::new("ftp://x", None)],
            auto_update_enabled: false,
            cache_ttl_seconds: 1,
        });
        assert!(rejected.is_err());
        assert_eq!(config.cache.ttl_seconds, 60);
    }

    #[test]
    fn test_save_round_trips_to_source() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.set_source(path.clone());
        config.repositories.push(RepositoryConfig::new("https://repo.example/api", None));
        assert_eq!(config.save().unwrap(), path);

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.repositories, config.repositories);
        assert_eq!(loaded.source(), Some(path.as_path()));
    }
}
