//! Updater error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for updater operations.
pub type UpdaterResult<T> = Result<T, UpdaterError>;

/// Why a download was refused with HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The site used up its downloads for this plugin.
    SiteLimit,
    /// The access token used up its downloads.
    TokenLimit,
    /// Any other reason reported by the server (raw header value).
    Unknown(String),
}

impl BlockReason {
    /// Classify the `x-mrs-block-reason` header value.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Self::Unknown("download limit reached".to_string());
        };

        let lower = raw.to_lowercase();
        if lower.contains("plugin/site") || lower.contains("site limit") {
            Self::SiteLimit
        } else if lower.contains("token") {
            Self::TokenLimit
        } else {
            Self::Unknown(raw.to_string())
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SiteLimit => write!(
                f,
                "this site has reached the download limit for this plugin; contact the repository administrator"
            ),
            Self::TokenLimit => write!(
                f,
                "the access token has reached its download limit; contact the repository administrator"
            ),
            Self::Unknown(reason) => write!(f, "download limit reached: {reason}"),
        }
    }
}

/// Errors that can occur while fetching, installing or restoring packages.
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// Missing or invalid repository URL, bad parameters, bad settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure or timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with something other than 200.
    #[error("Request to {url} failed with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },

    /// The server refused the download with HTTP 429.
    #[error("Download limit exceeded: {reason}")]
    DownloadLimitExceeded { reason: BlockReason },

    /// Response body is not valid JSON.
    #[error("Could not decode JSON: {0}")]
    Json(String),

    /// JSON is valid but matches neither accepted manifest shape.
    #[error("Invalid manifest format: {0}")]
    DataFormat(String),

    /// A filesystem operation failed.
    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Archive could not be read, written or has an unexpected layout.
    #[error("Archive error: {0}")]
    Archive(String),

    /// The requested backup archive does not exist.
    #[error("Backup not found: {0}")]
    BackupNotFound(PathBuf),

    /// The plugin file is not present in the plugins directory.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Another operation currently holds the lease for this package.
    #[error("Package '{slug}' is busy with another operation; try again shortly")]
    Busy { slug: String },

    /// A step failed after the plugin had been deactivated.
    #[error("{source} (plugin '{plugin}' was left deactivated and must be reactivated manually)")]
    LeftDeactivated {
        plugin: String,
        #[source]
        source: Box<UpdaterError>,
    },
}

impl UpdaterError {
    /// Build a filesystem error with context.
    pub fn fs(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem { context: context.into(), source }
    }

    /// Stable machine-readable code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Network(_) => "api_error",
            Self::HttpStatus { .. } => "http_status",
            Self::DownloadLimitExceeded { .. } => "download_limit_exceeded",
            Self::Json(_) => "json_error",
            Self::DataFormat(_) => "data_format_error",
            Self::Filesystem { .. } => "filesystem_error",
            Self::Archive(_) => "archive_error",
            Self::BackupNotFound(_) => "backup_not_found",
            Self::PluginNotFound(_) => "plugin_not_found",
            Self::Busy { .. } => "busy",
            Self::LeftDeactivated { .. } => "left_deactivated",
        }
    }

    /// Whether retrying later could succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Network(_))
    }
}
