//! Repository manifest schema.
//!
//! A repository endpoint answers with either an object
//! `{ "plugins": [...], "token_name": "..." }` or a bare array of plugin
//! items. Each item looks like:
//!
//! ```json
//! {
//!   "slug": "acme-seo",
//!   "title": { "rendered": "Acme SEO" },
//!   "meta": { "mtf_versao": "1.3.0", "mtf_url": "https://...", "author_name": "Acme" },
//!   "visibility": "public",
//!   "user_has_access": true,
//!   "download_limits": { "site_used": 1, "site_limit": 5, "can_download": true },
//!   "token_expires_at": "2026-12-31"
//! }
//! ```
//!
//! Items without a non-empty title, slug and version are skipped.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{UpdaterError, UpdaterResult};

/// Header carrying the token expiry when no item reports it.
pub const TOKEN_EXPIRES_HEADER: &str = "x-mrp-token-expires";

/// A configured remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Manifest endpoint URL.
    pub url: String,

    /// Access token sent as `client_token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl RepositoryConfig {
    /// Create a repository config.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self { url: url.into(), token: token.filter(|t| !t.trim().is_empty()) }
    }
}

/// Who may see a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Restricted,
    Private,
}

impl Visibility {
    /// Parse a wire value; unknown or missing values are private.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("public" | "publico" | "público") => Self::Public,
            Some("restricted" | "restrito") => Self::Restricted,
            _ => Self::Private,
        }
    }
}

/// Download quota reported by the repository.
///
/// Counters may arrive as numbers or numeric strings; unreadable values are
/// treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLimits {
    #[serde(default, alias = "plugin_site_used", deserialize_with = "loose_u64")]
    pub site_used: Option<u64>,
    #[serde(default, alias = "plugin_site_limit", deserialize_with = "loose_u64")]
    pub site_limit: Option<u64>,
    #[serde(default, deserialize_with = "loose_u64")]
    pub token_used: Option<u64>,
    #[serde(default, deserialize_with = "loose_u64")]
    pub token_limit: Option<u64>,
    #[serde(default = "default_true", deserialize_with = "loose_flag")]
    pub can_download: bool,
}

fn default_true() -> bool {
    true
}

/// One available package, as reported by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifestEntry {
    pub slug: String,
    pub name: String,
    pub version: String,
    pub download_url: String,
    pub author_name: String,
    pub author_url: String,
    pub visibility: Visibility,
    pub user_has_access: bool,
    pub download_limits: Option<DownloadLimits>,
    pub source_repo_url: String,
}

impl PluginManifestEntry {
    /// `false` only when the repository explicitly reports the quota as exhausted.
    pub fn can_download(&self) -> bool {
        self.download_limits.as_ref().map_or(true, |l| l.can_download)
    }
}

/// Parsed manifest of one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Entries keyed by slug.
    pub plugins: BTreeMap<String, PluginManifestEntry>,
    /// Display name of the access token, if the server reports one.
    #[serde(default)]
    pub token_name: String,
    /// Token expiration, verbatim from the server.
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMeta {
    #[serde(default, deserialize_with = "string_or_number")]
    mtf_versao: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    mtf_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    author_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    author_url: Option<String>,
}

/// One manifest item. Only `slug`, `title` and `meta.mtf_versao` are
/// required; every other field falls back to its default when missing or
/// malformed, so a loosely typed backend never hides a package.
#[derive(Debug, Deserialize)]
struct WireItem {
    #[serde(default, deserialize_with = "string_or_number")]
    slug: Option<String>,
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    meta: Option<Value>,
    #[serde(default)]
    download_limits: Option<Value>,
    #[serde(default)]
    visibility: Option<Value>,
    #[serde(default)]
    user_has_access: Option<Value>,
    #[serde(default, deserialize_with = "string_or_number")]
    token_expires_at: Option<String>,
}

impl WireItem {
    /// `title.rendered`, or a plain string title.
    fn title(&self) -> Option<String> {
        match &self.title {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(obj)) => obj.get("rendered").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }

    fn meta(&self, repo_url: &str) -> WireMeta {
        match &self.meta {
            Some(value @ Value::Object(_)) => WireMeta::deserialize(value).unwrap_or_else(|e| {
                tracing::debug!(repo = repo_url, error = %e, "Ignoring malformed item meta");
                WireMeta::default()
            }),
            _ => WireMeta::default(),
        }
    }

    /// Absent means access; otherwise the value's truthiness decides.
    fn user_has_access(&self) -> bool {
        self.user_has_access.as_ref().map_or(true, |v| v.is_null() || truthy(v))
    }

    /// Limits are only read from an object; PHP backends send `[]` for "none".
    fn download_limits(&self, repo_url: &str) -> Option<DownloadLimits> {
        match &self.download_limits {
            Some(value @ Value::Object(_)) => match DownloadLimits::deserialize(value) {
                Ok(limits) => Some(limits),
                Err(e) => {
                    tracing::debug!(repo = repo_url, error = %e, "Ignoring malformed download limits");
                    None
                }
            },
            _ => None,
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !matches!(s.trim(), "" | "0" | "false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn loose_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn loose_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map_or(true, |v| v.is_null() || truthy(&v)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a manifest body.
///
/// `header_expires_at` is the value of [`TOKEN_EXPIRES_HEADER`], used when no
/// item carries `token_expires_at`.
pub fn parse_manifest(
    body: &[u8],
    repo_url: &str,
    header_expires_at: Option<&str>,
) -> UpdaterResult<ScanResult> {
    let data: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| UpdaterError::Json(e.to_string()))?;

    let (items, token_name) = match data {
        serde_json::Value::Object(mut obj) => match obj.remove("plugins") {
            Some(serde_json::Value::Array(items)) => {
                let token_name = obj
                    .get("token_name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (items, token_name)
            }
            _ => {
                return Err(UpdaterError::DataFormat(
                    "expected an object with a 'plugins' array or a bare array".to_string(),
                ))
            }
        },
        serde_json::Value::Array(items) => (items, String::new()),
        _ => {
            return Err(UpdaterError::DataFormat(
                "expected an object with a 'plugins' array or a bare array".to_string(),
            ))
        }
    };

    let mut result = ScanResult { token_name, ..ScanResult::default() };
    let mut body_expires_at: Option<String> = None;

    for raw in items {
        let item: WireItem = match serde_json::from_value(raw) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(repo = repo_url, error = %e, "Skipping malformed manifest item");
                continue;
            }
        };

        if body_expires_at.is_none() {
            body_expires_at = non_empty(item.token_expires_at.clone());
        }

        let meta = item.meta(repo_url);
        let name = non_empty(item.title());
        let slug = non_empty(item.slug.clone());
        let version = non_empty(meta.mtf_versao);

        let (Some(name), Some(slug), Some(version)) = (name, slug, version) else {
            tracing::debug!(repo = repo_url, "Skipping manifest item without title, slug or version");
            continue;
        };

        let entry = PluginManifestEntry {
            slug: slug.clone(),
            name,
            version,
            download_url: meta.mtf_url.unwrap_or_default(),
            author_name: meta.author_name.unwrap_or_default(),
            author_url: meta.author_url.unwrap_or_default(),
            visibility: Visibility::from_wire(item.visibility.as_ref().and_then(Value::as_str)),
            user_has_access: item.user_has_access(),
            download_limits: item.download_limits(repo_url),
            source_repo_url: repo_url.to_string(),
        };
        result.plugins.insert(slug, entry);
    }

    result.expires_at =
        body_expires_at.or_else(|| non_empty(header_expires_at.map(str::to_string)));

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "https://repo.example.com/wp-json/mrp/v1/plugins";

    #[test]
    fn test_parse_object_shape() {
        let body = br#"{
            "token_name": "Agency token",
            "plugins": [
                {
                    "slug": "acme-seo",
                    "title": {"rendered": "Acme SEO"},
                    "meta": {"mtf_versao": "1.3.0", "mtf_url": "https://repo.example.com/dl/acme-seo.zip", "author_name": "Acme"},
                    "visibility": "public",
                    "token_expires_at": "2026-12-31"
                }
            ]
        }"#;

        let result = parse_manifest(body, REPO, None).unwrap();
        assert_eq!(result.token_name, "Agency token");
        assert_eq!(result.expires_at.as_deref(), Some("2026-12-31"));

        let entry = &result.plugins["acme-seo"];
        assert_eq!(entry.name, "Acme SEO");
        assert_eq!(entry.version, "1.3.0");
        assert_eq!(entry.visibility, Visibility::Public);
        assert!(entry.user_has_access);
        assert_eq!(entry.source_repo_url, REPO);
    }

    #[test]
    fn test_parse_bare_array_with_numeric_version() {
        let body = br#"[{"slug": "widget-pro", "title": {"rendered": "Widget Pro"}, "meta": {"mtf_versao": 2}}]"#;
        let result = parse_manifest(body, REPO, Some("1767139200")).unwrap();

        assert_eq!(result.plugins["widget-pro"].version, "2");
        assert_eq!(result.plugins["widget-pro"].visibility, Visibility::Private);
        assert_eq!(result.expires_at.as_deref(), Some("1767139200"));
        assert!(result.token_name.is_empty());
    }

    #[test]
    fn test_items_missing_required_fields_are_skipped() {
        let body = br#"[
            {"slug": "no-title", "meta": {"mtf_versao": "1.0"}},
            {"title": {"rendered": "No Slug"}, "meta": {"mtf_versao": "1.0"}},
            {"slug": "no-version", "title": {"rendered": "No Version"}},
            {"slug": "", "title": {"rendered": "Empty"}, "meta": {"mtf_versao": "1.0"}},
            {"slug": 42},
            {"slug": "ok", "title": {"rendered": "Ok"}, "meta": {"mtf_versao": "1.0"}}
        ]"#;

        let result = parse_manifest(body, REPO, None).unwrap();
        assert_eq!(result.plugins.len(), 1);
        assert!(result.plugins.contains_key("ok"));
    }

    #[test]
    fn test_invalid_json_is_json_error() {
        let err = parse_manifest(b"<html>oops</html>", REPO, None).unwrap_err();
        assert!(matches!(err, UpdaterError::Json(_)));
    }

    #[test]
    fn test_unexpected_shape_is_data_format_error() {
        let err = parse_manifest(br#"{"items": []}"#, REPO, None).unwrap_err();
        assert!(matches!(err, UpdaterError::DataFormat(_)));

        let err = parse_manifest(b"\"just a string\"", REPO, None).unwrap_err();
        assert!(matches!(err, UpdaterError::DataFormat(_)));
    }

    #[test]
    fn test_access_and_limits() {
        let body = br#"[{
            "slug": "locked", "title": {"rendered": "Locked"}, "meta": {"mtf_versao": "1.0"},
            "user_has_access": false, "visibility": "restrito",
            "download_limits": {"site_used": 5, "site_limit": 5, "can_download": false}
        }]"#;

        let entry = &parse_manifest(body, REPO, None).unwrap().plugins["locked"];
        assert!(!entry.user_has_access);
        assert_eq!(entry.visibility, Visibility::Restricted);
        assert!(!entry.can_download());
        assert_eq!(entry.download_limits.as_ref().unwrap().site_limit, Some(5));
    }

    #[test]
    fn test_loosely_typed_optional_fields_keep_the_item() {
        let body = br#"[
            {"slug": "string-limits", "title": {"rendered": "A"}, "meta": {"mtf_versao": "1.0"},
             "download_limits": {"site_used": "3", "site_limit": "5", "can_download": "1"}},
            {"slug": "numeric-access", "title": {"rendered": "B"}, "meta": {"mtf_versao": "1.0"}, "user_has_access": 1},
            {"slug": "empty-limits", "title": {"rendered": "C"}, "meta": {"mtf_versao": "1.0"}, "download_limits": []},
            {"slug": "numeric-visibility", "title": {"rendered": "D"}, "meta": {"mtf_versao": "1.0"}, "visibility": 0},
            {"slug": "odd-meta", "title": {"rendered": "E"}, "meta": {"mtf_versao": "1.0", "mtf_url": false, "author_name": 7}}
        ]"#;

        let result = parse_manifest(body, REPO, None).unwrap();
        assert_eq!(result.plugins.len(), 5);

        let limits = result.plugins["string-limits"].download_limits.as_ref().unwrap();
        assert_eq!(limits.site_used, Some(3));
        assert_eq!(limits.site_limit, Some(5));
        assert!(limits.can_download);

        assert!(result.plugins["numeric-access"].user_has_access);
        assert!(result.plugins["empty-limits"].download_limits.is_none());
        assert_eq!(result.plugins["numeric-visibility"].visibility, Visibility::Private);
        assert_eq!(result.plugins["odd-meta"].download_url, "");
        assert_eq!(result.plugins["odd-meta"].author_name, "7");
    }

    #[test]
    fn test_plugin_prefixed_quota_keys() {
        let body = br#"[{
            "slug": "quota", "title": {"rendered": "Quota"}, "meta": {"mtf_versao": "1.0"},
            "download_limits": {"plugin_site_used": 2, "plugin_site_limit": "2", "token_used": 9,
                                "token_limit": 10, "can_download": 0}
        }]"#;

        let entry = &parse_manifest(body, REPO, None).unwrap().plugins["quota"];
        let limits = entry.download_limits.as_ref().unwrap();
        assert_eq!(limits.site_used, Some(2));
        assert_eq!(limits.site_limit, Some(2));
        assert_eq!(limits.token_used, Some(9));
        assert_eq!(limits.token_limit, Some(10));
        assert!(!entry.can_download());
    }

    #[test]
    fn test_falsy_access_values_deny_access() {
        let body = br#"[
            {"slug": "zero", "title": {"rendered": "Zero"}, "meta": {"mtf_versao": "1.0"}, "user_has_access": 0},
            {"slug": "null", "title": {"rendered": "Null"}, "meta": {"mtf_versao": "1.0"}, "user_has_access": null}
        ]"#;

        let result = parse_manifest(body, REPO, None).unwrap();
        assert!(!result.plugins["zero"].user_has_access);
        assert!(result.plugins["null"].user_has_access);
    }

    #[test]
    fn test_repository_config_drops_blank_token() {
        let repo = RepositoryConfig::new("https://x", Some("  ".to_string()));
        assert!(repo.token.is_none());
    }
}
