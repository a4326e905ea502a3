//! Package pipeline: fetch, resolve, install, back up.
//!
//! # Architecture
//!
//! ```text
//! ManifestFetcher ──(ApiCache)──> merged manifest
//!        │
//!        v
//! resolve(manifest, installed) ──> UpdatePlan
//!        │
//!        v
//! PackageInstaller ──> BackupManager ──> fs_ops::replace_dir
//! ```
//!
//! Network access goes through [`HttpClient`] and the live installation
//! through [`PluginHost`], so every step can run against fakes.
//!
//! # Example Configuration
//!
//! ```toml
//! [[repositories]]
//! url = "https://repo.example.com/wp-json/mrp/v1/plugins"
//! token = "client-token"
//! ```

mod archive;
mod backup;
mod batch;
mod error;
mod fetcher;
mod fs_ops;
mod host;
mod http;
mod installer;
mod manifest;
mod resolver;
mod version;

pub use backup::{BackupManager, BackupRecord};
pub use batch::{run_automatic_updates, BatchItem, BatchReport};
pub use error::{BlockReason, UpdaterError, UpdaterResult};
pub use fetcher::{merge_manifests, ManifestFetcher, RepositoryError, DEFAULT_MANIFEST_TIMEOUT};
pub use host::{DirectoryHost, InstalledPluginRecord, PluginHost};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use installer::{
    InstallOutcome, InstallState, PackageInstaller, StateObserver, BLOCK_REASON_HEADER,
    DEFAULT_DOWNLOAD_TIMEOUT,
};
pub use manifest::{
    parse_manifest, DownloadLimits, PluginManifestEntry, RepositoryConfig, ScanResult, Visibility,
    TOKEN_EXPIRES_HEADER,
};
pub use resolver::{find_installed, resolve, MatchRule, UpToDate, UpdateCandidate, UpdatePlan};
pub use version::{compare_versions, is_newer};
