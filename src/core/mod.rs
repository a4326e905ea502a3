//! Core infrastructure.
//!
//! This module holds everything the pipeline is wired with: configuration,
//! the key-value store, the manifest cache, per-package leases, the
//! application context and the dispatch table.

mod cache;
mod config;
mod context;
mod dispatch;
mod lock;
mod store;

pub use cache::{fingerprint, ApiCache, CacheEntry, CacheInfo, Clock, CACHE_PREFIX, DEFAULT_TTL_SECS};
pub use config::{
    CacheConfig, Config, GeneralConfig, NetworkConfig, PathsConfig, Settings, LOCAL_CONFIG_FILE,
};
pub use context::{
    AppContext, PlanReport, RepositoryCacheInfo, ScanReport, UPDATE_COUNT_KEY, UPDATE_COUNT_TTL_SECS,
};
pub use dispatch::{envelope, Handler, Router};
pub use lock::{PackageLease, PackageLocks};
pub use store::{FileStore, KvStore, MemoryStore};
