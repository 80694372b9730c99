//! Versioned page cache.
//!
//! Responses are stored under a key that embeds a hash of every content
//! version the page depends on, so invalidation is a counter bump in the
//! ledger rather than a delete:
//!
//! - **Details**: app, user, and page records projected from the ledger and
//!   table declarations, kept warm in the store.
//! - **Content**: the rendered responses themselves.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! key_prefix = "site"
//! secret_key = "..."
//! default_ttl_secs = 3600
//!
//! [cache.tables.orders]
//! depends = ["customers"]
//! ```

pub mod clear;
mod config;
pub mod content;
pub mod deps;
pub mod details;
mod error;
pub mod keys;
pub mod ledger;
mod lock;
mod memcached;
mod middleware;
pub mod render;
mod store;
pub mod version;

pub use clear::clear_cache;
pub use config::{ActionConfig, CacheConfig, TableConfig};
pub use content::{CachedPage, ContentStore, PageWrite, WriteOutcome};
pub use deps::{CacheTrackingPolicy, DependencyProvider, DependencyResolver, StaticCatalog};
pub use details::{AppDetails, DetailsCache, PageDetails, UserDetails};
pub use error::CacheError;
pub use ledger::{ContentVersionLedger, MemoryLedger, UpdateCommand, UpdateLedger, VersionRow};
pub use memcached::MemcachedStore;
pub use middleware::{
    CacheState, X_CACHE, X_CACHE_DEBUG_REASON, X_CACHE_VERSION_STRING, response_cache_layer,
};
pub use render::{RenderRecord, RenderScope};
pub use store::{CacheStore, MemoryStore, StoreFlags, StoreHandle};
