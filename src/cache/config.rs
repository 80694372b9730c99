//! Cache configuration.
//!
//! One `CacheConfig` is built at startup and handed to the middleware state;
//! nothing in the engine reads configuration from anywhere else.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_SECRET_KEY: &str = "change-me";
const DEFAULT_ENVIRONMENT: &str = "+user=&lang=en";
const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_COOKIE_NAME: &str = "PAGECACHE_ENV";
const DEFAULT_COOKIE_PATH: &str = "/";
const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_PAGE_DETAILS_TTL_SECS: u64 = 3600;
const DEFAULT_MAX_ENTRY_BYTES: usize = 1_000_000;
const DEFAULT_TABLE_PARAM: &str = "-table";
const DEFAULT_ACTION_PARAM: &str = "-action";

/// Per-table cache declarations.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableConfig {
    /// Tables whose changes also invalidate pages built on this table.
    pub depends: Vec<String>,
    /// Overrides the global `track_used_tables` for pages on this table.
    pub track_used_tables: Option<bool>,
}

/// Per-action cache declarations.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActionConfig {
    /// Replaces the page's primary table as the dependency seed set.
    pub depends: Option<Vec<String>>,
    /// Overrides table and global `track_used_tables` for this action.
    pub track_used_tables: Option<bool>,
}

/// Runtime cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; when off the middleware is a pass-through.
    pub enabled: bool,
    /// Serve hits but never flush (no cookie, no ledger commit, no writes).
    pub read_only: bool,
    /// Prefix for every key written to the store.
    pub key_prefix: String,
    /// Append the request `Host` to the prefix.
    pub prefix_with_host: bool,
    /// Secret used to key the environment hash.
    pub secret_key: String,
    /// Environment string used when the client sends no cookie.
    pub default_environment: String,
    /// Language used when the render collaborator reports none.
    pub default_language: String,
    pub cookie_name: String,
    pub cookie_path: String,
    /// Content entry TTL unless the render collaborator overrides it.
    pub default_ttl_secs: u64,
    pub page_details_ttl_secs: u64,
    /// 0 means no expiry.
    pub app_details_ttl_secs: u64,
    /// 0 means no expiry.
    pub user_details_ttl_secs: u64,
    /// Largest encoded content entry (headers + body) that will be stored.
    pub max_entry_bytes: usize,
    /// Query parameters excluded from the page id.
    pub ignored_params: Vec<String>,
    /// Query parameters that, when non-empty, bypass caching.
    pub bypass_params: Vec<String>,
    /// Action names that are never cached.
    pub bypass_actions: Vec<String>,
    /// Query parameter naming the page's primary table.
    pub table_param: String,
    /// Query parameter naming the page's action.
    pub action_param: String,
    /// Global default for merging render-time table usage into page details.
    pub track_used_tables: bool,
    /// Application-level override of `track_used_tables`.
    pub app_track_used_tables: Option<bool>,
    /// Honor `Cache-Control` on write and read.
    pub respect_cache_control: bool,
    /// Honor `Expires` on write and read.
    pub respect_expires: bool,
    /// Emit reason and version-string diagnostics headers.
    pub debug_headers: bool,
    /// File holding the content epoch marker.
    pub version_file: Option<PathBuf>,
    pub tables: BTreeMap<String, TableConfig>,
    pub actions: BTreeMap<String, ActionConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_only: false,
            key_prefix: String::new(),
            prefix_with_host: true,
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            default_environment: DEFAULT_ENVIRONMENT.to_string(),
            default_language: DEFAULT_LANGUAGE.to_string(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_path: DEFAULT_COOKIE_PATH.to_string(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            page_details_ttl_secs: DEFAULT_PAGE_DETAILS_TTL_SECS,
            app_details_ttl_secs: 0,
            user_details_ttl_secs: 0,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            ignored_params: vec!["--referrer".to_string(), "--referer".to_string()],
            bypass_params: vec!["--msg".to_string()],
            bypass_actions: vec!["js".to_string(), "css".to_string()],
            table_param: DEFAULT_TABLE_PARAM.to_string(),
            action_param: DEFAULT_ACTION_PARAM.to_string(),
            track_used_tables: true,
            app_track_used_tables: None,
            respect_cache_control: false,
            respect_expires: false,
            debug_headers: false,
            version_file: None,
            tables: BTreeMap::new(),
            actions: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// Cookie path normalized to end with `/`.
    pub fn cookie_path(&self) -> String {
        let mut path = if self.cookie_path.is_empty() {
            "/".to_string()
        } else {
            self.cookie_path.clone()
        };
        if !path.ends_with('/') {
            path.push('/');
        }
        path
    }

    /// Effective key prefix for a request addressed to `host`.
    pub fn prefix_for_host(&self, host: Option<&str>) -> String {
        match host.filter(|h| self.prefix_with_host && !h.is_empty()) {
            Some(host) if self.key_prefix.is_empty() => host.to_string(),
            Some(host) => format!("{}@{host}", self.key_prefix),
            None => self.key_prefix.clone(),
        }
    }

    pub fn is_bypass_action(&self, action: &str) -> bool {
        self.bypass_actions.iter().any(|a| a == action)
    }
}
