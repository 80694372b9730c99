//! App, user, and page details.
//!
//! These are cache-derived projections of the content-version ledger and of
//! page configuration. Any of them may vanish from the store at any moment;
//! a missing or malformed record reads as absent and is rebuilt on the next
//! flush.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

use super::deps::{CacheTrackingPolicy, DependencyProvider, DependencyResolver};
use super::error::CacheError;
use super::keys::{app_details_key, page_details_key, user_details_key};
use super::store::{StoreFlags, StoreHandle};
use super::version;

/// Application-wide versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDetails {
    pub version: i64,
    pub base_version: i64,
    pub table_versions: BTreeMap<String, i64>,
}

/// Versions scoped to one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDetails {
    pub app_version: i64,
    pub table_versions: BTreeMap<String, i64>,
}

/// Tables a page depends on, already expanded through declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDetails {
    pub tables: BTreeSet<String>,
}

/// What the render collaborator knows about the page being built.
#[derive(Debug, Clone, Copy)]
pub struct PageSeed<'a> {
    pub primary_table: Option<&'a str>,
    pub action: Option<&'a str>,
    pub tables_touched: &'a BTreeSet<String>,
}

/// Build page details for a freshly rendered page.
///
/// Tracking precedence, least to most specific: `track_default`, the
/// application, the primary table, the action.
pub fn build_page_details(
    seed: PageSeed<'_>,
    track_default: bool,
    policy: &dyn CacheTrackingPolicy,
    provider: &dyn DependencyProvider,
) -> Result<PageDetails, CacheError> {
    let mut track = track_default;
    if let Some(app) = policy.application() {
        track = app;
    }
    if let Some(table) = seed.primary_table.and_then(|t| policy.table(t)) {
        track = table;
    }
    if let Some(action) = seed.action.and_then(|a| policy.action(a)) {
        track = action;
    }

    let mut roots: BTreeSet<String> = match seed.action.and_then(|a| policy.action_depends(a)) {
        Some(depends) if !depends.is_empty() => depends.into_iter().collect(),
        _ => seed.primary_table.map(str::to_string).into_iter().collect(),
    };
    if track {
        roots.extend(seed.tables_touched.iter().cloned());
    }

    let resolver = DependencyResolver::new(provider);
    let mut tables = BTreeSet::new();
    for table in roots {
        tables.extend(resolver.resolve(&table)?);
        tables.insert(table);
    }
    trace!(track, tables = ?tables, "built page details");
    Ok(PageDetails { tables })
}

/// Read the content epoch marker: the last whitespace-separated token of the
/// file's first line. Missing or unparsable markers read as 0.
pub async fn read_epoch(path: Option<&Path>) -> i64 {
    let Some(path) = path else {
        return 0;
    };
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_epoch(&contents),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "content epoch marker not readable");
            0
        }
    }
}

fn parse_epoch(contents: &str) -> i64 {
    contents
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().last())
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}

type Memo<T> = Option<Option<T>>;

/// Request-scoped accessor for the three details families.
///
/// Each record is fetched from the store at most once per request.
pub struct DetailsCache {
    store: StoreHandle,
    prefix: String,
    epoch: i64,
    environment_id: String,
    page_id: String,
    app: Memo<AppDetails>,
    user: Memo<UserDetails>,
    page: Memo<PageDetails>,
}

impl DetailsCache {
    pub fn new(
        store: StoreHandle,
        prefix: impl Into<String>,
        epoch: i64,
        environment_id: impl Into<String>,
        page_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            epoch,
            environment_id: environment_id.into(),
            page_id: page_id.into(),
            app: None,
            user: None,
            page: None,
        }
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Switch to another environment; environment-scoped records are
    /// forgotten so they are re-read under the new keys.
    pub fn set_environment(&mut self, environment_id: impl Into<String>) {
        let environment_id = environment_id.into();
        if environment_id != self.environment_id {
            self.environment_id = environment_id;
            self.user = None;
            self.page = None;
        }
    }

    pub fn app_key(&self) -> String {
        app_details_key(&self.prefix, self.epoch)
    }

    pub fn user_key(&self) -> String {
        user_details_key(&self.prefix, &self.environment_id, self.epoch)
    }

    pub fn page_key(&self) -> String {
        page_details_key(&self.prefix, &self.environment_id, &self.page_id, self.epoch)
    }

    pub async fn app_details(&mut self) -> Option<AppDetails> {
        if self.app.is_none() {
            let key = self.app_key();
            self.app = Some(fetch(&self.store, &key).await);
        }
        self.app.clone().flatten()
    }

    pub async fn user_details(&mut self) -> Option<UserDetails> {
        if self.user.is_none() {
            let key = self.user_key();
            self.user = Some(fetch(&self.store, &key).await);
        }
        self.user.clone().flatten()
    }

    pub async fn page_details(&mut self) -> Option<PageDetails> {
        if self.page.is_none() {
            let key = self.page_key();
            self.page = Some(fetch(&self.store, &key).await);
        }
        self.page.clone().flatten()
    }

    /// Canonical version string, or `None` unless all three records exist.
    pub async fn version_string(&mut self) -> Option<String> {
        let app = self.app_details().await;
        let user = self.user_details().await;
        let page = self.page_details().await;
        version::compose_version_string(app.as_ref(), user.as_ref(), page.as_ref())
    }

    pub async fn version_hash(&mut self) -> Option<String> {
        self.version_string()
            .await
            .map(|s| version::version_hash(&s))
    }

    pub async fn put_app_details(&mut self, details: AppDetails, ttl: Duration) -> bool {
        let key = self.app_key();
        let written = put(&self.store, &key, &details, ttl).await;
        self.app = Some(Some(details));
        written
    }

    pub async fn put_user_details(&mut self, details: UserDetails, ttl: Duration) -> bool {
        let key = self.user_key();
        let written = put(&self.store, &key, &details, ttl).await;
        self.user = Some(Some(details));
        written
    }

    pub async fn put_page_details(&mut self, details: PageDetails, ttl: Duration) -> bool {
        let key = self.page_key();
        let written = put(&self.store, &key, &details, ttl).await;
        self.page = Some(Some(details));
        written
    }
}

async fn fetch<T: DeserializeOwned>(store: &StoreHandle, key: &str) -> Option<T> {
    let bytes = store.get(key).await?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => {
            trace!(key, "details found");
            Some(value)
        }
        Err(err) => {
            debug!(key, error = %err, "ignoring malformed details record");
            None
        }
    }
}

async fn put<T: Serialize>(store: &StoreHandle, key: &str, value: &T, ttl: Duration) -> bool {
    match serde_json::to_vec(value) {
        Ok(encoded) => {
            store
                .set(key, Bytes::from(encoded), ttl, StoreFlags::default())
                .await
        }
        Err(err) => {
            debug!(key, error = %err, "failed to encode details record");
            false
        }
    }
}
