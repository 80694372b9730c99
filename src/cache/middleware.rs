//! Page cache middleware.
//!
//! Serves cached responses for the current `(environment, page, version)`
//! and otherwise renders inside a [`RenderScope`], then flushes: commits
//! invalidations, refreshes details, and writes the buffered response.
//! Nothing in the flush path can change the response the client receives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, error, instrument, warn};

use super::{
    CacheConfig,
    content::{CachedPage, ContentStore, PageWrite, WriteOutcome},
    deps::{CacheTrackingPolicy, DependencyProvider, StaticCatalog},
    details::{DetailsCache, PageSeed, build_page_details, read_epoch},
    keys,
    ledger::{ContentVersionLedger, UpdateLedger},
    render::{RenderRecord, RenderScope},
    store::StoreHandle,
    version::version_hash,
};

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_DEBUG_REASON: &str = "x-cache-debug-reason";
pub const X_CACHE_VERSION_STRING: &str = "x-cache-version-string";

const METRIC_HIT: &str = "pagecache_hit_total";
const METRIC_MISS: &str = "pagecache_miss_total";
const METRIC_BYPASS: &str = "pagecache_bypass_total";
const METRIC_FLUSH_MS: &str = "pagecache_flush_ms";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: Arc<CacheConfig>,
    pub store: StoreHandle,
    pub ledger: Arc<dyn ContentVersionLedger>,
    pub dependencies: Arc<dyn DependencyProvider>,
    pub tracking: Arc<dyn CacheTrackingPolicy>,
    content: ContentStore,
}

impl CacheState {
    /// State whose dependency and tracking declarations come from `config`.
    pub fn new(
        config: CacheConfig,
        store: StoreHandle,
        ledger: Arc<dyn ContentVersionLedger>,
    ) -> Self {
        let catalog = Arc::new(StaticCatalog::from_config(&config));
        let content = ContentStore::new(
            store.clone(),
            config.max_entry_bytes,
            Duration::from_secs(config.default_ttl_secs),
        )
        .with_ignored_params(config.ignored_params.clone())
        .with_http_semantics(config.respect_cache_control, config.respect_expires);
        Self {
            config: Arc::new(config),
            store,
            ledger,
            dependencies: catalog.clone(),
            tracking: catalog,
            content,
        }
    }

    pub fn with_dependencies(mut self, provider: Arc<dyn DependencyProvider>) -> Self {
        self.dependencies = provider;
        self
    }

    pub fn with_tracking(mut self, policy: Arc<dyn CacheTrackingPolicy>) -> Self {
        self.tracking = policy;
        self
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }
}

/// How a request enters the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Reserved sub-resource; the cache stays out of the way entirely.
    PassThrough(&'static str),
    /// Rendered live and flushed, but never looked up or written.
    Bypass(&'static str),
    Lookup,
}

fn route(config: &CacheConfig, request: &Request<Body>) -> Route {
    let query = request.uri().query().unwrap_or("");
    if let Some(action) = keys::query_value(query, &config.action_param) {
        if config.is_bypass_action(&action) {
            return Route::PassThrough("action");
        }
    }
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return Route::Bypass("method");
    }
    if has_body(request.headers()) {
        return Route::Bypass("body");
    }
    let flagged = config
        .bypass_params
        .iter()
        .any(|name| keys::query_value(query, name).is_some_and(|v| !v.is_empty()));
    if flagged {
        return Route::Bypass("param");
    }
    Route::Lookup
}

fn has_body(headers: &HeaderMap) -> bool {
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    length > 0 || headers.contains_key(header::TRANSFER_ENCODING)
}

/// Value of cookie `name` in the request's `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn request_host(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
}

/// Middleware for page caching.
///
/// Lookups only happen for body-less GET and HEAD requests; only successful
/// or redirect GET responses are written.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let config = cache.config.clone();
    if !config.enabled {
        return next.run(request).await;
    }

    let route = route(&config, &request);
    if let Route::PassThrough(reason) = route {
        counter!(METRIC_BYPASS, "reason" => reason).increment(1);
        debug!(cache = "page", outcome = "bypass", reason, "reserved action");
        let mut response = next.run(request).await;
        mark(&mut response, &config, "Bypass", Some(reason));
        return response;
    }

    let uri = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let query = request.uri().query().unwrap_or("").to_string();
    let is_get = request.method() == Method::GET;
    let prefix = config.prefix_for_host(request_host(&request).as_deref());
    let environment_id = keys::environment_id(
        cookie_value(request.headers(), &config.cookie_name),
        &config.secret_key,
        &config.default_environment,
    );
    let page_id = keys::page_id(&uri, &config.ignored_params);
    let epoch = read_epoch(config.version_file.as_deref()).await;
    let mut details = DetailsCache::new(cache.store.clone(), prefix, epoch, environment_id, page_id);

    let mut debug_reason = match route {
        Route::Bypass(reason) => {
            counter!(METRIC_BYPASS, "reason" => reason).increment(1);
            debug!(cache = "page", outcome = "bypass", reason, "not cacheable");
            Some(reason)
        }
        _ => {
            let version = details.version_string().await;
            match version {
                Some(version) => {
                    let key = keys::page_key(
                        details.prefix(),
                        details.environment_id(),
                        details.page_id(),
                        &version_hash(&version),
                    );
                    let now = OffsetDateTime::now_utc();
                    if let Some(page) = cache.content.check_cache(&key, &query, now).await {
                        counter!(METRIC_HIT).increment(1);
                        debug!(cache = "page", outcome = "hit", key, "serving cached response");
                        return replay(page, &config, &version);
                    }
                    None
                }
                None => Some("details_missing"),
            }
        }
    };

    if !matches!(route, Route::Bypass(_)) {
        counter!(METRIC_MISS).increment(1);
        debug!(cache = "page", outcome = "miss", reason = debug_reason.unwrap_or("no_entry"), "rendering");
    }

    if config.read_only {
        let mut response = next.run(request).await;
        mark(&mut response, &config, "Disabled (read only)", debug_reason);
        return response;
    }

    let primary_table = keys::query_value(&query, &config.table_param);
    let action = keys::query_value(&query, &config.action_param);

    let scope = RenderScope::new();
    request.extensions_mut().insert(scope.clone());
    let (response, record) = scope.run(next.run(request)).await;

    let writable = matches!(route, Route::Lookup)
        && is_get
        && !record.no_cache
        && (response.status().is_success() || response.status().is_redirection());
    if record.no_cache && debug_reason.is_none() {
        debug_reason = Some("suppressed");
    }

    let environment = keys::environment_string(
        record.effective_user(),
        record.language.as_deref().unwrap_or(&config.default_language),
    );
    let flush_environment = keys::compile_environment(&config.secret_key, &environment);

    let (mut response, pending) = if writable {
        match buffer_response(response).await {
            Ok((rebuilt, pending)) => (rebuilt, Some(pending)),
            Err(rebuilt) => (rebuilt, None),
        }
    } else {
        (response, None)
    };

    let job = FlushJob {
        state: cache.clone(),
        details,
        record,
        environment_id: flush_environment.clone(),
        primary_table,
        action,
        pending,
    };
    let started = Instant::now();
    match tokio::spawn(job.run()).await {
        Ok(Some(outcome)) => debug!(cache = "page", ?outcome, "flush complete"),
        Ok(None) => debug!(cache = "page", "flush complete without write"),
        Err(err) => error!(error = %err, "cache flush task failed"),
    }
    histogram!(METRIC_FLUSH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    set_environment_cookie(&mut response, &config, &flush_environment);
    let status = if matches!(route, Route::Bypass(_)) {
        "Bypass"
    } else {
        "Not cached"
    };
    mark(&mut response, &config, status, debug_reason);
    response
}

/// Buffer the body so it can be both stored and sent.
async fn buffer_response(response: Response) -> Result<(Response, PendingWrite), Response> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let pending = PendingWrite {
                status: parts.status,
                headers: parts.headers.clone(),
                body: bytes.clone(),
            };
            Ok((Response::from_parts(parts, Body::from(bytes)), pending))
        }
        Err(err) => {
            warn!(error = %err, "failed to buffer response body; not caching");
            Err(Response::from_parts(parts, Body::empty()))
        }
    }
}

struct PendingWrite {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Flush-phase work for one rendered request. Runs on its own task so it
/// completes even if the client goes away.
struct FlushJob {
    state: CacheState,
    details: DetailsCache,
    record: RenderRecord,
    environment_id: String,
    primary_table: Option<String>,
    action: Option<String>,
    pending: Option<PendingWrite>,
}

impl FlushJob {
    async fn run(self) -> Option<WriteOutcome> {
        let Self {
            state,
            mut details,
            record,
            environment_id,
            primary_table,
            action,
            pending,
        } = self;
        let config = &state.config;
        details.set_environment(environment_id);

        let updater = UpdateLedger::new(
            state.ledger.as_ref(),
            Duration::from_secs(config.app_details_ttl_secs),
            Duration::from_secs(config.user_details_ttl_secs),
        );
        // Failures are logged inside; the stale details must not be used.
        updater
            .process(record.update_commands(), record.effective_user(), &mut details)
            .await
            .ok()?;

        let pending = pending?;
        if details.page_details().await.is_none() {
            let seed = PageSeed {
                primary_table: record.primary_table.as_deref().or(primary_table.as_deref()),
                action: record.action.as_deref().or(action.as_deref()),
                tables_touched: record.tables_touched(),
            };
            let page = build_page_details(
                seed,
                config.track_used_tables,
                state.tracking.as_ref(),
                state.dependencies.as_ref(),
            );
            match page {
                Ok(page) => {
                    details
                        .put_page_details(page, Duration::from_secs(config.page_details_ttl_secs))
                        .await;
                }
                Err(err) => {
                    error!(error = %err, "cannot build page details; response not cached");
                    return None;
                }
            }
        }

        let Some(hash) = details.version_hash().await else {
            debug!(cache = "page", "version hash unavailable after flush");
            return None;
        };
        let write = PageWrite {
            prefix: details.prefix(),
            environment_id: details.environment_id(),
            page_id: details.page_id(),
            version_hash: &hash,
            status: pending.status,
            headers: &pending.headers,
            body: &pending.body,
            ttl_override: record.expiry_override(),
        };
        Some(state.content.write_cache(write, OffsetDateTime::now_utc()).await)
    }
}

/// Build a response from a cached entry.
fn replay(page: CachedPage, config: &CacheConfig, version: &str) -> Response {
    let CachedPage {
        status,
        headers,
        body,
        ..
    } = page;
    let mut response = Response::new(Body::from(body.clone()));
    *response.status_mut() = status;
    let target = response.headers_mut();
    for (name, value) in &headers {
        if *name != header::CONTENT_LENGTH {
            target.append(name.clone(), value.clone());
        }
    }
    target.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    target.insert(X_CACHE, HeaderValue::from_static("Cached"));
    if config.debug_headers {
        if let Ok(value) = HeaderValue::from_str(version) {
            target.insert(X_CACHE_VERSION_STRING, value);
        }
    }
    response
}

fn mark(response: &mut Response, config: &CacheConfig, status: &'static str, reason: Option<&'static str>) {
    let headers = response.headers_mut();
    headers.insert(X_CACHE, HeaderValue::from_static(status));
    if config.debug_headers {
        if let Some(reason) = reason {
            headers.insert(X_CACHE_DEBUG_REASON, HeaderValue::from_static(reason));
        }
    }
}

fn set_environment_cookie(response: &mut Response, config: &CacheConfig, environment_id: &str) {
    let cookie = format!(
        "{}={}; Path={}; HttpOnly; SameSite=Lax",
        config.cookie_name,
        environment_id,
        config.cookie_path()
    );
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(_) => warn!(cookie_name = %config.cookie_name, "environment cookie is not a valid header"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn get_requests_are_looked_up() {
        let config = CacheConfig::default();
        assert_eq!(route(&config, &request(Method::GET, "/report")), Route::Lookup);
        assert_eq!(route(&config, &request(Method::HEAD, "/report")), Route::Lookup);
    }

    #[test]
    fn writes_bypass_lookup() {
        let config = CacheConfig::default();
        assert_eq!(
            route(&config, &request(Method::POST, "/report")),
            Route::Bypass("method")
        );

        let with_body = Request::builder()
            .uri("/report")
            .header(header::CONTENT_LENGTH, "12")
            .body(Body::empty())
            .unwrap();
        assert_eq!(route(&config, &with_body), Route::Bypass("body"));
    }

    #[test]
    fn reserved_actions_pass_through() {
        let config = CacheConfig::default();
        assert_eq!(
            route(&config, &request(Method::GET, "/index?-action=css")),
            Route::PassThrough("action")
        );
        assert_eq!(
            route(&config, &request(Method::POST, "/index?-action=js")),
            Route::PassThrough("action")
        );
    }

    #[test]
    fn non_empty_bypass_param_skips_lookup() {
        let config = CacheConfig::default();
        assert_eq!(
            route(&config, &request(Method::GET, "/report?--msg=Saved")),
            Route::Bypass("param")
        );
        assert_eq!(
            route(&config, &request(Method::GET, "/report?--msg=")),
            Route::Lookup
        );
    }

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1; PAGECACHE_ENV=abc"));
        headers.append(header::COOKIE, HeaderValue::from_static("b=2"));
        assert_eq!(cookie_value(&headers, "PAGECACHE_ENV"), Some("abc"));
        assert_eq!(cookie_value(&headers, "b"), Some("2"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn replay_recomputes_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let page = CachedPage {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"hello"),
            stored_at: None,
        };
        let config = CacheConfig {
            debug_headers: true,
            ..Default::default()
        };
        let response = replay(page, &config, "appVersion=0.0.0");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(response.headers()[X_CACHE], "Cached");
        assert_eq!(response.headers()[X_CACHE_VERSION_STRING], "appVersion=0.0.0");
    }
}
