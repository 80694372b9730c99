//! Content entries: the cached response for one `(environment, page, version)`.
//!
//! An entry is framed like a minimal HTTP message: `Name: value` lines, a
//! blank line, then the body. The status code and write time travel as
//! bookkeeping headers that are stripped again before replay.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use bytes::{BufMut, Bytes, BytesMut};
use metrics::counter;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, trace};

use super::keys::{page_key, rewrite_ignored_params};
use super::store::{StoreFlags, StoreHandle};

const STATUS_HEADER: &str = "x-pagecache-status";
const STORED_HEADER: &str = "x-pagecache-stored";
const SEPARATOR: &[u8] = b"\r\n\r\n";

const METRIC_WRITE: &str = "pagecache_write_total";
const METRIC_WRITE_SKIPPED: &str = "pagecache_write_skipped_total";

/// Header name prefixes that are kept when an entry is written.
const ALLOWED_PREFIXES: &[&str] = &[
    "content",
    "location",
    "etag",
    "last",
    "server",
    "vary",
    "expires",
    "allow",
    "cache",
    "pragma",
];

fn is_allowed(name: &HeaderName) -> bool {
    let name = name.as_str();
    ALLOWED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// A decoded content entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Unix seconds at write time.
    pub stored_at: Option<i64>,
}

impl CachedPage {
    /// Serialize with bookkeeping headers prepended.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.body.len() + 256);
        push_line(&mut out, STATUS_HEADER, self.status.as_str().as_bytes());
        if let Some(stored_at) = self.stored_at {
            push_line(&mut out, STORED_HEADER, stored_at.to_string().as_bytes());
        }
        for (name, value) in &self.headers {
            push_line(&mut out, name.as_str(), value.as_bytes());
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Parse an encoded entry; `None` when the framing is broken.
    pub fn decode(raw: &Bytes) -> Option<Self> {
        let split = raw
            .windows(SEPARATOR.len())
            .position(|window| window == SEPARATOR)?;
        let head = std::str::from_utf8(&raw[..split]).ok()?;
        let body = raw.slice(split + SEPARATOR.len()..);

        let mut status = StatusCode::OK;
        let mut stored_at = None;
        let mut headers = HeaderMap::new();
        for line in head.split("\r\n") {
            let (name, value) = line.split_once(':')?;
            let value = value.trim_start();
            match name.to_ascii_lowercase().as_str() {
                STATUS_HEADER => status = value.parse::<u16>().ok().and_then(|c| StatusCode::from_u16(c).ok())?,
                STORED_HEADER => stored_at = value.parse().ok(),
                _ => {
                    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
                    let value = HeaderValue::from_str(value).ok()?;
                    headers.append(name, value);
                }
            }
        }
        Some(Self {
            status,
            headers,
            body,
            stored_at,
        })
    }
}

fn push_line(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

/// Why a write did or did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    TooLarge,
    Uncacheable(&'static str),
    StoreFailed,
}

impl WriteOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::TooLarge => "too_large",
            Self::Uncacheable(reason) => reason,
            Self::StoreFailed => "store_failed",
        }
    }
}

/// A response about to be written.
#[derive(Debug, Clone, Copy)]
pub struct PageWrite<'a> {
    pub prefix: &'a str,
    pub environment_id: &'a str,
    pub page_id: &'a str,
    pub version_hash: &'a str,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub body: &'a Bytes,
    /// Seconds, from the render collaborator.
    pub ttl_override: Option<u64>,
}

/// Reads and writes content entries.
#[derive(Clone)]
pub struct ContentStore {
    store: StoreHandle,
    max_entry_bytes: usize,
    default_ttl: Duration,
    ignored_params: Vec<String>,
    respect_cache_control: bool,
    respect_expires: bool,
}

impl ContentStore {
    pub fn new(store: StoreHandle, max_entry_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            store,
            max_entry_bytes,
            default_ttl,
            ignored_params: Vec::new(),
            respect_cache_control: false,
            respect_expires: false,
        }
    }

    pub fn with_ignored_params(mut self, ignored: Vec<String>) -> Self {
        self.ignored_params = ignored;
        self
    }

    pub fn with_http_semantics(mut self, cache_control: bool, expires: bool) -> Self {
        self.respect_cache_control = cache_control;
        self.respect_expires = expires;
        self
    }

    /// Look up `key`, returning the entry with ignored parameters in its
    /// headers rewritten to the values in `current_query`.
    pub async fn check_cache(
        &self,
        key: &str,
        current_query: &str,
        now: OffsetDateTime,
    ) -> Option<CachedPage> {
        let raw = self.store.get(key).await?;
        let Some(mut page) = CachedPage::decode(&raw) else {
            debug!(key, "ignoring malformed content entry");
            return None;
        };
        if let Some(reason) = self.stale_reason(&page, now) {
            debug!(key, reason, "cached entry is stale");
            return None;
        }

        if !current_query.is_empty() && !self.ignored_params.is_empty() {
            let mut rewritten = HeaderMap::with_capacity(page.headers.len());
            for (name, value) in &page.headers {
                let value = match value.to_str() {
                    Ok(text) => {
                        let text = rewrite_ignored_params(text, current_query, &self.ignored_params);
                        HeaderValue::from_str(&text).unwrap_or_else(|_| value.clone())
                    }
                    Err(_) => value.clone(),
                };
                rewritten.append(name.clone(), value);
            }
            page.headers = rewritten;
        }
        trace!(key, "content entry found");
        Some(page)
    }

    /// Store a rendered response. Oversized and uncacheable responses are
    /// skipped without error.
    pub async fn write_cache(&self, write: PageWrite<'_>, now: OffsetDateTime) -> WriteOutcome {
        let key = page_key(
            write.prefix,
            write.environment_id,
            write.page_id,
            write.version_hash,
        );
        let outcome = self.write_entry(&key, write, now).await;
        match outcome {
            WriteOutcome::Written => counter!(METRIC_WRITE).increment(1),
            other => counter!(METRIC_WRITE_SKIPPED, "reason" => other.label()).increment(1),
        }
        debug!(key, outcome = outcome.label(), "content write");
        outcome
    }

    async fn write_entry(&self, key: &str, write: PageWrite<'_>, now: OffsetDateTime) -> WriteOutcome {
        if let Some(reason) = self.uncacheable_reason(write.headers, now) {
            return WriteOutcome::Uncacheable(reason);
        }
        let ttl = match write.ttl_override {
            Some(0) => return WriteOutcome::Uncacheable("zero_expiry"),
            Some(secs) => Duration::from_secs(secs),
            None => self.default_ttl,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in write.headers.iter().filter(|(name, _)| is_allowed(name)) {
            headers.append(name.clone(), value.clone());
        }
        let page = CachedPage {
            status: write.status,
            headers,
            body: write.body.clone(),
            stored_at: Some(now.unix_timestamp()),
        };
        let encoded = page.encode();
        if encoded.len() > self.max_entry_bytes {
            return WriteOutcome::TooLarge;
        }

        if self.store.set(key, encoded, ttl, StoreFlags::COMPRESSED).await {
            WriteOutcome::Written
        } else {
            WriteOutcome::StoreFailed
        }
    }

    fn uncacheable_reason(&self, headers: &HeaderMap, now: OffsetDateTime) -> Option<&'static str> {
        if self.respect_cache_control {
            if let Some(directives) = cache_control(headers) {
                if directives.no_store || directives.no_cache || directives.max_age() == Some(0) {
                    return Some("cache_control");
                }
            }
        }
        if self.respect_expires {
            if let Some(value) = headers.get(header::EXPIRES) {
                match value.to_str().ok().and_then(parse_http_date) {
                    Some(expires) if expires > now => {}
                    _ => return Some("expires"),
                }
            }
        }
        None
    }

    fn stale_reason(&self, page: &CachedPage, now: OffsetDateTime) -> Option<&'static str> {
        if self.respect_cache_control {
            let max_age = cache_control(&page.headers).and_then(|d| d.max_age());
            if let (Some(max_age), Some(stored_at)) = (max_age, page.stored_at) {
                if stored_at.saturating_add(max_age) <= now.unix_timestamp() {
                    return Some("max_age");
                }
            }
        }
        if self.respect_expires {
            if let Some(value) = page.headers.get(header::EXPIRES) {
                match value.to_str().ok().and_then(parse_http_date) {
                    Some(expires) if expires > now => {}
                    _ => return Some("expires"),
                }
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    max_age: Option<i64>,
    s_maxage: Option<i64>,
}

impl CacheControl {
    /// Shared-cache lifetime: `s-maxage` wins over `max-age`.
    fn max_age(&self) -> Option<i64> {
        self.s_maxage.or(self.max_age)
    }
}

fn cache_control(headers: &HeaderMap) -> Option<CacheControl> {
    let mut out = CacheControl::default();
    let mut seen = false;
    for value in headers.get_all(header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        seen = true;
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive.as_str(), None),
            };
            match name {
                "no-store" => out.no_store = true,
                "no-cache" => out.no_cache = true,
                "max-age" => out.max_age = arg.and_then(|a| a.parse().ok()),
                "s-maxage" => out.s_maxage = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }
    }
    seen.then_some(out)
}

/// Parse an IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    PrimitiveDateTime::parse(value.trim(), format)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
