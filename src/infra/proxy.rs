//! Upstream application proxy.
//!
//! Forwards requests to the rendering application and turns its
//! `X-Render-*` response headers into render signals for the page cache.
//! Those headers never reach the client.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::cache::{RenderScope, UpdateCommand};

use super::error::InfraError;

pub const RENDER_USER: &str = "x-render-user";
pub const RENDER_CACHE_USER: &str = "x-render-cache-user";
pub const RENDER_LANG: &str = "x-render-lang";
pub const RENDER_TABLES: &str = "x-render-tables";
pub const RENDER_TABLE: &str = "x-render-table";
pub const RENDER_ACTION: &str = "x-render-action";
pub const RENDER_INVALIDATE: &str = "x-render-invalidate";
pub const RENDER_EXPIRES: &str = "x-render-expires";
pub const RENDER_NO_CACHE: &str = "x-render-no-cache";

const RENDER_PREFIX: &str = "x-render-";

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

#[derive(Clone)]
pub struct UpstreamProxy {
    client: Client,
    base: Url,
}

impl UpstreamProxy {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("pagecache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::configuration(format!("upstream client: {err}")))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn target(&self, request: &Request<Body>) -> Url {
        let mut url = self.base.clone();
        let path = format!(
            "{}{}",
            self.base.path().trim_end_matches('/'),
            request.uri().path()
        );
        url.set_path(&path);
        url.set_query(request.uri().query());
        url
    }

    /// Forward `request` upstream and relay the response.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response, InfraError> {
        let scope = request
            .extensions()
            .get::<RenderScope>()
            .cloned()
            .or_else(RenderScope::current);
        let url = self.target(&request);
        let (parts, body) = request.into_parts();

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in &parts.headers {
            if !is_hop_by_hop(name) && *name != header::HOST {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }

        let body = BodyExt::collect(body)
            .await
            .map_err(|err| InfraError::upstream(format!("failed to read request body: {err}")))?
            .to_bytes();

        debug!(method = %parts.method, %url, "forwarding upstream");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| InfraError::upstream(err.to_string()))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| InfraError::upstream(err.to_string()))?;

        match scope {
            Some(scope) => apply_render_headers(&headers, &scope),
            None => debug!("no render scope; ignoring render headers"),
        }
        strip_response_headers(&mut headers);

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Axum fallback handler that proxies everything upstream.
pub async fn proxy_handler(State(proxy): State<UpstreamProxy>, request: Request<Body>) -> Response {
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, upstream = %proxy.base(), "upstream request failed");
            (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
        }
    }
}

fn header_values<'a>(headers: &'a HeaderMap, name: &str) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Feed the upstream's render signals into `scope`.
pub fn apply_render_headers(headers: &HeaderMap, scope: &RenderScope) {
    if let Some(user) = header_values(headers, RENDER_USER).next() {
        scope.set_user(user);
    }
    if let Some(user) = header_values(headers, RENDER_CACHE_USER).next() {
        scope.set_cache_user(user);
    }
    if let Some(lang) = header_values(headers, RENDER_LANG).next() {
        scope.set_language(lang);
    }
    if let Some(table) = header_values(headers, RENDER_TABLE).next() {
        scope.set_primary_table(table);
    }
    if let Some(action) = header_values(headers, RENDER_ACTION).next() {
        scope.set_action(action);
    }
    for list in header_values(headers, RENDER_TABLES) {
        for table in list.split(',').map(str::trim) {
            scope.record_table(table);
        }
    }
    for list in header_values(headers, RENDER_INVALIDATE) {
        for raw in list.split(',').map(str::trim).filter(|raw| !raw.is_empty()) {
            scope.invalidate(UpdateCommand::parse(raw));
        }
    }
    if let Some(raw) = header_values(headers, RENDER_EXPIRES).next() {
        match raw.parse() {
            Ok(secs) => scope.set_expiry(secs),
            Err(_) => warn!(value = raw, "ignoring invalid render expiry"),
        }
    }
    if headers.contains_key(RENDER_NO_CACHE) {
        scope.suppress_cache();
    }
}

fn strip_response_headers(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(RENDER_PREFIX) || is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}
