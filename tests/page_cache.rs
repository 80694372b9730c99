use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use http_body_util::BodyExt;
use pagecache::cache::{
    CacheConfig, CacheState, CacheStore, CacheTrackingPolicy, DependencyProvider, MemoryLedger,
    MemoryStore, StoreHandle, UpdateCommand, X_CACHE, X_CACHE_DEBUG_REASON,
    X_CACHE_VERSION_STRING, keys, render, response_cache_layer,
};
use tower::ServiceExt;

struct Harness {
    app: Router,
    renders: Arc<AtomicUsize>,
    store: Arc<MemoryStore>,
    ledger: Arc<MemoryLedger>,
    config: CacheConfig,
}

async fn report(renders: Arc<AtomicUsize>, headers: HeaderMap) -> Response {
    let n = renders.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(user) = headers.get("x-test-user").and_then(|v| v.to_str().ok()) {
        render::set_user(user);
    }
    render::record_table("orders");
    (
        StatusCode::OK,
        [(header::LOCATION, "/login?--referrer=%2Fhome")],
        format!("orders report #{n}"),
    )
        .into_response()
}

async fn update_orders() -> StatusCode {
    render::invalidate(UpdateCommand::app_table("orders"));
    StatusCode::SEE_OTHER
}

fn harness(config: CacheConfig) -> Harness {
    let store = Arc::new(MemoryStore::new(128));
    let ledger = Arc::new(MemoryLedger::new());
    let handle = StoreHandle::new(store.clone(), Duration::from_secs(1));
    let state = CacheState::new(config.clone(), handle, ledger.clone());

    let renders = Arc::new(AtomicUsize::new(0));
    let counter = renders.clone();
    let app = Router::new()
        .route(
            "/report",
            get(move |headers: HeaderMap| report(counter.clone(), headers)).post(update_orders),
        )
        .layer(middleware::from_fn_with_state(state, response_cache_layer));

    Harness {
        app,
        renders,
        store,
        ledger,
        config,
    }
}

fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

fn x_cache(response: &Response) -> &str {
    response
        .headers()
        .get(X_CACHE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// `name=value` pair from the response's environment cookie.
fn environment_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("body should be utf-8")
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let h = harness(CacheConfig::default());

    let first = send(&h.app, get_request("/report?--referrer=/home", None)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(x_cache(&first), "Not cached");
    let cookie = environment_cookie(&first).expect("environment cookie should be set");
    let anonymous = keys::compile_environment(
        &h.config.secret_key,
        &keys::environment_string("", &h.config.default_language),
    );
    assert_eq!(cookie, format!("{}={anonymous}", h.config.cookie_name));
    assert_eq!(body_text(first).await, "orders report #1");

    let second = send(
        &h.app,
        get_request("/report?--referrer=/elsewhere", Some(&cookie)),
    )
    .await;
    assert_eq!(x_cache(&second), "Cached");
    assert_eq!(
        second.headers().get(header::LOCATION).unwrap(),
        "/login?--referrer=%2Felsewhere"
    );
    assert_eq!(
        second.headers().get(header::CONTENT_LENGTH).unwrap(),
        "orders report #1".len().to_string().as_str()
    );
    assert!(second.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(body_text(second).await, "orders report #1");
    assert_eq!(h.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn first_anonymous_request_without_cookie_hits_after_warmup() {
    let h = harness(CacheConfig::default());

    send(&h.app, get_request("/report", None)).await;
    let second = send(&h.app, get_request("/report", None)).await;

    assert_eq!(x_cache(&second), "Cached");
    assert_eq!(h.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidation_moves_the_version_forward() {
    let h = harness(CacheConfig::default());

    let first = send(&h.app, get_request("/report", None)).await;
    let cookie = environment_cookie(&first).expect("environment cookie should be set");
    let cached = send(&h.app, get_request("/report", Some(&cookie))).await;
    assert_eq!(x_cache(&cached), "Cached");

    let post = Request::builder()
        .method(Method::POST)
        .uri("/report")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .expect("request should build");
    let post = send(&h.app, post).await;
    assert_eq!(post.status(), StatusCode::SEE_OTHER);
    assert_eq!(x_cache(&post), "Bypass");
    assert!(post.headers().get(header::SET_COOKIE).is_some());
    assert_eq!(h.ledger.version("orders", ""), 1);

    let after = send(&h.app, get_request("/report", Some(&cookie))).await;
    assert_eq!(x_cache(&after), "Not cached");
    assert_eq!(body_text(after).await, "orders report #2");

    let again = send(&h.app, get_request("/report", Some(&cookie))).await;
    assert_eq!(x_cache(&again), "Cached");
    assert_eq!(body_text(again).await, "orders report #2");
}

#[tokio::test]
async fn evicted_details_force_a_render() {
    let h = harness(CacheConfig {
        debug_headers: true,
        ..CacheConfig::default()
    });

    let first = send(&h.app, get_request("/report", None)).await;
    let cookie = environment_cookie(&first).expect("environment cookie should be set");
    assert_eq!(
        first.headers().get(X_CACHE_DEBUG_REASON).unwrap(),
        "details_missing"
    );

    h.store
        .delete(&keys::app_details_key("", 0))
        .await
        .expect("memory store delete");

    let second = send(&h.app, get_request("/report", Some(&cookie))).await;
    assert_eq!(x_cache(&second), "Not cached");
    assert_eq!(
        second.headers().get(X_CACHE_DEBUG_REASON).unwrap(),
        "details_missing"
    );

    let third = send(&h.app, get_request("/report", Some(&cookie))).await;
    assert_eq!(x_cache(&third), "Cached");
    let version = third
        .headers()
        .get(X_CACHE_VERSION_STRING)
        .and_then(|v| v.to_str().ok())
        .expect("version string header");
    assert!(version.contains("tables.orders="), "{version}");
    assert_eq!(h.renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn authenticated_users_get_their_own_entries() {
    let h = harness(CacheConfig::default());

    let as_ann = Request::builder()
        .uri("/report")
        .header("x-test-user", "ann")
        .body(Body::empty())
        .expect("request should build");
    let ann = send(&h.app, as_ann).await;
    let ann_cookie = environment_cookie(&ann).expect("environment cookie should be set");

    let anon = send(&h.app, get_request("/report", None)).await;
    let anon_cookie = environment_cookie(&anon).expect("environment cookie should be set");
    assert_ne!(ann_cookie, anon_cookie);
    assert_eq!(x_cache(&anon), "Not cached");

    let ann_again = send(&h.app, get_request("/report", Some(&ann_cookie))).await;
    assert_eq!(x_cache(&ann_again), "Cached");
    assert_eq!(body_text(ann_again).await, "orders report #1");

    let anon_again = send(&h.app, get_request("/report", Some(&anon_cookie))).await;
    assert_eq!(body_text(anon_again).await, "orders report #2");
}

#[tokio::test]
async fn forged_cookie_falls_back_to_default_environment() {
    let h = harness(CacheConfig::default());

    send(&h.app, get_request("/report", None)).await;
    let forged = format!("{}=not-a-real-token", h.config.cookie_name);
    let response = send(&h.app, get_request("/report", Some(&forged))).await;

    assert_eq!(x_cache(&response), "Cached");
}

#[tokio::test]
async fn bypass_param_and_reserved_action_skip_the_store() {
    let h = harness(CacheConfig {
        debug_headers: true,
        ..CacheConfig::default()
    });

    let flagged = send(&h.app, get_request("/report?--msg=Saved", None)).await;
    assert_eq!(x_cache(&flagged), "Bypass");
    assert_eq!(flagged.headers().get(X_CACHE_DEBUG_REASON).unwrap(), "param");
    assert!(flagged.headers().get(header::SET_COOKIE).is_some());

    let script = send(&h.app, get_request("/report?-action=js", None)).await;
    assert_eq!(x_cache(&script), "Bypass");
    assert_eq!(script.headers().get(X_CACHE_DEBUG_REASON).unwrap(), "action");
    assert!(script.headers().get(header::SET_COOKIE).is_none());

    let keys = h
        .store
        .keys()
        .await
        .expect("memory store keys")
        .expect("memory store enumerates keys");
    assert!(
        !keys.iter().any(|key| key.starts_with('/')),
        "no content entry expected: {keys:?}"
    );

    let plain = send(&h.app, get_request("/report", None)).await;
    assert_eq!(x_cache(&plain), "Not cached");
    assert_eq!(h.renders.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn read_only_mode_never_writes() {
    let h = harness(CacheConfig {
        read_only: true,
        ..CacheConfig::default()
    });

    for _ in 0..2 {
        let response = send(&h.app, get_request("/report", None)).await;
        assert_eq!(x_cache(&response), "Disabled (read only)");
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }
    assert!(h.store.is_empty());
    assert_eq!(h.renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_cache_is_transparent() {
    let h = harness(CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    });

    let response = send(&h.app, get_request("/report", None)).await;
    assert!(response.headers().get(X_CACHE).is_none());
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert!(h.store.is_empty());
}

struct CustomersFeedOrders;

impl DependencyProvider for CustomersFeedOrders {
    fn depends_on(&self, table: &str) -> Vec<String> {
        match table {
            "orders" => vec!["customers".to_string()],
            _ => Vec::new(),
        }
    }
}

#[tokio::test]
async fn dependency_invalidation_reaches_dependent_pages() {
    let store = StoreHandle::new(Arc::new(MemoryStore::new(128)), Duration::from_secs(1));
    let state = CacheState::new(CacheConfig::default(), store, Arc::new(MemoryLedger::new()))
        .with_dependencies(Arc::new(CustomersFeedOrders));
    let app = Router::new()
        .route(
            "/orders",
            get(|| async {
                render::set_primary_table("orders");
                "orders"
            }),
        )
        .route(
            "/customers",
            axum::routing::post(|| async {
                render::invalidate(UpdateCommand::app_table("customers"));
                StatusCode::NO_CONTENT
            }),
        )
        .layer(middleware::from_fn_with_state(state, response_cache_layer));

    let first = send(&app, get_request("/orders", None)).await;
    let cookie = environment_cookie(&first).expect("environment cookie should be set");
    assert_eq!(x_cache(&send(&app, get_request("/orders", Some(&cookie))).await), "Cached");

    let update = Request::builder()
        .method(Method::POST)
        .uri("/customers")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .expect("request should build");
    assert_eq!(send(&app, update).await.status(), StatusCode::NO_CONTENT);

    let after = send(&app, get_request("/orders", Some(&cookie))).await;
    assert_eq!(x_cache(&after), "Not cached");
}

struct NeverTrack;

impl CacheTrackingPolicy for NeverTrack {
    fn application(&self) -> Option<bool> {
        Some(false)
    }
}

#[tokio::test]
async fn untracked_tables_do_not_invalidate_pages() {
    let store = StoreHandle::new(Arc::new(MemoryStore::new(128)), Duration::from_secs(1));
    let state = CacheState::new(CacheConfig::default(), store, Arc::new(MemoryLedger::new()))
        .with_tracking(Arc::new(NeverTrack));
    let app = Router::new()
        .route(
            "/dashboard",
            get(|| async {
                render::record_table("audit");
                "dashboard"
            })
            .post(|| async {
                render::invalidate(UpdateCommand::app_table("audit"));
                StatusCode::NO_CONTENT
            }),
        )
        .layer(middleware::from_fn_with_state(state, response_cache_layer));

    let first = send(&app, get_request("/dashboard", None)).await;
    let cookie = environment_cookie(&first).expect("environment cookie should be set");

    let update = Request::builder()
        .method(Method::POST)
        .uri("/dashboard")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .expect("request should build");
    send(&app, update).await;

    let after = send(&app, get_request("/dashboard", Some(&cookie))).await;
    assert_eq!(x_cache(&after), "Cached");
}
