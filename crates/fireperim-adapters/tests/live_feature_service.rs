use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use fireperim_adapters::{
    AdapterError, FeatureFetcher, FeatureSource, FetchContext, PerimeterQuery, RetrySchedule,
};
use fireperim_storage::{FetchError, HttpClient, HttpClientConfig};
use tokio::net::TcpListener;
use uuid::Uuid;

const FIXTURE: &str = include_str!("../../../fixtures/arcgis/perimeters_response.json");

/// Request counters per route.
#[derive(Clone, Default)]
struct Hits {
    flaky: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
    broken: Arc<AtomicUsize>,
    rejecting: Arc<AtomicUsize>,
}

fn json_body(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// 502, then 429, then the fixture.
async fn flaky(State(hits): State<Hits>) -> Response {
    match hits.flaky.fetch_add(1, Ordering::SeqCst) {
        0 => (StatusCode::BAD_GATEWAY, "upstream down").into_response(),
        1 => (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response(),
        _ => json_body(FIXTURE),
    }
}

/// A 200 carrying a 503 error envelope, then the fixture.
async fn busy(State(hits): State<Hits>) -> Response {
    match hits.busy.fetch_add(1, Ordering::SeqCst) {
        0 => json_body(r#"{"error":{"code":503,"message":"Service busy","details":[]}}"#),
        _ => json_body(FIXTURE),
    }
}

async fn broken(State(hits): State<Hits>) -> Response {
    hits.broken.fetch_add(1, Ordering::SeqCst);
    (StatusCode::BAD_GATEWAY, "upstream down").into_response()
}

async fn rejecting(State(hits): State<Hits>) -> Response {
    hits.rejecting.fetch_add(1, Ordering::SeqCst);
    json_body(r#"{"error":{"code":400,"message":"Unable to complete operation.","details":[]}}"#)
}

async fn spawn_feature_service() -> (String, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/perimeters/query", get(|| async { json_body(FIXTURE) }))
        .route("/flaky/query", get(flaky))
        .route("/busy/query", get(busy))
        .route("/broken/query", get(broken))
        .route("/rejecting/query", get(rejecting))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), hits)
}

fn fetcher(endpoint: String, retries: u32) -> FeatureFetcher {
    let http = HttpClient::new(&HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: "fireperim-test".into(),
    })
    .expect("http client");
    FeatureFetcher::new(
        PerimeterQuery {
            endpoint,
            ..Default::default()
        },
        http,
    )
    .with_retry(RetrySchedule {
        retries,
        first_wait: Duration::from_millis(1),
        max_wait: Duration::from_millis(4),
    })
}

fn ctx() -> FetchContext {
    FetchContext {
        run_id: Uuid::new_v4(),
        today: NaiveDate::from_ymd_opt(2024, 7, 16).expect("date"),
    }
}

#[tokio::test]
async fn fetches_and_decodes_features_over_http() {
    let (base, _) = spawn_feature_service().await;
    let features = fetcher(format!("{base}/perimeters/query"), 0)
        .fetch_features(&ctx())
        .await
        .expect("fetch");
    assert_eq!(features.len(), 4);
}

#[tokio::test]
async fn transient_statuses_are_retried_until_the_service_recovers() {
    let (base, hits) = spawn_feature_service().await;
    let features = fetcher(format!("{base}/flaky/query"), 3)
        .fetch_features(&ctx())
        .await
        .expect("recovers after two failures");
    assert_eq!(features.len(), 4);
    assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn busy_error_envelope_is_retried() {
    let (base, hits) = spawn_feature_service().await;
    let features = fetcher(format!("{base}/busy/query"), 1)
        .fetch_features(&ctx())
        .await
        .expect("recovers after busy envelope");
    assert_eq!(features.len(), 4);
    assert_eq!(hits.busy.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_status() {
    let (base, hits) = spawn_feature_service().await;
    let fetcher = fetcher(format!("{base}/broken/query"), 2);

    let err = fetcher.fetch_features(&ctx()).await.expect_err("502");
    assert!(matches!(
        err,
        AdapterError::Fetch(FetchError::HttpStatus { status: 502, .. })
    ));
    assert_eq!(hits.broken.load(Ordering::SeqCst), 3);

    let outcome = fetcher.fetch(&ctx()).await;
    assert!(outcome.features.is_empty());
    assert!(outcome.failure.is_some_and(|msg| msg.contains("502")));
    assert_eq!(hits.broken.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn rejected_query_is_not_retried() {
    let (base, hits) = spawn_feature_service().await;
    let err = fetcher(format!("{base}/rejecting/query"), 3)
        .fetch_features(&ctx())
        .await
        .expect_err("service error");
    assert!(matches!(err, AdapterError::Service { code: 400, .. }));
    assert_eq!(hits.rejecting.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_service_yields_no_features() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let outcome = fetcher(format!("http://{addr}/query"), 1).fetch(&ctx()).await;
    assert!(outcome.features.is_empty());
    assert!(outcome.failure.is_some());
}
