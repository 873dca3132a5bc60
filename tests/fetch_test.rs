mod common;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use common::{serve, test_config};
use loancli::{
    Error,
    fetch::{AssetFetcher, Descriptor, FetchStatus},
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Hits {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
}

impl Hits {
    fn hit(&self, key: &str) -> usize {
        self.order.lock().unwrap().push(key.to_string());
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key.to_string()).or_default();
        *count += 1;
        *count
    }

    fn count(&self, key: &str) -> usize {
        self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

async fn delayed(State(hits): State<Hits>, Path((ms, name)): Path<(u64, String)>) -> String {
    hits.hit(&name);
    let now = hits.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    hits.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    hits.in_flight.fetch_sub(1, Ordering::SeqCst);
    format!("body of {name}")
}

async fn status(State(hits): State<Hits>, Path(code): Path<u16>) -> StatusCode {
    hits.hit(&format!("status-{code}"));
    StatusCode::from_u16(code).unwrap()
}

async fn flaky(State(hits): State<Hits>) -> Response {
    if hits.hit("flaky") < 3 {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        "recovered".into_response()
    }
}

async fn throttled(State(hits): State<Hits>) -> Response {
    if hits.hit("throttled") == 1 {
        (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")]).into_response()
    } else {
        "allowed".into_response()
    }
}

async fn patient(State(hits): State<Hits>) -> Response {
    if hits.hit("patient") == 1 {
        (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1")]).into_response()
    } else {
        "served".into_response()
    }
}

async fn start() -> (String, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/delay/{ms}/{name}", get(delayed))
        .route("/status/{code}", get(status))
        .route("/flaky", get(flaky))
        .route("/throttled", get(throttled))
        .route("/patient", get(patient))
        .with_state(hits.clone());
    let addr = serve(app).await;
    (format!("http://{addr}"), hits)
}

fn fetcher(base: &str, cancel: CancellationToken) -> AssetFetcher {
    let addr = base.trim_start_matches("http://").parse().unwrap();
    let dir = std::env::temp_dir();
    AssetFetcher::new(reqwest::Client::new(), &test_config(addr, &dir), cancel)
}

#[tokio::test]
async fn test_output_mirrors_input_order() {
    let (base, _) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());

    let descriptors = vec![
        Descriptor::new("a", format!("{base}/delay/150/a"), "text/plain"),
        Descriptor::new("b", format!("{base}/delay/1/b"), "text/plain"),
        Descriptor::new("c", format!("{base}/delay/60/c"), "text/plain"),
    ];
    let fragments = fetcher.fetch_all(descriptors).await.unwrap();

    let paths: Vec<&str> = fragments.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a", "b", "c"]);
    assert_eq!(fragments[1].bytes(), Some(b"body of b".as_slice()));
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_workers() {
    let (base, hits) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());

    let descriptors = (0..8)
        .map(|i| Descriptor::new(format!("{i}"), format!("{base}/delay/40/n{i}"), "text/plain"))
        .collect();
    fetcher.fetch_all(descriptors).await.unwrap();

    // test_config uses two workers
    assert!(hits.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let (base, hits) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());

    let result = fetcher
        .fetch_all(vec![Descriptor::new("page.xhtml", format!("{base}/status/404"), "application/xhtml+xml")])
        .await;

    match result {
        Err(Error::IncompleteAssembly(message)) => assert!(message.contains("page.xhtml")),
        other => panic!("expected IncompleteAssembly, got {other:?}"),
    }
    assert_eq!(hits.count("status-404"), 1);
}

#[tokio::test]
async fn test_server_errors_are_retried_up_to_budget() {
    let (base, hits) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());

    let result = fetcher
        .fetch_all(vec![Descriptor::new("x", format!("{base}/status/502"), "text/plain")])
        .await;

    assert!(matches!(result, Err(Error::IncompleteAssembly(_))));
    assert_eq!(hits.count("status-502"), 3);
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let (base, hits) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());

    let fragments = fetcher
        .fetch_all(vec![
            Descriptor::new("flaky", format!("{base}/flaky"), "text/plain"),
            Descriptor::new("throttled", format!("{base}/throttled"), "text/plain"),
        ])
        .await
        .unwrap();

    assert_eq!(fragments[0].bytes(), Some(b"recovered".as_slice()));
    assert_eq!(fragments[1].bytes(), Some(b"allowed".as_slice()));
    assert_eq!(hits.count("flaky"), 3);
    assert_eq!(hits.count("throttled"), 2);
}

#[tokio::test]
async fn test_optional_resources_are_omitted() {
    let (base, _) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());

    let fragments = fetcher
        .fetch_all(vec![
            Descriptor::new("page", format!("{base}/delay/1/page"), "text/plain"),
            Descriptor::new("cover.jpg", format!("{base}/status/404"), "image/jpeg").optional(),
        ])
        .await
        .unwrap();

    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].status, FetchStatus::Fetched);
    assert_eq!(fragments[1].status, FetchStatus::Omitted);
    assert!(fragments[1].bytes().is_none());
}

#[tokio::test]
async fn test_spooled_bodies_land_on_disk() {
    let (base, _) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());
    let dir = tempfile::tempdir().unwrap();
    let spool = dir.path().join("parts/part-001.mp3");

    let fragments = fetcher
        .fetch_all(vec![
            Descriptor::new("part", format!("{base}/delay/1/part"), "audio/mpeg").spool_to(&spool),
        ])
        .await
        .unwrap();

    assert_eq!(fragments[0].file(), Some(spool.as_path()));
    assert_eq!(std::fs::read(&spool).unwrap(), b"body of part");
}

#[tokio::test]
async fn test_failed_batch_removes_spooled_files() {
    let (base, _) = start().await;
    let fetcher = fetcher(&base, CancellationToken::new());
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.mp3");

    let result = fetcher
        .fetch_all(vec![
            Descriptor::new("good", format!("{base}/delay/1/good"), "audio/mpeg").spool_to(&good),
            Descriptor::new("bad", format!("{base}/status/403"), "audio/mpeg")
                .spool_to(dir.path().join("bad.mp3")),
        ])
        .await;

    assert!(result.is_err());
    assert!(!good.exists());
}

#[tokio::test]
async fn test_cancellation_stops_fetches() {
    let (base, _) = start().await;
    let cancel = CancellationToken::new();
    let fetcher = fetcher(&base, cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = fetcher
        .fetch_all(vec![Descriptor::new("slow", format!("{base}/delay/5000/slow"), "text/plain")])
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_worker_slot_is_free_during_retry_delay() {
    let (base, hits) = start().await;
    let addr = base.trim_start_matches("http://").parse().unwrap();
    let config = loancli::config::Config {
        workers: 1,
        ..test_config(addr, &std::env::temp_dir())
    };
    let fetcher = AssetFetcher::new(reqwest::Client::new(), &config, CancellationToken::new());

    let descriptors = vec![
        Descriptor::new("patient", format!("{base}/patient"), "text/plain"),
        Descriptor::new("b", format!("{base}/delay/1/b"), "text/plain"),
    ];
    let fragments = fetcher.fetch_all(descriptors).await.unwrap();
    assert_eq!(fragments[0].bytes(), Some(b"served".as_slice()));

    // The other resource is fetched while the first one waits out Retry-After
    let order = hits.order.lock().unwrap().clone();
    assert_eq!(order, vec!["patient", "b", "patient"]);
}
