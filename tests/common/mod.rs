#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use loancli::{config::Config, management::Session};
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// Starts `app` on an ephemeral local port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A configuration pointing every service at `addr`, with fast retries.
pub fn test_config(addr: SocketAddr, settings_dir: &Path) -> Config {
    Config {
        libby_api_url: format!("http://{addr}"),
        thunder_api_url: format!("http://{addr}"),
        settings_dir: settings_dir.to_path_buf(),
        workers: 2,
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        request_timeout: Duration::from_secs(5),
        code_attempts: 3,
        ..Config::default()
    }
}

/// Writes a linked session so `LibbyClient::connect` succeeds.
pub async fn write_session(config: &Config) {
    let store = loancli::management::SessionStore::new(config.settings_file());
    let mut session = Session::new("chip-1".into(), "identity-linked".into());
    session.sync_code = Some("12345678".into());
    store.save(&session).await.unwrap();
}

/// Counters and switches of the mock Libby service.
#[derive(Clone)]
pub struct MockLibby {
    pub registrations: Arc<AtomicUsize>,
    pub liveness_checks: Arc<AtomicUsize>,
    pub exchanges: Arc<AtomicUsize>,
    pub cards: usize,
    pub accept_code: bool,
    pub unauthorized: bool,
    pub loans: Arc<Vec<Value>>,
}

impl Default for MockLibby {
    fn default() -> Self {
        Self {
            registrations: Arc::default(),
            liveness_checks: Arc::default(),
            exchanges: Arc::default(),
            cards: 1,
            accept_code: true,
            unauthorized: false,
            loans: Arc::new(Vec::new()),
        }
    }
}

impl MockLibby {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

async fn register(State(mock): State<MockLibby>) -> Json<Value> {
    mock.registrations.fetch_add(1, Ordering::SeqCst);
    Json(json!({"chip": "chip-1", "identity": "identity-new"}))
}

async fn liveness(State(mock): State<MockLibby>) -> Response {
    mock.liveness_checks.fetch_add(1, Ordering::SeqCst);
    if mock.unauthorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"result": "unauthorized"})),
        )
            .into_response();
    }
    Json(json!({"chip": "chip-1", "identity": "identity-linked"})).into_response()
}

async fn issue_code() -> Json<Value> {
    Json(json!({"code": "87654321", "expiry": 60}))
}

async fn exchange_code(State(mock): State<MockLibby>, Json(body): Json<Value>) -> Response {
    mock.exchanges.fetch_add(1, Ordering::SeqCst);
    if mock.accept_code && body["code"] == json!("12345678") {
        Json(json!({"result": "cloned"})).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"result": "code_not_found", "message": "The code has expired."})),
        )
            .into_response()
    }
}

async fn sync(State(mock): State<MockLibby>) -> Json<Value> {
    let cards: Vec<Value> = (0..mock.cards)
        .map(|i| json!({"cardId": format!("{}", 100 + i), "cardName": "Main", "library": {"name": "Public Library"}}))
        .collect();
    Json(json!({
        "result": "synchronized",
        "cards": cards,
        "loans": mock.loans.as_ref(),
    }))
}

/// Routes of the auth and sync endpoints.
pub fn libby_routes(mock: MockLibby) -> Router {
    Router::new()
        .route("/chip", post(register).get(liveness))
        .route("/chip/clone/code", get(issue_code).post(exchange_code))
        .route("/chip/sync", get(sync))
        .with_state(mock)
}

/// A loan record as returned by the sync endpoint.
pub fn loan_json(id: &str, type_id: &str, formats: &[&str]) -> Value {
    json!({
        "id": id,
        "title": format!("Title {id}"),
        "type": {"id": type_id, "name": type_id},
        "cardId": "100",
        "firstCreatorName": "Jane Author",
        "formats": formats.iter().map(|f| json!({"id": f, "isLockedIn": false})).collect::<Vec<_>>(),
        "checkoutDate": "2024-01-01T00:00:00Z",
        "expireDate": "2024-01-22T00:00:00Z",
    })
}

const MP3_FRAME_HEADER: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];

/// `n` silent MPEG-1 Layer III frames (128 kbps, 44.1 kHz, 417 bytes each).
pub fn mp3_frames(n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n * 417);
    for _ in 0..n {
        out.extend_from_slice(&MP3_FRAME_HEADER);
        out.extend(std::iter::repeat_n(0u8, 413));
    }
    out
}
