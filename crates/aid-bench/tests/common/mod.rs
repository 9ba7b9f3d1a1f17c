//! In-process mock of the remote option endpoints.

#![allow(dead_code)]

use aid_proto::config::{ApiConfig, Config, EndpointConfig, PipelineConfig, StoreConfig};
use aid_proto::protocol::API_KEY_HEADER;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    style_hits: AtomicUsize,
    room_hits: AtomicUsize,
    code: AtomicI64,
    delay_ms: AtomicU64,
    last_key: Mutex<Option<String>>,
}

/// Serves `GET /api/open/v1/sd_params/options/{style,room}` on a random
/// local port.  Every response is an envelope with the configured code.
pub struct MockApi {
    pub endpoint: String,
    state: Arc<MockState>,
}

impl MockApi {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            code: AtomicI64::new(200),
            ..Default::default()
        });

        let app = Router::new()
            .route("/api/open/v1/sd_params/options/style", get(style))
            .route("/api/open/v1/sd_params/options/room", get(room))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            endpoint: format!("http://{}/api/open/v1", addr),
            state,
        }
    }

    pub fn set_code(&self, code: i64) {
        self.state.code.store(code, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn style_hits(&self) -> usize {
        self.state.style_hits.load(Ordering::SeqCst)
    }

    pub fn room_hits(&self) -> usize {
        self.state.room_hits.load(Ordering::SeqCst)
    }

    pub fn last_key(&self) -> Option<String> {
        self.state.last_key.lock().unwrap().clone()
    }
}

pub fn style_items() -> Value {
    json!([
        { "label": "Modern", "value": "modern" },
        { "label": "Scandinavian", "value": "scandinavian" },
    ])
}

pub fn room_items() -> Value {
    json!([
        { "label": "Living room", "value": "living_room" },
        { "label": "Kitchen", "value": "kitchen" },
        { "label": "Bathroom", "value": "bathroom" },
    ])
}

async fn respond(state: &MockState, headers: &HeaderMap, items: Value) -> Json<Value> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_key.lock().unwrap() = key;

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let code = state.code.load(Ordering::SeqCst);
    if code == 200 {
        let total = items.as_array().map(|a| a.len()).unwrap_or(0);
        Json(json!({ "code": code, "data": { "data": items, "total": total } }))
    } else {
        Json(json!({ "code": code, "data": null, "message": "internal error" }))
    }
}

async fn style(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Json<Value> {
    state.style_hits.fetch_add(1, Ordering::SeqCst);
    respond(&state, &headers, style_items()).await
}

async fn room(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Json<Value> {
    state.room_hits.fetch_add(1, Ordering::SeqCst);
    respond(&state, &headers, room_items()).await
}

/// A config pointing at `mock` (as the default endpoint `mock`) with an
/// `empty` endpoint nothing is ever stored for, storage under `dir`, and a
/// short debounce window.
pub fn test_config(mock: &MockApi, dir: &Path) -> Config {
    Config {
        store: StoreConfig {
            db_path: dir.join("bench.sqlite3"),
            preview_dir: dir.join("previews"),
        },
        api: ApiConfig {
            endpoints: vec![
                EndpointConfig {
                    name: "mock".to_string(),
                    url: mock.endpoint.clone(),
                },
                EndpointConfig {
                    name: "empty".to_string(),
                    url: format!("{}/empty", mock.endpoint),
                },
            ],
            default_endpoint: "mock".to_string(),
            request_timeout_secs: 5,
            connect_timeout_secs: 5,
        },
        pipeline: PipelineConfig {
            debounce_ms: 20,
            queue_depth: 4,
        },
        upload: Default::default(),
    }
}
