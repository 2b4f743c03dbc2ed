// mock_pds: Serves `com.atproto.repo.getRecord` for labeler service
// records with per-publisher declared label values.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

#[derive(Clone, Default)]
struct PdsState {
    values: Arc<RwLock<HashMap<String, Vec<String>>>>,
    hits: Arc<AtomicUsize>,
}

pub struct MockPds {
    addr: SocketAddr,
    state: PdsState,
    _task: tokio::task::JoinHandle<()>,
}

impl MockPds {
    pub async fn start() -> Self {
        let state = PdsState::default();
        let router = axum::Router::new()
            .route("/xrpc/com.atproto.repo.getRecord", get(serve_record))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        Self { addr, state, _task: task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Declare the label values served for `did`'s service record.
    pub fn set_label_values(&self, did: &str, values: &[&str]) {
        self.state
            .values
            .write()
            .unwrap()
            .insert(did.to_owned(), values.iter().map(|v| (*v).to_owned()).collect());
    }

    /// Total record fetches received.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::Relaxed)
    }
}

async fn serve_record(
    State(state): State<PdsState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.hits.fetch_add(1, Ordering::Relaxed);
    let Some(repo) = params.get("repo") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if params.get("collection").map(String::as_str) != Some("app.bsky.labeler.service")
        || params.get("rkey").map(String::as_str) != Some("self")
    {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.values.read().unwrap().get(repo) {
        Some(values) => Json(serde_json::json!({
            "uri": format!("at://{repo}/app.bsky.labeler.service/self"),
            "value": {
                "$type": "app.bsky.labeler.service",
                "policies": { "labelValues": values },
                "createdAt": "2024-01-01T00:00:00Z",
            },
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
