// mock_directory: An in-process PLC directory serving configurable
// identity documents at `GET /{did}`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

#[derive(Clone, Default)]
struct DirectoryState {
    docs: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    hits: Arc<AtomicUsize>,
}

pub struct MockDirectory {
    addr: SocketAddr,
    state: DirectoryState,
    _task: tokio::task::JoinHandle<()>,
}

impl MockDirectory {
    pub async fn start() -> Self {
        let state = DirectoryState::default();
        let router = axum::Router::new()
            .route("/{did}", get(serve_doc))
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

    /// Install or replace the document served for `did`.
    pub fn set_document(&self, did: &str, doc: serde_json::Value) {
        self.state.docs.write().unwrap().insert(did.to_owned(), doc);
    }

    /// Total resolution requests received.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::Relaxed)
    }
}

async fn serve_doc(State(state): State<DirectoryState>, Path(did): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::Relaxed);
    match state.docs.read().unwrap().get(&did) {
        Some(doc) => Json(doc.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
