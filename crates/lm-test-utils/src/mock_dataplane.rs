// mock_dataplane: Records takedown RPC calls and answers 200.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::post;

/// One captured RPC: method name and JSON body.
pub type RecordedCall = (String, serde_json::Value);

#[derive(Clone, Default)]
struct DataplaneState {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

pub struct MockDataplane {
    addr: SocketAddr,
    state: DataplaneState,
    _task: tokio::task::JoinHandle<()>,
}

impl MockDataplane {
    pub async fn start() -> Self {
        let state = DataplaneState::default();
        let router = axum::Router::new()
            .route("/bsky.Service/{method}", post(record_call))
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

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }
}

async fn record_call(
    State(state): State<DataplaneState>,
    Path(method): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    state.calls.lock().unwrap().push((method, body));
    Json(serde_json::json!({}))
}
