//! Change watcher: invalidates the service-policy cache when a publisher
//! rewrites its labeler service record.
//!
//! Subscribes to the network's filtered change feed for the configured
//! DIDs and the labeler service collection. Runs beside the publisher
//! connections and never touches label processing; invalidation is
//! observed by the next validation that reads the service cache.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::state::Store;

const SERVICE_COLLECTION: &str = "app.bsky.labeler.service";
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ChangeEvent {
    did: String,
    kind: String,
    #[serde(default)]
    commit: Option<CommitInfo>,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    operation: String,
    #[serde(default)]
    collection: Option<String>,
}

pub struct ChangeWatcher {
    store: Arc<Store>,
    endpoint: String,
    dids: Vec<String>,
    watched: HashSet<String>,
}

impl ChangeWatcher {
    pub fn new(store: Arc<Store>, endpoint: String, dids: Vec<String>) -> Self {
        let watched = dids.iter().cloned().collect();
        Self { store, endpoint, dids, watched }
    }

    /// Run until shutdown, reconnecting with capped linear backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = self.subscribe_url();
        let mut attempts: u32 = 0;
        while !*shutdown.borrow() {
            match connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    attempts = 0;
                    info!(publishers = self.dids.len(), "change feed connected");
                    if self.read_loop(ws, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "change feed connect failed"),
            }

            attempts += 1;
            let delay = (RECONNECT_BASE * attempts).min(RECONNECT_CAP);
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
        info!("change watcher closed");
    }

    /// Returns true on shutdown, false on disconnect.
    async fn read_loop<W>(&self, mut ws: W, shutdown: &mut watch::Receiver<bool>) -> bool
    where
        W: futures_util::Stream<
                Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return true;
                    }
                }
                msg = ws.next() => {
                    match msg {
                        None | Some(Ok(Message::Close(_))) => return false,
                        Some(Err(e)) => {
                            warn!(error = %e, "change feed error");
                            return false;
                        }
                        Some(Ok(Message::Text(text))) => self.handle_event(&text),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    fn handle_event(&self, text: &str) {
        let event: ChangeEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "unparseable change event");
                return;
            }
        };
        if event.kind != "commit" || !self.watched.contains(&event.did) {
            return;
        }
        let Some(commit) = event.commit else { return };
        if !matches!(commit.operation.as_str(), "create" | "update") {
            return;
        }
        if commit.collection.as_deref().is_some_and(|c| c != SERVICE_COLLECTION) {
            return;
        }

        info!(did = %event.did, operation = %commit.operation, "service record changed; invalidating cache");
        if let Err(e) = self.store.invalidate_service(&event.did) {
            warn!(did = %event.did, error = %e, "service cache invalidation failed");
        }
    }

    fn subscribe_url(&self) -> String {
        let mut url = format!("{}?wantedCollections={SERVICE_COLLECTION}", self.endpoint);
        for did in &self.dids {
            url.push_str("&wantedDids=");
            url.push_str(did);
        }
        url
    }
}
