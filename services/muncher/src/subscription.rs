//! Per-publisher subscription: WebSocket lifecycle, frame handling,
//! cursor persistence, and backoff reconnect.
//!
//! The receive path is strictly sequential: a labels frame is fully
//! processed before the next message is read, so cursor and sink writes
//! for one publisher are ordered. The cursor is persisted *before* the
//! frame's labels are handled; a crash mid-batch replays the whole frame
//! on restart rather than skipping it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use lm_protocol::{FrameError, LabelsFrame, SubscriptionFrame, decode_frame};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::identity::{IdentityDirectory, ResolveError};
use crate::sink::{LabelRow, LabelStore};
use crate::state::Store;
use crate::takedown::TakedownDispatcher;
use crate::validator::LabelValidator;

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

enum ReadOutcome {
    Shutdown,
    Disconnected,
}

pub struct PublisherConnection<S: LabelStore> {
    did: String,
    store: Arc<Store>,
    directory: Arc<IdentityDirectory>,
    validator: Arc<LabelValidator>,
    sink: Arc<S>,
    takedowns: Option<Arc<TakedownDispatcher>>,
    connected: Arc<AtomicBool>,
    reconnect_base: Duration,
    max_attempts: u32,
}

impl<S: LabelStore> PublisherConnection<S> {
    pub fn new(
        did: String,
        store: Arc<Store>,
        directory: Arc<IdentityDirectory>,
        validator: Arc<LabelValidator>,
        sink: Arc<S>,
        takedowns: Option<Arc<TakedownDispatcher>>,
    ) -> Self {
        Self {
            did,
            store,
            directory,
            validator,
            sink,
            takedowns,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_base: RECONNECT_BASE,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }

    /// Shrink the backoff schedule (integration tests).
    pub fn with_reconnect(mut self, base: Duration, max_attempts: u32) -> Self {
        self.reconnect_base = base;
        self.max_attempts = max_attempts;
        self
    }

    /// Live view of the connection flag, for status snapshots.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Drive the subscription until shutdown or the retry budget is spent.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;
        while !*shutdown.borrow() {
            let endpoint = match self.endpoint().await {
                Ok(Some(endpoint)) => Some(endpoint),
                Ok(None) => {
                    error!(did = %self.did, "identity has no labeler endpoint; giving up");
                    return;
                }
                Err(e) => {
                    warn!(did = %self.did, error = %e, "identity resolution failed");
                    None
                }
            };

            if let Some(endpoint) = endpoint {
                // Reconnects resume from the latest persisted cursor, not the
                // one read at initial connect.
                let cursor = match self.store.cursor(&self.did) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        error!(did = %self.did, error = %e, "cursor read failed; replaying from 0");
                        0
                    }
                };
                let url = subscribe_url(&endpoint, cursor);
                match connect_async(url.as_str()).await {
                    Ok((ws, _response)) => {
                        attempts = 0;
                        self.connected.store(true, Ordering::Relaxed);
                        info!(did = %self.did, cursor, "label subscription open");
                        let outcome = self.read_loop(ws, &mut shutdown).await;
                        self.connected.store(false, Ordering::Relaxed);
                        if matches!(outcome, ReadOutcome::Shutdown) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(did = %self.did, error = %e, "subscription connect failed");
                    }
                }
            }

            attempts += 1;
            if attempts > self.max_attempts {
                error!(did = %self.did, attempts, "reconnect attempts exhausted; publisher abandoned");
                return;
            }
            let delay = self.reconnect_base * attempts;
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
        info!(did = %self.did, "label subscription closed");
    }

    /// The subscription base URL, preferring the cached identity.
    async fn endpoint(&self) -> Result<Option<String>, ResolveError> {
        if let Ok(Some(entry)) = self.store.identity(&self.did)
            && entry.labeler_endpoint.is_some()
        {
            return Ok(entry.labeler_endpoint);
        }
        let doc = self.directory.resolve(&self.did, false).await?;
        let endpoint = doc.labeler_endpoint().map(str::to_owned);
        if let Some(key) = doc.labeler_signing_key()
            && let Err(e) = self.store.set_identity(&self.did, key, endpoint.as_deref())
        {
            warn!(did = %self.did, error = %e, "identity cache write failed");
        }
        Ok(endpoint)
    }

    async fn read_loop<W>(&self, mut ws: W, shutdown: &mut watch::Receiver<bool>) -> ReadOutcome
    where
        W: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = ws.close().await;
                        return ReadOutcome::Shutdown;
                    }
                }
                msg = ws.next() => {
                    match msg {
                        None => return ReadOutcome::Disconnected,
                        Some(Err(e)) => {
                            warn!(did = %self.did, error = %e, "websocket error");
                            return ReadOutcome::Disconnected;
                        }
                        Some(Ok(Message::Binary(data))) => self.handle_frame(&data).await,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => return ReadOutcome::Disconnected,
                        Some(Ok(other)) => debug!(did = %self.did, ?other, "ignoring message"),
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, data: &[u8]) {
        match decode_frame(data) {
            Ok(SubscriptionFrame::Labels(frame)) => self.handle_labels(frame).await,
            Ok(SubscriptionFrame::Info(info)) => {
                info!(did = %self.did, name = %info.name, message = ?info.message, "stream info");
            }
            Err(FrameError::ErrorFrame { error, message }) => {
                warn!(did = %self.did, error = %error, message = ?message, "stream error frame");
            }
            Err(e) => {
                warn!(did = %self.did, error = %e, "dropping undecodable frame");
            }
        }
    }

    async fn handle_labels(&self, frame: LabelsFrame) {
        // Cursor first: the publisher attested the sequence, so it advances
        // even when individual labels are rejected below.
        if let Err(e) = self.store.set_cursor(&self.did, frame.seq) {
            error!(did = %self.did, seq = frame.seq, error = %e, "cursor persist failed");
        }

        for label in &frame.labels {
            let verdict = self.validator.validate(label, &self.did).await;
            if !verdict.valid {
                warn!(
                    did = %self.did,
                    uri = %label.uri,
                    val = %label.val,
                    reason = verdict.reason.as_deref().unwrap_or("unknown"),
                    "label rejected"
                );
                continue;
            }
            if let Err(e) = self.sink.insert(LabelRow::from_label(label)).await {
                error!(did = %self.did, uri = %label.uri, error = %e, "label insert failed");
                continue;
            }
            if let Some(takedowns) = &self.takedowns
                && takedowns.applies(label)
            {
                takedowns.dispatch(label).await;
            }
        }
    }
}

/// Map the labeler's HTTP endpoint to the cursor-carrying subscription URL.
fn subscribe_url(endpoint: &str, cursor: i64) -> String {
    let base = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_owned()
    };
    format!(
        "{}/xrpc/com.atproto.label.subscribeLabels?cursor={cursor}",
        base.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_url_maps_schemes_and_carries_cursor() {
        assert_eq!(
            subscribe_url("https://labeler.example", 5),
            "wss://labeler.example/xrpc/com.atproto.label.subscribeLabels?cursor=5"
        );
        assert_eq!(
            subscribe_url("http://127.0.0.1:4000/", 0),
            "ws://127.0.0.1:4000/xrpc/com.atproto.label.subscribeLabels?cursor=0"
        );
        assert_eq!(
            subscribe_url("wss://already.example", 7),
            "wss://already.example/xrpc/com.atproto.label.subscribeLabels?cursor=7"
        );
    }
}
