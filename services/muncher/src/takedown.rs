//! Takedown propagation to the moderation dataplane.
//!
//! Only `!takedown` labels from the configured trusted publisher are
//! dispatched. The label row is already in the sink by the time this runs;
//! dataplane failures are logged and swallowed, never retried.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{SecondsFormat, Utc};
use lm_protocol::{Label, takedown_ref};
use serde_json::json;
use tracing::{error, warn};

use crate::config::{DataplaneConfig, HttpVersion};

pub const TAKEDOWN_VALUE: &str = "!takedown";

#[derive(Debug, thiserror::Error)]
pub enum DataplaneError {
    #[error("rpc: {0}")]
    Http(#[from] reqwest::Error),
}

/// Round-robin client over the configured dataplane hosts.
pub struct DataplaneClient {
    http: reqwest::Client,
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl DataplaneClient {
    pub fn new(config: &DataplaneConfig) -> Result<Self, reqwest::Error> {
        let builder = match config.http_version {
            HttpVersion::Http1 => reqwest::Client::builder().http1_only(),
            HttpVersion::Http2 => reqwest::Client::builder().http2_prior_knowledge(),
        };
        Ok(Self { http: builder.build()?, hosts: config.urls.clone(), next: AtomicUsize::new(0) })
    }

    pub async fn takedown_actor(
        &self,
        did: &str,
        moderation_ref: &str,
        seen: &str,
    ) -> Result<(), DataplaneError> {
        self.call("TakedownActor", &json!({ "did": did, "ref": moderation_ref, "seen": seen }))
            .await
    }

    pub async fn untakedown_actor(&self, did: &str, seen: &str) -> Result<(), DataplaneError> {
        self.call("UntakedownActor", &json!({ "did": did, "seen": seen })).await
    }

    pub async fn takedown_record(
        &self,
        record_uri: &str,
        moderation_ref: &str,
        seen: &str,
    ) -> Result<(), DataplaneError> {
        self.call(
            "TakedownRecord",
            &json!({ "recordUri": record_uri, "ref": moderation_ref, "seen": seen }),
        )
        .await
    }

    pub async fn untakedown_record(
        &self,
        record_uri: &str,
        seen: &str,
    ) -> Result<(), DataplaneError> {
        self.call("UntakedownRecord", &json!({ "recordUri": record_uri, "seen": seen })).await
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<(), DataplaneError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        let url = format!("{}/bsky.Service/{method}", self.hosts[index].trim_end_matches('/'));
        self.http.post(&url).json(body).send().await?.error_for_status()?;
        Ok(())
    }
}

pub struct TakedownDispatcher {
    client: DataplaneClient,
    mod_service_did: String,
}

impl TakedownDispatcher {
    pub fn new(client: DataplaneClient, mod_service_did: String) -> Self {
        Self { client, mod_service_did }
    }

    /// Whether `label` is a takedown from the trusted moderation publisher.
    pub fn applies(&self, label: &Label) -> bool {
        label.src == self.mod_service_did && label.val == TAKEDOWN_VALUE
    }

    /// Translate the label into the matching dataplane call.
    pub async fn dispatch(&self, label: &Label) {
        let moderation_ref = takedown_ref(&label.cts);
        let seen = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let negated = label.neg.unwrap_or(false);

        let outcome = if label.uri.starts_with("did:") {
            if negated {
                self.client.untakedown_actor(&label.uri, &seen).await
            } else {
                self.client.takedown_actor(&label.uri, &moderation_ref, &seen).await
            }
        } else if label.uri.starts_with("at://") {
            if negated {
                self.client.untakedown_record(&label.uri, &seen).await
            } else {
                self.client.takedown_record(&label.uri, &moderation_ref, &seen).await
            }
        } else {
            error!(uri = %label.uri, "takedown subject is neither an actor nor a record");
            return;
        };

        if let Err(e) = outcome {
            warn!(uri = %label.uri, error = %e, "dataplane takedown call failed");
        }
    }
}
