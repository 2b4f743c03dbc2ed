//! Fetches a publisher's declared label values from its PDS record.
//!
//! Failures are reported as `None` and logged; a publisher without a
//! readable service record is simply treated as declaring nothing.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::identity::IdentityDirectory;
use crate::state::Store;

const SERVICE_RECORD_TYPE: &str = "app.bsky.labeler.service";

#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    value: ServiceRecord,
}

#[derive(Debug, Deserialize)]
struct ServiceRecord {
    #[serde(rename = "$type")]
    record_type: String,
    #[serde(default)]
    policies: Option<LabelerPolicies>,
}

#[derive(Debug, Deserialize)]
struct LabelerPolicies {
    #[serde(default, rename = "labelValues")]
    label_values: Vec<String>,
}

pub struct ServiceRecordFetcher {
    directory: Arc<IdentityDirectory>,
    store: Arc<Store>,
    http: reqwest::Client,
}

impl ServiceRecordFetcher {
    pub fn new(directory: Arc<IdentityDirectory>, store: Arc<Store>) -> Self {
        Self { directory, store, http: reqwest::Client::new() }
    }

    /// Fetch `did`'s declared label values and refresh the service cache.
    pub async fn declared_values(&self, did: &str) -> Option<Vec<String>> {
        let doc = match self.directory.resolve(did, false).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(did = %did, error = %e, "identity resolution for service record failed");
                return None;
            }
        };
        let Some(pds) = doc.pds_endpoint() else {
            warn!(did = %did, "identity document has no PDS endpoint");
            return None;
        };

        let url = format!("{}/xrpc/com.atproto.repo.getRecord", pds.trim_end_matches('/'));
        let response = match self
            .http
            .get(&url)
            .query(&[("repo", did), ("collection", SERVICE_RECORD_TYPE), ("rkey", "self")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(response) => response,
            Err(e) => {
                warn!(did = %did, error = %e, "service record fetch failed");
                return None;
            }
        };

        let envelope: RecordEnvelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(did = %did, error = %e, "service record body is not a labeler record");
                return None;
            }
        };
        if envelope.value.record_type != SERVICE_RECORD_TYPE {
            warn!(did = %did, record_type = %envelope.value.record_type, "unexpected record type");
            return None;
        }

        let values = envelope.value.policies.map(|p| p.label_values).unwrap_or_default();
        if let Err(e) = self.store.set_service(did, &values) {
            warn!(did = %did, error = %e, "failed to cache declared values");
        }
        Some(values)
    }
}
