//! Composite DID resolver for the `plc` and `web` methods.
//!
//! A small in-memory document cache (60 s) with per-DID single-flight sits
//! in front of the callers' durable 24 h cache, so a burst of concurrent
//! validations for one publisher produces a single directory request.
//! `no_cache` bypasses the in-memory layer and repopulates it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

const DOC_CACHE_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default, rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(default, rename = "publicKeyMultibase")]
    pub public_key_multibase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidService {
    pub id: String,
    /// May be a string URL or a richer object; only string endpoints count.
    #[serde(default, rename = "serviceEndpoint")]
    pub service_endpoint: serde_json::Value,
}

impl DidDocument {
    /// The labeler signing key: verification method `…#atproto_label`.
    pub fn labeler_signing_key(&self) -> Option<&str> {
        self.verification_method
            .iter()
            .find(|m| m.id.ends_with("#atproto_label"))
            .and_then(|m| m.public_key_multibase.as_deref())
    }

    /// The label subscription base URL: service `…#atproto_labeler`.
    pub fn labeler_endpoint(&self) -> Option<&str> {
        self.string_endpoint("#atproto_labeler")
    }

    /// The publisher's PDS host: service `…#atproto_pds`.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.string_endpoint("#atproto_pds")
    }

    fn string_endpoint(&self, id_suffix: &str) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.ends_with(id_suffix))
            .and_then(|s| s.service_endpoint.as_str())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unsupported DID method: {0}")]
    UnsupportedMethod(String),
    #[error("invalid did:web domain: {0}")]
    InvalidDomain(String),
    #[error("directory request: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct IdentityDirectory {
    http: reqwest::Client,
    plc_url: String,
    docs: StdMutex<HashMap<String, (Instant, Arc<DidDocument>)>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityDirectory {
    pub fn new(plc_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            plc_url,
            docs: StdMutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `did` to its document.
    ///
    /// `no_cache` skips the in-memory layer; refresh paths pass `true` so a
    /// rotated key is observed immediately.
    pub async fn resolve(
        &self,
        did: &str,
        no_cache: bool,
    ) -> Result<Arc<DidDocument>, ResolveError> {
        if !no_cache && let Some(doc) = self.cached(did) {
            return Ok(doc);
        }

        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(did.to_owned()).or_default().clone()
        };
        let _guard = slot.lock().await;

        // A concurrent resolution may have landed while waiting on the slot.
        if !no_cache && let Some(doc) = self.cached(did) {
            return Ok(doc);
        }

        let doc = Arc::new(self.fetch(did).await?);
        self.docs.lock().unwrap().insert(did.to_owned(), (Instant::now(), doc.clone()));
        Ok(doc)
    }

    fn cached(&self, did: &str) -> Option<Arc<DidDocument>> {
        let docs = self.docs.lock().unwrap();
        docs.get(did)
            .filter(|(at, _)| at.elapsed() <= DOC_CACHE_TTL)
            .map(|(_, doc)| doc.clone())
    }

    async fn fetch(&self, did: &str) -> Result<DidDocument, ResolveError> {
        let url = if did.starts_with("did:plc:") {
            format!("{}/{did}", self.plc_url.trim_end_matches('/'))
        } else if let Some(domain) = did.strip_prefix("did:web:") {
            if !is_valid_domain(domain) {
                return Err(ResolveError::InvalidDomain(domain.to_owned()));
            }
            format!("https://{domain}/.well-known/did.json")
        } else {
            return Err(ResolveError::UnsupportedMethod(did.to_owned()));
        };

        let doc = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<DidDocument>()
            .await?;
        Ok(doc)
    }
}

/// DNS hostname shape check for `did:web` identifiers.
fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
