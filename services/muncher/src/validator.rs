//! Label validation: shape, source binding, signature, declared values,
//! expiry. First failing check wins.
//!
//! Signature verification goes through the durable identity cache. When a
//! signature fails, the key is refreshed once with the resolver cache
//! bypassed; the retry only runs if the refreshed key actually differs, so
//! a single rotation is absorbed without masking a broken payload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lm_protocol::{GLOBAL_LABEL_VALUES, Label, LabelerKey, signing};
use tracing::{debug, warn};

use crate::identity::IdentityDirectory;
use crate::service_record::ServiceRecordFetcher;
use crate::state::Store;

/// Outcome of validating one label. `reason` is set iff `valid` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn ok() -> Self {
        Self { valid: true, reason: None }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

pub struct LabelValidator {
    store: Arc<Store>,
    directory: Arc<IdentityDirectory>,
    records: ServiceRecordFetcher,
}

impl LabelValidator {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<IdentityDirectory>,
        records: ServiceRecordFetcher,
    ) -> Self {
        Self { store, directory, records }
    }

    pub async fn validate(&self, label: &Label, expected_did: &str) -> Verdict {
        if let Some(field) = missing_field(label) {
            return Verdict::reject(format!("missing required field {field}"));
        }
        if label.src != expected_did {
            return Verdict::reject("source DID does not match");
        }
        if let Some(verdict) = self.check_signature(label).await {
            return verdict;
        }
        if let Some(verdict) = self.check_declared_value(label).await {
            return verdict;
        }
        if let Some(exp) = &label.exp
            && let Ok(expiry) = DateTime::parse_from_rfc3339(exp)
            && expiry <= Utc::now()
        {
            return Verdict::reject("expired");
        }
        Verdict::ok()
    }

    // -----------------------------------------------------------------------
    // Signature
    // -----------------------------------------------------------------------

    /// `None` means the signature checks out.
    async fn check_signature(&self, label: &Label) -> Option<Verdict> {
        let payload = match signing::signing_bytes(label) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(src = %label.src, error = %e, "could not encode signing payload");
                return Some(Verdict::reject("invalid signature"));
            }
        };
        let sig = label.sig.as_deref().unwrap_or_default();

        let Some(cached_key) = self.signing_key(&label.src, false).await else {
            return Some(Verdict::reject("unable to resolve signing key"));
        };
        if verify_with(&cached_key, &payload, sig) {
            return None;
        }

        // One refresh: retry only against a key that actually rotated.
        let Some(fresh_key) = self.signing_key(&label.src, true).await else {
            return Some(Verdict::reject("unable to resolve signing key"));
        };
        if fresh_key != cached_key && verify_with(&fresh_key, &payload, sig) {
            debug!(src = %label.src, "signature verified after key refresh");
            return None;
        }
        Some(Verdict::reject("invalid signature"))
    }

    /// The publisher's signing key multibase, via the 24 h identity cache.
    ///
    /// `refresh` forces a directory resolution (cache bypassed) and always
    /// rewrites the cache entry.
    async fn signing_key(&self, did: &str, refresh: bool) -> Option<String> {
        if !refresh {
            match self.store.identity(did) {
                Ok(Some(entry)) => return Some(entry.signing_key),
                Ok(None) => {}
                Err(e) => warn!(did = %did, error = %e, "identity cache read failed"),
            }
        }

        let doc = match self.directory.resolve(did, refresh).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(did = %did, error = %e, "identity resolution failed");
                return None;
            }
        };
        let key = doc.labeler_signing_key()?.to_owned();
        if let Err(e) = self.store.set_identity(did, &key, doc.labeler_endpoint()) {
            warn!(did = %did, error = %e, "identity cache write failed");
        }
        Some(key)
    }

    // -----------------------------------------------------------------------
    // Declared values
    // -----------------------------------------------------------------------

    async fn check_declared_value(&self, label: &Label) -> Option<Verdict> {
        let declared = match self.store.service(&label.src) {
            Ok(Some(values)) => values,
            Ok(None) => self.records.declared_values(&label.src).await.unwrap_or_default(),
            Err(e) => {
                warn!(src = %label.src, error = %e, "service cache read failed");
                self.records.declared_values(&label.src).await.unwrap_or_default()
            }
        };
        let allowed = declared.iter().any(|v| v == &label.val)
            || GLOBAL_LABEL_VALUES.contains(&label.val.as_str());
        if allowed {
            None
        } else {
            Some(Verdict::reject("value not in labeler's declared values"))
        }
    }
}

fn missing_field(label: &Label) -> Option<&'static str> {
    if label.src.is_empty() {
        Some("src")
    } else if label.uri.is_empty() {
        Some("uri")
    } else if label.val.is_empty() {
        Some("val")
    } else if label.cts.is_empty() {
        Some("cts")
    } else if label.sig.as_deref().is_none_or(<[u8]>::is_empty) {
        Some("sig")
    } else {
        None
    }
}

fn verify_with(key_multibase: &str, payload: &[u8], sig: &[u8]) -> bool {
    match LabelerKey::parse_multibase(key_multibase) {
        Ok(key) => key.verify(payload, sig),
        Err(e) => {
            warn!(error = %e, "declared signing key is unparseable");
            false
        }
    }
}
