//! Service configuration from environment variables.
//!
//! # Required keys
//! - `DATABASE_URL` — connection string for the label sink
//! - `LABELER_DIDS` — comma-separated publisher DIDs (at least one)
//!
//! # Takedown propagation
//! `MOD_SERVICE_DID` is optional; when set, `DATAPLANE_URLS` becomes
//! required and that publisher's `!takedown` labels are forwarded to the
//! moderation dataplane.

use std::path::PathBuf;

const DEFAULT_SCHEMA: &str = "bsky";
const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";
const DEFAULT_STATE_PATH: &str = "./muncher-state.sqlite";
const DEFAULT_CHANGE_FEED: &str = "wss://jetstream1.us-east.bsky.network/subscribe";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Schema namespace holding the `label` table.
    pub database_schema: String,
    /// Publishers to subscribe to, deduplicated in configured order.
    pub labeler_dids: Vec<String>,
    pub plc_directory_url: String,
    /// On-disk SQLite file backing cursors and caches.
    pub state_path: PathBuf,
    /// Trusted moderation publisher; its `!takedown` labels reach the dataplane.
    pub mod_service_did: Option<String>,
    pub dataplane: Option<DataplaneConfig>,
    pub change_feed_url: String,
}

#[derive(Debug, Clone)]
pub struct DataplaneConfig {
    pub urls: Vec<String>,
    pub http_version: HttpVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1,
    Http2,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {detail}")]
    InvalidValue { key: &'static str, detail: String },
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = require(&lookup, "DATABASE_URL")?;
        let database_schema =
            lookup("DATABASE_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_owned());

        let labeler_dids = parse_list(&require(&lookup, "LABELER_DIDS")?);
        if labeler_dids.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "LABELER_DIDS",
                detail: "at least one publisher DID is required".to_owned(),
            });
        }

        let mod_service_did = lookup("MOD_SERVICE_DID").filter(|v| !v.trim().is_empty());
        let dataplane = match &mod_service_did {
            Some(_) => {
                let urls = parse_list(&require(&lookup, "DATAPLANE_URLS")?);
                if urls.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "DATAPLANE_URLS",
                        detail: "required when MOD_SERVICE_DID is set".to_owned(),
                    });
                }
                let http_version = match lookup("DATAPLANE_HTTP_VERSION").as_deref() {
                    None | Some("1.1") => HttpVersion::Http1,
                    Some("2") => HttpVersion::Http2,
                    Some(other) => {
                        return Err(ConfigError::InvalidValue {
                            key: "DATAPLANE_HTTP_VERSION",
                            detail: format!("must be \"1.1\" or \"2\", got \"{other}\""),
                        });
                    }
                };
                Some(DataplaneConfig { urls, http_version })
            }
            None => {
                // Still reject a bad HTTP version even when unused.
                match lookup("DATAPLANE_HTTP_VERSION").as_deref() {
                    None | Some("1.1") | Some("2") => None,
                    Some(other) => {
                        return Err(ConfigError::InvalidValue {
                            key: "DATAPLANE_HTTP_VERSION",
                            detail: format!("must be \"1.1\" or \"2\", got \"{other}\""),
                        });
                    }
                }
            }
        };

        Ok(Config {
            database_url,
            database_schema,
            labeler_dids,
            plc_directory_url: lookup("PLC_DIRECTORY_URL")
                .unwrap_or_else(|| DEFAULT_PLC_DIRECTORY.to_owned()),
            state_path: PathBuf::from(
                lookup("STATE_PATH").unwrap_or_else(|| DEFAULT_STATE_PATH.to_owned()),
            ),
            mod_service_did,
            dataplane,
            change_feed_url: lookup("CHANGE_FEED_URL")
                .unwrap_or_else(|| DEFAULT_CHANGE_FEED.to_owned()),
        })
    }
}

fn require(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key).filter(|v| !v.trim().is_empty()).ok_or(ConfigError::MissingKey(key))
}

/// Split a comma-separated list, trimming entries and dropping duplicates
/// while preserving configured order.
fn parse_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if !entry.is_empty() && !out.iter().any(|e| e == entry) {
            out.push(entry.to_owned());
        }
    }
    out
}
