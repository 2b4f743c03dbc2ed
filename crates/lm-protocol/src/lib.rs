// lm-protocol: Wire contract of the label subscription stream.
//
// A subscription message is two consecutive DAG-CBOR values: a header
// `{t, op}` followed by a typed body. `op == 1` carries a normal frame
// whose body type is selected by `t` (`#labels`, `#info`); `op == -1`
// carries an error body and terminates the frame.

use std::io;

use serde::{Deserialize, Serialize};

pub mod signing;

pub use signing::{KeyError, LabelerKey};

/// Label values every publisher may emit without declaring them.
///
/// Matches the downstream AppView's accepted defaults.
pub const GLOBAL_LABEL_VALUES: [&str; 5] = ["porn", "sexual", "nudity", "graphic-media", "gore"];

// ---------------------------------------------------------------------------
// Label
// ---------------------------------------------------------------------------

/// A signed moderation label as carried on the wire.
///
/// `src` is the publisher DID; `uri` the subject (a DID for account-level
/// labels, an `at://` URI for record-level labels). `sig` is the raw
/// compact ECDSA signature over [`signing::signing_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<i64>,
    pub src: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub val: String,
    /// True when this label retracts a previous assertion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neg: Option<bool>,
    /// Creation timestamp, ISO 8601.
    pub cts: String,
    /// Expiry timestamp, ISO 8601; absent means the label does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub sig: Option<Vec<u8>>,
}

/// A `#labels` frame: all labels attested up to sequence `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsFrame {
    pub seq: i64,
    pub labels: Vec<Label>,
}

/// A `#info` frame: advisory only, logged and not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoFrame {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of an `op == -1` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    #[serde(rename = "t", default)]
    type_: String,
    #[serde(rename = "op")]
    op: i8,
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// A decoded subscription frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFrame {
    Labels(LabelsFrame),
    Info(InfoFrame),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("header: {0}")]
    Header(#[from] ciborium::de::Error<io::Error>),
    #[error("body: {0}")]
    Body(#[from] serde_ipld_dagcbor::DecodeError<io::Error>),
    #[error("trailing bytes after frame body")]
    TrailingBytes,
    #[error("stream error frame: {error}: {message:?}")]
    ErrorFrame { error: String, message: Option<String> },
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("unknown frame op: {0}")]
    UnknownOp(i8),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("header: {0}")]
    Header(#[from] ciborium::ser::Error<io::Error>),
    #[error("body: {0}")]
    Body(#[from] serde_ipld_dagcbor::EncodeError<io::Error>),
}

/// Decode a binary subscription message into a frame.
///
/// Bytes remaining after the body are a protocol violation; the caller
/// drops the frame. Error frames and unrecognized types/ops surface as
/// [`FrameError`] variants so the connection can log and skip them.
pub fn decode_frame(data: &[u8]) -> Result<SubscriptionFrame, FrameError> {
    let mut reader = io::Cursor::new(data);

    let header: FrameHeader = ciborium::de::from_reader(&mut reader)?;
    match header.op {
        1 => {}
        -1 => {
            let body: ErrorBody = serde_ipld_dagcbor::from_reader(&mut reader)?;
            return Err(FrameError::ErrorFrame { error: body.error, message: body.message });
        }
        other => return Err(FrameError::UnknownOp(other)),
    }

    let frame = match header.type_.as_str() {
        "#labels" => SubscriptionFrame::Labels(serde_ipld_dagcbor::from_reader(&mut reader)?),
        "#info" => SubscriptionFrame::Info(serde_ipld_dagcbor::from_reader(&mut reader)?),
        _ => return Err(FrameError::UnknownType(header.type_)),
    };

    if reader.position() as usize != data.len() {
        return Err(FrameError::TrailingBytes);
    }
    Ok(frame)
}

impl SubscriptionFrame {
    /// Encode into the two-value binary message format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::Labels(body) => encode_frame("#labels", 1, body),
            Self::Info(body) => encode_frame("#info", 1, body),
        }
    }
}

/// Encode an `op == -1` error message.
pub fn encode_error_frame(error: &str, message: Option<&str>) -> Result<Vec<u8>, EncodeError> {
    let body = ErrorBody { error: error.to_owned(), message: message.map(str::to_owned) };
    encode_frame("", -1, &body)
}

fn encode_frame<B: Serialize>(type_: &str, op: i8, body: &B) -> Result<Vec<u8>, EncodeError> {
    let mut writer = io::Cursor::new(Vec::new());
    let header = FrameHeader { type_: type_.to_owned(), op };
    ciborium::ser::into_writer(&header, &mut writer)?;
    serde_ipld_dagcbor::to_writer(&mut writer, body)?;
    Ok(writer.into_inner())
}

// ---------------------------------------------------------------------------
// Takedown reference
// ---------------------------------------------------------------------------

/// Deterministic moderation reference derived from a label's `cts`.
///
/// Every non-alphanumeric character is stripped so the same label always
/// maps to the same dataplane reference.
pub fn takedown_ref(cts: &str) -> String {
    let stripped: String = cts.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("BSKY-TAKEDOWN-{stripped}")
}
