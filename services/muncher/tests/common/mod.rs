#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lm_protocol::Label;
use muncher::sink::{LabelRow, LabelStore, SinkError};

/// In-memory sink capturing inserted rows for assertions.
#[derive(Clone, Default)]
pub struct RecordingLabelStore {
    rows: Arc<Mutex<Vec<LabelRow>>>,
}

impl RecordingLabelStore {
    pub fn rows(&self) -> Vec<LabelRow> {
        self.rows.lock().unwrap().clone()
    }
}

impl LabelStore for RecordingLabelStore {
    async fn insert(&self, row: LabelRow) -> Result<(), SinkError> {
        self.rows.lock().unwrap().push(row);
        Ok(())
    }
}

/// An unsigned label; tests sign it where a valid signature matters.
pub fn label(src: &str, uri: &str, val: &str) -> Label {
    Label {
        ver: None,
        src: src.to_owned(),
        uri: uri.to_owned(),
        cid: None,
        val: val.to_owned(),
        neg: None,
        cts: "2024-01-01T00:00:00Z".to_owned(),
        exp: None,
        sig: Some(vec![1, 2, 3]),
    }
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
