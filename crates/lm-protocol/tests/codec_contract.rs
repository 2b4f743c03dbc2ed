// Contract tests against hand-built CBOR, simulating frames produced by a
// foreign encoder rather than this crate's own serializer.

use ciborium::value::Value;
use lm_protocol::{FrameError, SubscriptionFrame, decode_frame};

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

fn two_values(header: &Value, body: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(header, &mut buf).unwrap();
    ciborium::ser::into_writer(body, &mut buf).unwrap();
    buf
}

fn labels_header() -> Value {
    Value::Map(vec![(text("t"), text("#labels")), (text("op"), Value::Integer(1.into()))])
}

#[test]
fn foreign_labels_frame_with_unknown_label_fields_decodes() {
    let label = Value::Map(vec![
        (text("src"), text("did:plc:alice")),
        (text("uri"), text("at://did:plc:bob/app.bsky.feed.post/1")),
        (text("val"), text("spam")),
        (text("cts"), text("2024-01-01T00:00:00Z")),
        (text("sig"), Value::Bytes(vec![1, 2, 3, 4])),
        // A field this implementation does not know about.
        (text("xtra"), text("ignored")),
    ]);
    let body = Value::Map(vec![
        (text("seq"), Value::Integer(12.into())),
        (text("labels"), Value::Array(vec![label])),
    ]);

    let frame = decode_frame(&two_values(&labels_header(), &body)).unwrap();
    let SubscriptionFrame::Labels(frame) = frame else {
        panic!("expected labels frame");
    };
    assert_eq!(frame.seq, 12);
    assert_eq!(frame.labels.len(), 1);
    assert_eq!(frame.labels[0].src, "did:plc:alice");
    assert_eq!(frame.labels[0].sig.as_deref(), Some(&[1u8, 2, 3, 4][..]));
    assert_eq!(frame.labels[0].cid, None);
}

#[test]
fn error_frame_without_type_field_is_reported() {
    let header = Value::Map(vec![(text("op"), Value::Integer((-1).into()))]);
    let body = Value::Map(vec![
        (text("error"), text("OutdatedCursor")),
        (text("message"), text("cursor is too old")),
    ]);

    match decode_frame(&two_values(&header, &body)) {
        Err(FrameError::ErrorFrame { error, message }) => {
            assert_eq!(error, "OutdatedCursor");
            assert_eq!(message.as_deref(), Some("cursor is too old"));
        }
        other => panic!("expected error frame, got {other:?}"),
    }
}

#[test]
fn empty_labels_list_is_a_valid_frame() {
    let body = Value::Map(vec![
        (text("seq"), Value::Integer(99.into())),
        (text("labels"), Value::Array(vec![])),
    ]);
    let frame = decode_frame(&two_values(&labels_header(), &body)).unwrap();
    assert_eq!(frame, SubscriptionFrame::Labels(lm_protocol::LabelsFrame {
        seq: 99,
        labels: vec![],
    }));
}
