mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RecordingLabelStore, label, wait_for};
use lm_protocol::{LabelsFrame, SubscriptionFrame};
use lm_test_utils::{ConnectionScript, MockDirectory, MockLabeler, MockPds, TestSigner, labeler_did_doc};
use muncher::identity::IdentityDirectory;
use muncher::service_record::ServiceRecordFetcher;
use muncher::state::Store;
use muncher::subscription::PublisherConnection;
use muncher::validator::LabelValidator;
use tokio::sync::watch;

const DID: &str = "did:plc:alice";
const SUBJECT: &str = "at://did:plc:bob/app.bsky.feed.post/1";

fn labels_frame(signer: &TestSigner, seq: i64, vals: &[&str]) -> Vec<u8> {
    let labels = vals
        .iter()
        .map(|val| {
            let mut l = label(DID, SUBJECT, val);
            signer.sign(&mut l);
            l
        })
        .collect();
    SubscriptionFrame::Labels(LabelsFrame { seq, labels }).encode().unwrap()
}

struct Stack {
    store: Arc<Store>,
    sink: RecordingLabelStore,
    labeler: MockLabeler,
    _directory_mock: MockDirectory,
    _pds: MockPds,
    connection: Option<PublisherConnection<RecordingLabelStore>>,
}

async fn stack(declared: &[&str], scripts: Vec<ConnectionScript>) -> Stack {
    let signer = TestSigner::from_seed(1);
    let labeler = MockLabeler::start(scripts).await;
    let directory_mock = MockDirectory::start().await;
    let pds = MockPds::start().await;
    pds.set_label_values(DID, declared);
    directory_mock.set_document(
        DID,
        labeler_did_doc(DID, &signer.public_multibase(), &labeler.endpoint(), &pds.url()),
    );

    let store = Arc::new(Store::open_in_memory().unwrap());
    let directory = Arc::new(IdentityDirectory::new(directory_mock.url()));
    let validator = Arc::new(LabelValidator::new(
        store.clone(),
        directory.clone(),
        ServiceRecordFetcher::new(directory.clone(), store.clone()),
    ));
    let sink = RecordingLabelStore::default();
    let connection = PublisherConnection::new(
        DID.to_owned(),
        store.clone(),
        directory,
        validator,
        Arc::new(sink.clone()),
        None,
    )
    .with_reconnect(Duration::from_millis(10), 10);

    Stack {
        store,
        sink,
        labeler,
        _directory_mock: directory_mock,
        _pds: pds,
        connection: Some(connection),
    }
}

#[tokio::test]
async fn happy_path_persists_cursor_and_inserts_row() {
    let signer = TestSigner::from_seed(1);
    let frame = labels_frame(&signer, 5, &["spam"]);
    let mut stack = stack(&["spam"], vec![ConnectionScript::send_and_hold(vec![frame])]).await;

    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(stack.connection.take().unwrap().run(rx));

    let sink = stack.sink.clone();
    wait_for("label row", || sink.rows().len() == 1).await;

    assert_eq!(stack.store.cursor(DID).unwrap(), 5);
    let row = &stack.sink.rows()[0];
    assert_eq!(row.src, DID);
    assert_eq!(row.uri, SUBJECT);
    assert_eq!(row.cid, "");
    assert_eq!(row.val, "spam");
    assert!(!row.neg);
    assert_eq!(row.exp, None);

    assert_eq!(
        stack.labeler.request_uris(),
        vec!["/xrpc/com.atproto.label.subscribeLabels?cursor=0"]
    );

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn cursor_advances_past_rejected_labels() {
    let signer = TestSigner::from_seed(1);
    let frame = labels_frame(&signer, 7, &["nsfw"]);
    let mut stack = stack(&["spam"], vec![ConnectionScript::send_and_hold(vec![frame])]).await;

    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(stack.connection.take().unwrap().run(rx));

    let store = stack.store.clone();
    wait_for("cursor advance", move || store.cursor(DID).unwrap() == 7).await;
    assert!(stack.sink.rows().is_empty());

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn reconnect_resumes_from_latest_persisted_cursor() {
    let signer = TestSigner::from_seed(1);
    let first = labels_frame(&signer, 5, &["spam"]);
    let second = labels_frame(&signer, 6, &["spam"]);
    let mut stack = stack(
        &["spam"],
        vec![
            ConnectionScript::send_and_close(vec![first]),
            ConnectionScript::send_and_hold(vec![second]),
        ],
    )
    .await;

    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(stack.connection.take().unwrap().run(rx));

    let sink = stack.sink.clone();
    wait_for("both rows", || sink.rows().len() == 2).await;

    assert_eq!(stack.store.cursor(DID).unwrap(), 6);
    assert_eq!(
        stack.labeler.request_uris(),
        vec![
            "/xrpc/com.atproto.label.subscribeLabels?cursor=0",
            "/xrpc/com.atproto.label.subscribeLabels?cursor=5",
        ]
    );

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn undecodable_and_info_frames_do_not_stall_the_stream() {
    let signer = TestSigner::from_seed(1);
    let info = SubscriptionFrame::Info(lm_protocol::InfoFrame {
        name: "OutdatedCursor".to_owned(),
        message: None,
    })
    .encode()
    .unwrap();
    let labels = labels_frame(&signer, 9, &["spam"]);
    let mut stack = stack(
        &["spam"],
        vec![ConnectionScript::send_and_hold(vec![b"garbage".to_vec(), info, labels])],
    )
    .await;

    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(stack.connection.take().unwrap().run(rx));

    let sink = stack.sink.clone();
    wait_for("label row after noise", || sink.rows().len() == 1).await;
    assert_eq!(stack.store.cursor(DID).unwrap(), 9);

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn cursor_never_regresses_across_frames() {
    let signer = TestSigner::from_seed(1);
    let frames = vec![
        labels_frame(&signer, 3, &["spam"]),
        labels_frame(&signer, 8, &["spam", "spam"]),
    ];
    let mut stack = stack(&["spam"], vec![ConnectionScript::send_and_hold(frames)]).await;

    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(stack.connection.take().unwrap().run(rx));

    let sink = stack.sink.clone();
    wait_for("all rows", || sink.rows().len() == 3).await;
    assert_eq!(stack.store.cursor(DID).unwrap(), 8);

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn reconnect_attempts_are_bounded() {
    // A port with no listener: bind, note the address, drop the socket.
    let closed_addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let store = Arc::new(Store::open_in_memory().unwrap());
    let signer = TestSigner::from_seed(1);
    store
        .set_identity(DID, &signer.public_multibase(), Some(format!("http://{closed_addr}").as_str()))
        .unwrap();

    let directory = Arc::new(IdentityDirectory::new("http://127.0.0.1:1".to_owned()));
    let validator = Arc::new(LabelValidator::new(
        store.clone(),
        directory.clone(),
        ServiceRecordFetcher::new(directory.clone(), store.clone()),
    ));
    let connection = PublisherConnection::new(
        DID.to_owned(),
        store,
        directory,
        validator,
        Arc::new(RecordingLabelStore::default()),
        None,
    )
    .with_reconnect(Duration::from_millis(1), 10);

    let (_shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(connection.run(rx));
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("connection task should stop after exhausting its retry budget")
        .unwrap();
}
