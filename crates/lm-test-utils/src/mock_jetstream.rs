// mock_jetstream: A mock change feed that pushes scripted JSON events to
// every subscriber and then holds the connection open.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

pub struct MockJetstream {
    addr: SocketAddr,
    request_uris: Arc<Mutex<Vec<String>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockJetstream {
    pub async fn start(events: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let request_uris = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(events);

        let uris = request_uris.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let uris = uris.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let callback =
                        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                            uris.lock().unwrap().push(request.uri().to_string());
                            Ok(response)
                        };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };
                    for event in events.iter() {
                        if ws.send(Message::Text(event.clone().into())).await.is_err() {
                            return;
                        }
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        Self { addr, request_uris, _task: task }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn request_uris(&self) -> Vec<String> {
        self.request_uris.lock().unwrap().clone()
    }
}
