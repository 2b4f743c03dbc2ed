// mock_labeler: A mock label publisher WebSocket endpoint.
//
// Each accepted connection consumes the next scripted frame list, sends
// every frame as a binary message, then either closes (to exercise the
// reconnect path) or holds the socket open. Request URIs are recorded so
// tests can assert the cursor query parameter.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// What one accepted connection receives.
#[derive(Debug, Default)]
pub struct ConnectionScript {
    pub frames: Vec<Vec<u8>>,
    /// Close after the frames (true) or hold the socket open (false).
    pub close_after: bool,
}

impl ConnectionScript {
    pub fn send_and_hold(frames: Vec<Vec<u8>>) -> Self {
        Self { frames, close_after: false }
    }

    pub fn send_and_close(frames: Vec<Vec<u8>>) -> Self {
        Self { frames, close_after: true }
    }
}

pub struct MockLabeler {
    addr: SocketAddr,
    request_uris: Arc<Mutex<Vec<String>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockLabeler {
    pub async fn start(scripts: Vec<ConnectionScript>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let request_uris = Arc::new(Mutex::new(Vec::new()));
        let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));

        let uris = request_uris.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let uris = uris.clone();
                let scripts = scripts.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, uris, scripts).await;
                });
            }
        });

        Self { addr, request_uris, _task: task }
    }

    /// HTTP-form endpoint; the subscriber maps it to ws://.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Request URIs seen so far, in connection order.
    pub fn request_uris(&self) -> Vec<String> {
        self.request_uris.lock().unwrap().clone()
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    uris: Arc<Mutex<Vec<String>>>,
    scripts: Arc<Mutex<VecDeque<ConnectionScript>>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uris.lock().unwrap().push(request.uri().to_string());
        Ok(response)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let script = scripts.lock().unwrap().pop_front().unwrap_or_default();
    for frame in script.frames {
        ws.send(Message::Binary(frame.into())).await?;
    }

    if script.close_after {
        let _ = ws.close(None).await;
    } else {
        // Drain client messages (pongs, close) until it goes away.
        while let Some(Ok(_)) = ws.next().await {}
    }
    Ok(())
}
