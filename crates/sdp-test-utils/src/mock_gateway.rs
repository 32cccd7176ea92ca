// mock_gateway: A mock gateway websocket server for testing the
// multiplexing client.
//
// Binds to a random port, records every decoded `GatewayRequest`, and lets
// the test script outbound `GatewayResponse` frames onto the most recent
// connection.  Nothing is automatic: the test drives every frame, so
// interleavings (the whole point of the multiplexing client) are exact.

use futures_util::{SinkExt, StreamExt};
use sdp_protocol::{GatewayRequest, GatewayResponse};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

type ConnSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

pub struct MockGateway {
    addr: SocketAddr,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<GatewayRequest>>,
    conn: ConnSlot,
    /// Background accept loop; dies with the gateway.
    _task: tokio::task::JoinHandle<()>,
}

impl MockGateway {
    /// Start the mock gateway on a random port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let conn: ConnSlot = Arc::new(Mutex::new(None));

        let accept_conn = Arc::clone(&conn);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let request_tx = request_tx.clone();
                        let conn = Arc::clone(&accept_conn);
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, request_tx, conn).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, requests: tokio::sync::Mutex::new(request_rx), conn, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Next request decoded from any connection.
    pub async fn recv_request(&self) -> Option<GatewayRequest> {
        self.requests.lock().await.recv().await
    }

    /// Push a frame onto the current connection, waiting briefly for a
    /// client to finish connecting if necessary.
    pub async fn send(&self, frame: &GatewayResponse) {
        let json = serde_json::to_string(frame).expect("frame serializes");
        self.send_message(Message::Text(json.into())).await;
    }

    /// Push raw text (for exercising the client's bad-frame handling).
    pub async fn send_raw(&self, text: &str) {
        self.send_message(Message::Text(text.to_owned().into())).await;
    }

    async fn send_message(&self, msg: Message) {
        for _ in 0..100 {
            let sender = self.conn.lock().unwrap().clone();
            if let Some(sender) = sender {
                sender.send(msg).expect("connection writer alive");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("no client connected to the mock gateway");
    }

    /// Close the current connection with a normal close frame.
    pub fn close_connection(&self) {
        if let Some(sender) = self.conn.lock().unwrap().take() {
            let _ = sender.send(Message::Close(None));
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    request_tx: mpsc::UnboundedSender<GatewayRequest>,
    conn: ConnSlot,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *conn.lock().unwrap() = Some(out_tx);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                if let Ok(request) = serde_json::from_str::<GatewayRequest>(&text) {
                    let _ = request_tx.send(request);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    Ok(())
}
