//! Mock push server.
//!
//! Accepts WebSocket connections, sends a fixed set of greeting frames to
//! each client and records every text frame it receives. Frames can also be
//! pushed to every open client on demand.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<u32>>,
    push_tx: broadcast::Sender<String>,
}

impl MockWsServer {
    /// Start on an ephemeral port. `greeting` is sent to every new client.
    pub async fn start(greeting: Vec<String>) -> Self {
        Self::start_with_handshake_delay(greeting, Duration::ZERO).await
    }

    /// Like [`start`](Self::start), but each accepted TCP connection waits
    /// `delay` before answering the WebSocket upgrade.
    pub async fn start_with_handshake_delay(greeting: Vec<String>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (push_tx, _) = broadcast::channel::<String>(16);

        let received_clone = received.clone();
        let connections_clone = connections.clone();
        let greeting = Arc::new(greeting);
        let push_clone = push_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            delay,
                            greeting.clone(),
                            push_clone.subscribe(),
                            received_clone.clone(),
                            connections_clone.clone(),
                        ));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            received,
            connections,
            push_tx,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    pub async fn received(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    /// Send a text frame to every open client.
    pub fn push(&self, text: String) {
        let _ = self.push_tx.send(text);
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    delay: Duration,
    greeting: Arc<Vec<String>>,
    mut pushes: broadcast::Receiver<String>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<u32>>,
) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    *connections.lock().await += 1;

    let (mut write, mut read) = ws_stream.split();

    for frame in greeting.iter() {
        if write.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => received.lock().await.push(text),
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            pushed = pushes.recv() => match pushed {
                Ok(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
