//! In-process control server for tests.
//!
//! Binds `127.0.0.1:0`, accepts any number of agent sockets and plays the
//! server side of the handshake. Behavior is fixed per server instance.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::protocol::Message;

// ============================================================================
// Constants
// ============================================================================

/// Default wait used by [`MockServer::expect`].
const EXPECT_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// MockBehavior
// ============================================================================

/// Server-side reactions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MockBehavior {
    /// Send `welcome` once the socket opens.
    pub welcome: bool,
    /// Answer `auth` with `auth_success` (otherwise `auth_error`).
    pub accept_auth: bool,
    /// Answer agent `ping` with `pong`.
    pub answer_pings: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            welcome: true,
            accept_auth: true,
            answer_pings: true,
        }
    }
}

// ============================================================================
// MockServer
// ============================================================================

enum Control {
    Push(Message),
    Raw(String),
    Disconnect,
}

/// Test control server.
pub(crate) struct MockServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockServer {
    /// Binds a random local port and starts accepting.
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();

        let accepted = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let clients = Arc::new(Mutex::new(Vec::new()));
        let tasks = Arc::new(Mutex::new(Vec::new()));
        let (received_tx, received_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            behavior,
            Arc::clone(&accepted),
            Arc::clone(&disconnected),
            Arc::clone(&clients),
            Arc::clone(&tasks),
            received_tx,
        ));
        tasks.lock().push(accept_task);

        debug!(port, "Mock server bound");

        Self {
            port,
            accepted,
            disconnected,
            clients,
            received: tokio::sync::Mutex::new(received_rx),
            tasks,
        }
    }

    /// Returns a port nothing is listening on.
    pub async fn unused_port() -> u16 {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .expect("bind probe");
        listener.local_addr().expect("local addr").port()
    }

    /// Returns the URL agents connect to.
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Returns the number of sockets accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Returns the number of sockets the agent side has closed or dropped.
    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Sends a raw text frame to every connected agent.
    pub fn push_raw(&self, text: &str) {
        for client in self.clients.lock().iter() {
            let _ = client.send(Control::Raw(text.to_owned()));
        }
    }

    /// Sends a message to every connected agent.
    pub fn push(&self, message: Message) {
        for client in self.clients.lock().iter() {
            let _ = client.send(Control::Push(message.clone()));
        }
    }

    /// Closes every connected socket from the server side.
    pub fn disconnect_all(&self) {
        for client in self.clients.lock().drain(..) {
            let _ = client.send(Control::Disconnect);
        }
    }

    /// Waits for the next received message matching `predicate`.
    ///
    /// Non-matching messages are discarded.
    pub async fn expect<F>(&self, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut received = self.received.lock().await;
        timeout(EXPECT_TIMEOUT, async {
            while let Some(message) = received.recv().await {
                if predicate(&message) {
                    return Some(message);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// Server Tasks
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    behavior: MockBehavior,
    accepted: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    received_tx: mpsc::UnboundedSender<Message>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let number = accepted.fetch_add(1, Ordering::SeqCst) + 1;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        clients.lock().push(control_tx);

        let disconnected = Arc::clone(&disconnected);
        let received_tx = received_tx.clone();
        let task = tokio::spawn(async move {
            if serve_client(stream, number, behavior, control_rx, received_tx).await {
                disconnected.fetch_add(1, Ordering::SeqCst);
            }
        });
        tasks.lock().push(task);
    }
}

/// Returns `true` when the agent side went away, `false` when the server
/// ended the conversation itself.
async fn serve_client(
    stream: TcpStream,
    number: usize,
    behavior: MockBehavior,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    received_tx: mpsc::UnboundedSender<Message>,
) -> bool {
    let Ok(ws) = accept_async(stream).await else {
        return true;
    };
    let (mut sink, mut stream) = ws.split();

    if behavior.welcome {
        let welcome = Message::Welcome {
            session_id: Some(format!("srv-{number}")),
            server_version: Some("mock".into()),
        };
        if send(&mut sink, &welcome).await.is_err() {
            return true;
        }
    }

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return true,
                    Some(Ok(_)) => continue,
                };
                let Ok(message) = Message::from_json(&text) else {
                    continue;
                };

                let reply = match &message {
                    Message::Auth { .. } if behavior.accept_auth => {
                        Some(Message::AuthSuccess { session_id: None })
                    }
                    Message::Auth { .. } => Some(Message::AuthError {
                        message: "invalid token".into(),
                    }),
                    Message::Ping { timestamp } if behavior.answer_pings => {
                        Some(Message::Pong { timestamp: *timestamp })
                    }
                    _ => None,
                };

                let _ = received_tx.send(message);

                if let Some(reply) = reply
                    && send(&mut sink, &reply).await.is_err()
                {
                    return true;
                }
            }

            control = control_rx.recv() => {
                match control {
                    Some(Control::Push(message)) => {
                        if send(&mut sink, &message).await.is_err() {
                            return true;
                        }
                    }
                    Some(Control::Raw(text)) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            return true;
                        }
                    }
                    Some(Control::Disconnect) | None => {
                        let _ = sink.close().await;
                        return false;
                    }
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &Message) -> Result<(), S::Error>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let json = message.to_json().expect("serialize mock message");
    sink.send(WsMessage::Text(json.into())).await
}
