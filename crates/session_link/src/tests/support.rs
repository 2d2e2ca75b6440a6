//! Local axum servers shared by the network tests.

use std::{
    borrow::Cow,
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::mpsc};

use crate::dispatcher::ConnectionObserver;

#[derive(Clone, Default)]
struct WsState {
    connections: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

/// WebSocket peer driven by the text the client sends:
/// `close:<code>` answers with a Close frame, `drop` hangs up without one,
/// anything else is echoed. Every connection is greeted with
/// `{"type":"hello","payload":{"connection":<n>}}`.
pub(crate) struct WsServer {
    pub url: String,
    state: WsState,
}

impl WsServer {
    pub async fn spawn() -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ws server");
        let addr = listener.local_addr().expect("local addr");
        let state = WsState::default();
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<HashMap<String, String>> {
        self.state
            .queries
            .lock()
            .expect("queries lock")
            .clone()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<WsState>,
) -> Response {
    state.queries.lock().expect("queries lock").push(query);
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| handle_socket(socket, connection))
}

async fn handle_socket(mut socket: WebSocket, connection: usize) {
    let hello = format!(r#"{{"type":"hello","payload":{{"connection":{connection}}}}}"#);
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) if text == "drop" => return,
            Message::Text(text) => {
                if let Some(code) = text.strip_prefix("close:") {
                    let code = code.parse().unwrap_or(1011);
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::from("closing on request"),
                        })))
                        .await;
                } else if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            // Keep reading so the closing handshake completes.
            _ => {}
        }
    }
}

/// A free local address with nothing listening on it.
pub(crate) async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr")
}

/// Accepts TCP connections but never answers the WebSocket handshake.
pub(crate) async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Open,
    Message(String),
    Closing(u16),
    Closed(u16),
    Failure(String),
}

/// Forwards every lifecycle event into a channel.
pub(crate) struct ChannelObserver {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_open(&self) {
        let _ = self.tx.send(Event::Open);
    }

    fn on_message(&self, text: &str) {
        let _ = self.tx.send(Event::Message(text.to_string()));
    }

    fn on_closing(&self, code: u16, _reason: &str) {
        let _ = self.tx.send(Event::Closing(code));
    }

    fn on_closed(&self, code: u16, _reason: &str) {
        let _ = self.tx.send(Event::Closed(code));
    }

    fn on_failure(&self, reason: &str) {
        let _ = self.tx.send(Event::Failure(reason.to_string()));
    }
}

pub(crate) async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}
