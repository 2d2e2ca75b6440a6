use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ProtocolInfo, SessionIdentity},
    protocol::{NORMAL_CLOSURE, NO_STATUS_RECEIVED},
};
use tokio::{
    runtime::Handle,
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    dispatcher::Dispatcher,
    error::LinkError,
    task::{Cancellable, TaskHandle},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Interval between client pings; zero disables keep-alive.
    pub keep_alive_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

/// Build the socket URL: `http(s)://host/base` becomes
/// `ws(s)://host/base/ws?user_id=..&protocol=..&version=..`.
pub fn build_ws_url(identity: &SessionIdentity, protocol: &ProtocolInfo) -> Result<Url, LinkError> {
    let invalid = || LinkError::InvalidServerUrl(identity.server_url.clone());
    let mut url = Url::parse(identity.server_url.trim()).map_err(|_| invalid())?;
    let ws_scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(ws_scheme).map_err(|_| invalid())?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("user_id", &identity.user_id.to_string());
        if let Some(device_id) = identity.device_id {
            query.append_pair("device_id", &device_id.to_string());
        }
        query
            .append_pair("protocol", &protocol.protocol)
            .append_pair("version", &protocol.version);
    }
    Ok(url)
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Dropping every handle closes the connection with the normal-closure code.
#[derive(Debug)]
pub struct ConnectionHandle {
    url: Url,
    outbound: mpsc::UnboundedSender<Outbound>,
    opened: Arc<AtomicBool>,
    task: TaskHandle,
}

impl ConnectionHandle {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| LinkError::ConnectionClosed)
    }

    pub fn close(&self, code: u16, reason: &str) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| LinkError::ConnectionClosed)
    }

    /// Tear the transport down without a closing handshake. No further
    /// events are dispatched.
    pub fn abort(&self) {
        self.task.cancel();
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.task.is_finished() {
            return Err(LinkError::ConnectionClosed);
        }
        if !self.opened.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }
}

impl Cancellable for ConnectionHandle {
    /// Abort a connect that has not opened yet; close an open connection
    /// gracefully.
    fn cancel(&self) {
        if self.opened.load(Ordering::SeqCst) {
            let _ = self.close(NORMAL_CLOSURE, "cancelled");
        } else {
            self.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportFactory {
    url: Url,
    config: TransportConfig,
    runtime: Handle,
}

impl TransportFactory {
    /// Must be called inside a tokio runtime; connections run on it.
    pub fn new(
        identity: &SessionIdentity,
        protocol: &ProtocolInfo,
        config: TransportConfig,
    ) -> Result<Self, LinkError> {
        let url = build_ws_url(identity, protocol)?;
        let runtime = Handle::try_current().map_err(|_| LinkError::NoRuntime)?;
        Ok(Self {
            url,
            config,
            runtime,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn config(&self) -> TransportConfig {
        self.config
    }

    pub fn open(&self) -> (ConnectionHandle, Arc<Dispatcher>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = self.open_with(Arc::clone(&dispatcher));
        (handle, dispatcher)
    }

    pub fn open_with(&self, dispatcher: Arc<Dispatcher>) -> ConnectionHandle {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));
        let task = TaskHandle::spawn(
            &self.runtime,
            run_connection(
                self.url.clone(),
                self.config,
                dispatcher,
                outbound_rx,
                Arc::clone(&opened),
            ),
        );
        ConnectionHandle {
            url: self.url.clone(),
            outbound,
            opened,
            task,
        }
    }
}

async fn run_connection(
    url: Url,
    config: TransportConfig,
    dispatcher: Arc<Dispatcher>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    opened: Arc<AtomicBool>,
) {
    let connect = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()));
    let stream = match connect.await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(err)) => {
            warn!(%url, %err, "transport: connect failed");
            dispatcher.dispatch_failure(&format!("failed to connect websocket: {err}"));
            return;
        }
        Err(_) => {
            warn!(
                %url,
                timeout_ms = config.connect_timeout.as_millis() as u64,
                "transport: connect timed out"
            );
            dispatcher.dispatch_failure(&format!(
                "websocket connect timed out after {}ms",
                config.connect_timeout.as_millis()
            ));
            return;
        }
    };
    opened.store(true, Ordering::SeqCst);
    info!(%url, "transport: connected");
    dispatcher.dispatch_open();

    let (mut writer, mut reader) = stream.split();
    let mut keep_alive = keep_alive_timer(config.keep_alive_interval);
    let mut close_frame: Option<(u16, String)> = None;
    let mut outbound_open = true;

    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatcher.dispatch_message(&text),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    dispatcher.dispatch_closing(code, &reason);
                    close_frame = Some((code, reason));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(len = bytes.len(), "transport: ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    if close_frame.is_some() {
                        break;
                    }
                    warn!(%url, %err, "transport: receive failed");
                    dispatcher.dispatch_failure(&format!("websocket receive failed: {err}"));
                    return;
                }
                None => break,
            },
            command = outbound.recv(), if outbound_open => {
                let message = match command {
                    Some(Outbound::Text(text)) => Message::Text(text),
                    Some(Outbound::Close { code, reason }) => close_message(code, reason),
                    None => {
                        outbound_open = false;
                        close_message(NORMAL_CLOSURE, "handle dropped".into())
                    }
                };
                if let Err(err) = writer.send(message).await {
                    debug!(%err, "transport: send failed");
                }
            },
            _ = next_tick(&mut keep_alive) => {
                if let Err(err) = writer.send(Message::Ping(Vec::new())).await {
                    debug!(%err, "transport: keep-alive ping failed");
                }
            },
        }
    }

    match close_frame {
        Some((code, reason)) => {
            info!(%url, code, "transport: closed");
            dispatcher.dispatch_closed(code, &reason);
        }
        None => {
            warn!(%url, "transport: connection dropped without a close frame");
            dispatcher.dispatch_failure("connection dropped without a close frame");
        }
    }
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

fn keep_alive_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
