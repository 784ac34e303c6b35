use crate::config::{ClientConfig, MIN_KEEPALIVE};
use crate::error::CallError;
use futures_util::{SinkExt, StreamExt};
use schedwatch_core::rpc::{encode_request, RpcRequest};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

pub const KEEPALIVE_METHOD: &str = "ping";

/// One connection lifetime, from `open` to its close.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { epoch: Epoch },
    Message { epoch: Epoch, text: String },
    Closed { epoch: Epoch, reason: String },
}

impl ConnectionEvent {
    pub fn epoch(&self) -> Epoch {
        match self {
            ConnectionEvent::Opened { epoch }
            | ConnectionEvent::Message { epoch, .. }
            | ConnectionEvent::Closed { epoch, .. } => *epoch,
        }
    }
}

/// Session-side view of the socket. The I/O runs in a task per epoch and
/// reports back through `events`; state changes only when the session
/// accepts those reports.
pub struct Connection {
    url: Url,
    keepalive_interval: Duration,
    max_frame_bytes: usize,
    max_inbound_bytes: usize,
    queue_capacity: usize,
    state: ConnectionState,
    epoch: Epoch,
    outbound: Option<mpsc::Sender<String>>,
    task: Option<JoinHandle<()>>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl Connection {
    pub fn new(config: &ClientConfig, events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            url: config.url.clone(),
            keepalive_interval: config.keepalive_interval.max(MIN_KEEPALIVE),
            max_frame_bytes: config.max_frame_bytes,
            max_inbound_bytes: config.max_inbound_bytes,
            queue_capacity: config.queue_capacity.max(1),
            state: ConnectionState::Closed,
            epoch: 0,
            outbound: None,
            task: None,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Starts a new epoch. Returns false (and does nothing) while a
    /// connection is already in progress or open. Failures arrive later as
    /// a `Closed` event.
    pub fn open(&mut self) -> bool {
        if self.state != ConnectionState::Closed {
            warn!(
                "connection_open_ignored: state={} epoch={}",
                self.state.as_str(),
                self.epoch
            );
            return false;
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.outbound = Some(tx);
        let io = SocketTask {
            epoch: self.epoch,
            url: self.url.clone(),
            keepalive_interval: self.keepalive_interval,
            max_frame_bytes: self.max_frame_bytes,
            max_inbound_bytes: self.max_inbound_bytes,
            events: self.events.clone(),
        };
        self.task = Some(tokio::spawn(io.run(rx)));
        info!(event = "connection_connecting", epoch = self.epoch, url = %self.url);
        true
    }

    /// Ends the current epoch. A no-op when already closed. Late events from
    /// the finished epoch are rejected by [`Connection::accept`].
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        let was = self.state;
        self.state = ConnectionState::Closed;
        // Dropping the sender makes the socket task send a close frame.
        self.outbound = None;
        if let Some(task) = self.task.take() {
            if was == ConnectionState::Connecting {
                task.abort();
            }
        }
        info!(event = "connection_closed_locally", epoch = self.epoch);
        true
    }

    /// Applies a lifecycle event to the state machine. Returns false for
    /// events from a superseded epoch or that do not fit the current state.
    pub fn accept(&mut self, event: &ConnectionEvent) -> bool {
        if event.epoch() != self.epoch {
            return false;
        }
        match (event, self.state) {
            (ConnectionEvent::Opened { .. }, ConnectionState::Connecting) => {
                self.state = ConnectionState::Open;
                true
            }
            (ConnectionEvent::Message { .. }, ConnectionState::Open) => true,
            (
                ConnectionEvent::Closed { .. },
                ConnectionState::Connecting | ConnectionState::Open,
            ) => {
                self.state = ConnectionState::Closed;
                self.outbound = None;
                self.task = None;
                true
            }
            _ => false,
        }
    }

    pub fn send(&self, request: &RpcRequest) -> Result<(), CallError> {
        if self.state != ConnectionState::Open {
            return Err(CallError::NotConnected);
        }
        let Some(outbound) = &self.outbound else {
            return Err(CallError::NotConnected);
        };
        let text = encode_request(request, self.max_frame_bytes)?;
        outbound.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => CallError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => CallError::ConnectionClosed,
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if self.state == ConnectionState::Connecting {
                task.abort();
            }
        }
    }
}

struct SocketTask {
    epoch: Epoch,
    url: Url,
    keepalive_interval: Duration,
    max_frame_bytes: usize,
    max_inbound_bytes: usize,
    events: mpsc::Sender<ConnectionEvent>,
}

impl SocketTask {
    async fn run(self, mut outbound: mpsc::Receiver<String>) {
        let epoch = self.epoch;
        let mut closer = CloseReporter::new(epoch, self.events.clone());
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_inbound_bytes);
        ws_config.max_frame_size = Some(self.max_inbound_bytes);
        let connect = connect_async_with_config(self.url.as_str(), Some(ws_config), false);
        let (ws, _) = match connect.await {
            Ok(value) => value,
            Err(err) => {
                warn!("connection_connect_error: epoch={epoch} {err}");
                closer.report(format!("connect failed: {err}")).await;
                return;
            }
        };
        if self.events.send(ConnectionEvent::Opened { epoch }).await.is_err() {
            return;
        }
        info!(event = "connection_open", epoch);

        let keepalive = match encode_request(
            &RpcRequest::notify(KEEPALIVE_METHOD, Value::Array(Vec::new())),
            self.max_frame_bytes,
        ) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!("keepalive_encode_error: {err}");
                None
            }
        };
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (mut sink, mut stream) = ws.split();
        let reason = loop {
            tokio::select! {
                incoming = stream.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!("connection_binary_frame_invalid: epoch={epoch} {err}");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(frame) => {
                                    format!("closed by server: {} {}", frame.code, frame.reason)
                                }
                                None => "closed by server".to_string(),
                            };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => break format!("transport error: {err}"),
                        None => break "stream ended".to_string(),
                    };
                    if self.events.send(ConnectionEvent::Message { epoch, text }).await.is_err() {
                        break "session gone".to_string();
                    }
                }
                out = outbound.recv() => {
                    match out {
                        Some(text) => {
                            if let Err(err) = sink.send(Message::Text(text)).await {
                                break format!("send failed: {err}");
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break "closed by client".to_string();
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Some(text) = &keepalive {
                        debug!(event = "keepalive", epoch);
                        if let Err(err) = sink.send(Message::Text(text.clone())).await {
                            break format!("keepalive failed: {err}");
                        }
                    }
                }
            }
        };
        let _ = sink.close().await;
        closer.report(reason).await;
    }
}

/// Sends the epoch's `Closed` event exactly once, including when the socket
/// task unwinds or is aborted before reporting.
struct CloseReporter {
    epoch: Epoch,
    events: mpsc::Sender<ConnectionEvent>,
    reported: bool,
}

impl CloseReporter {
    fn new(epoch: Epoch, events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            epoch,
            events,
            reported: false,
        }
    }

    async fn report(&mut self, reason: String) {
        debug!(event = "connection_task_done", epoch = self.epoch, reason = %reason);
        self.reported = true;
        let _ = self
            .events
            .send(ConnectionEvent::Closed {
                epoch: self.epoch,
                reason,
            })
            .await;
    }
}

impl Drop for CloseReporter {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        warn!("connection_task_aborted: epoch={}", self.epoch);
        let _ = self.events.try_send(ConnectionEvent::Closed {
            epoch: self.epoch,
            reason: "socket task ended abnormally".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let config = ClientConfig::parse("ws://127.0.0.1:9/web-socket").expect("config");
        (Connection::new(&config, tx), rx)
    }

    #[tokio::test]
    async fn open_is_a_noop_while_connecting() {
        let (mut connection, _rx) = connection();
        assert!(connection.open());
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(!connection.open());
        assert_eq!(connection.epoch(), 1);
    }

    #[tokio::test]
    async fn stale_epoch_events_are_rejected() {
        let (mut connection, _rx) = connection();
        connection.open();
        connection.close();
        connection.open();
        assert_eq!(connection.epoch(), 2);

        assert!(!connection.accept(&ConnectionEvent::Opened { epoch: 1 }));
        assert!(!connection.accept(&ConnectionEvent::Closed {
            epoch: 1,
            reason: "late".to_string(),
        }));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        assert!(connection.accept(&ConnectionEvent::Opened { epoch: 2 }));
        assert!(connection.is_open());
        assert!(connection.accept(&ConnectionEvent::Message {
            epoch: 2,
            text: "{}".to_string(),
        }));
        assert!(connection.accept(&ConnectionEvent::Closed {
            epoch: 2,
            reason: "gone".to_string(),
        }));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_requires_open_state() {
        let (mut connection, _rx) = connection();
        let request = RpcRequest::notify("ping", Value::Null);
        assert_eq!(connection.send(&request), Err(CallError::NotConnected));
        connection.open();
        assert_eq!(connection.send(&request), Err(CallError::NotConnected));
        assert!(connection.close());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.close());
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_closed() {
        let (mut connection, mut rx) = connection();
        connection.open();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("closed in time")
            .expect("event");
        assert!(matches!(event, ConnectionEvent::Closed { epoch: 1, .. }));
        assert!(connection.accept(&event));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn dropped_task_still_reports_closed() {
        let (tx, mut rx) = mpsc::channel(8);
        drop(CloseReporter::new(3, tx.clone()));
        let event = rx.try_recv().expect("closed event");
        assert!(matches!(event, ConnectionEvent::Closed { epoch: 3, .. }));

        let mut closer = CloseReporter::new(4, tx);
        closer.report("stream ended".to_string()).await;
        drop(closer);
        assert_eq!(
            rx.try_recv().expect("closed event"),
            ConnectionEvent::Closed {
                epoch: 4,
                reason: "stream ended".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn zero_keepalive_is_clamped() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = ClientConfig::parse("ws://127.0.0.1:9/web-socket").expect("config");
        config.keepalive_interval = Duration::ZERO;
        let connection = Connection::new(&config, tx);
        assert_eq!(connection.keepalive_interval, MIN_KEEPALIVE);
    }
}
