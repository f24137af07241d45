//! Streaming transport with automatic reconnection.
//!
//! A [`Transport`] is a handle to a single driver task that owns all
//! connection state: the open link, the pending connection attempt, the
//! reconnection timer and the attempt counter. Commands, inbound frames,
//! attempt completions and timer expiry are all handled on that one task,
//! so two attempts can never be in flight for the same instance.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!                                 │                    │
//!                               fail                 close
//!                                 ▼                    ▼
//!                 ┌──────── attempt < max ? ───────────┐
//!                 │ yes                                │ no
//!                 ▼                                    ▼
//!        Retrying ──delay──▶ Connecting             GivenUp
//! ```

pub mod link;

use crate::event::WireMessage;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

pub use link::{ConnectFuture, Connector, Link, WsConnector};

/// Where a transport connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// One monitored session: `{base}/{session_id}`
    Session(String),
    /// Aggregate view of all sessions: `{base}/dashboard`
    Dashboard,
}

impl Endpoint {
    pub fn from_session(session_id: Option<String>) -> Self {
        match session_id {
            Some(id) => Endpoint::Session(id),
            None => Endpoint::Dashboard,
        }
    }

    pub fn url(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        match self {
            Endpoint::Session(id) => format!("{base}/{id}"),
            Endpoint::Dashboard => format!("{base}/dashboard"),
        }
    }
}

/// Reconnection policy and connection limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport failures. None of these are fatal to the transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be opened
    Connect(String),
    /// Opening the connection took longer than the configured timeout
    Timeout(Duration),
    /// A message could not be serialized
    Serialize(String),
    /// A frame could not be handed to the connection
    Send(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "Connection failed: {e}"),
            TransportError::Timeout(d) => write!(f, "Connection timed out after {d:?}"),
            TransportError::Serialize(e) => write!(f, "Serialization failed: {e}"),
            TransportError::Send(e) => write!(f, "Send failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed, with a reconnection scheduled
    Retrying,
    /// Closed, attempts exhausted; only a manual `connect()` restarts
    GivenUp,
}

/// Snapshot published by the driver after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
}

/// Notifications for the alerting collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportNotice {
    Connected,
    /// Open again after `attempts` failed attempts
    Reconnected { attempts: u32 },
    Reconnecting { attempt: u32, max: u32 },
    ReconnectExhausted { max: u32 },
    SendFailed { reason: String },
    Alert { message: String },
}

/// Receiving ends handed to the consumer.
pub struct TransportChannels {
    /// Every well-formed inbound message, alerts included
    pub messages: mpsc::UnboundedReceiver<WireMessage>,
    pub notices: mpsc::UnboundedReceiver<TransportNotice>,
}

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Send(String, oneshot::Sender<bool>),
}

/// Handle to a transport driver task.
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    notices: mpsc::UnboundedSender<TransportNotice>,
    status: watch::Receiver<ConnectionStatus>,
    url: String,
    task: JoinHandle<()>,
}

impl Transport {
    /// Spawn the driver on the current runtime. Nothing connects until
    /// [`Transport::connect`] is called.
    pub fn spawn<C: Connector>(
        connector: C,
        base_url: &str,
        endpoint: Endpoint,
        config: TransportConfig,
    ) -> (Self, TransportChannels) {
        let url = endpoint.url(base_url);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
        });

        let driver = Driver {
            connector,
            url: url.clone(),
            config,
            attempt: 0,
            state: ConnectionState::Disconnected,
            link: None,
            pending: None,
            retry: None,
            status: status_tx,
            messages: messages_tx,
            notices: notices_tx.clone(),
        };
        let task = tokio::spawn(driver.run(commands_rx));

        (
            Self {
                commands,
                notices: notices_tx,
                status,
                url,
                task,
            },
            TransportChannels { messages, notices },
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the connection. No-op while connecting or connected; cancels a
    /// pending retry and attempts at once otherwise.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close everything and reset. Once this returns, no scheduled
    /// reconnection will fire.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Serialize and transmit. Returns `false` if no connection is open or
    /// the frame could not be handed over.
    pub async fn send<T: Serialize>(&self, message: &T) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                let err = TransportError::Serialize(e.to_string());
                tracing::warn!("{}", err);
                let _ = self.notices.send(TransportNotice::SendFailed {
                    reason: err.to_string(),
                });
                return false;
            }
        };
        let (reply, result) = oneshot::channel();
        if self.commands.send(Command::Send(text, reply)).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver<C> {
    connector: C,
    url: String,
    config: TransportConfig,
    attempt: u32,
    state: ConnectionState,
    link: Option<Link>,
    pending: Option<ConnectFuture>,
    retry: Option<Pin<Box<Sleep>>>,
    status: watch::Sender<ConnectionStatus>,
    messages: mpsc::UnboundedSender<WireMessage>,
    notices: mpsc::UnboundedSender<TransportNotice>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                result = poll_attempt(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    self.on_attempt(result);
                }
                frame = next_frame(&mut self.link), if self.link.is_some() => match frame {
                    Some(text) => self.on_frame(&text),
                    None => self.on_link_lost(),
                },
                _ = wait_retry(&mut self.retry), if self.retry.is_some() => {
                    self.retry = None;
                    self.begin_attempt();
                }
            }
        }
        tracing::debug!("Transport driver for {} finished", self.url);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect => match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    tracing::debug!("connect() ignored, already {:?}", self.state);
                }
                _ => {
                    self.retry = None;
                    self.begin_attempt();
                }
            },
            Command::Disconnect(ack) => {
                self.pending = None;
                self.retry = None;
                self.link = None;
                self.attempt = 0;
                self.set_state(ConnectionState::Disconnected);
                tracing::info!("Disconnected from {}", self.url);
                let _ = ack.send(());
            }
            Command::Send(text, reply) => {
                let sent = match &self.link {
                    None => false,
                    Some(link) => match link.outbound.try_send(text) {
                        Ok(()) => true,
                        Err(e) => {
                            let err = TransportError::Send(e.to_string());
                            tracing::warn!("{}", err);
                            self.notify(TransportNotice::SendFailed {
                                reason: err.to_string(),
                            });
                            false
                        }
                    },
                };
                let _ = reply.send(sent);
            }
        }
    }

    fn begin_attempt(&mut self) {
        self.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {} (attempt {})", self.url, self.attempt);

        let attempt = self.connector.connect(&self.url);
        let timeout = self.config.connect_timeout;
        self.pending = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
    }

    fn on_attempt(&mut self, result: Result<Link, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                let previous = self.attempt;
                self.attempt = 0;
                self.set_state(ConnectionState::Connected);
                if previous > 0 {
                    tracing::info!("Reconnected to {} after {} attempts", self.url, previous);
                    self.notify(TransportNotice::Reconnected { attempts: previous });
                } else {
                    tracing::info!("Connected to {}", self.url);
                    self.notify(TransportNotice::Connected);
                }
            }
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", self.url, e);
                self.on_close();
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        let message: WireMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed message from {}: {}", self.url, e);
                return;
            }
        };
        if message.is_alert() {
            let text = message
                .alert_message()
                .unwrap_or("Alert received")
                .to_string();
            self.notify(TransportNotice::Alert { message: text });
        }
        let _ = self.messages.send(message);
    }

    fn on_link_lost(&mut self) {
        if let Some(err) = self.link.as_mut().and_then(Link::take_failure) {
            tracing::warn!("Connection to {} broke: {}", self.url, err);
            self.notify(TransportNotice::SendFailed {
                reason: err.to_string(),
            });
        }
        self.on_close();
    }

    fn on_close(&mut self) {
        self.link = None;
        let max = self.config.max_reconnect_attempts;
        if self.attempt < max {
            self.attempt += 1;
            self.retry = Some(Box::pin(tokio::time::sleep(self.config.reconnect_delay)));
            self.set_state(ConnectionState::Retrying);
            tracing::info!(
                "Connection to {} closed, retrying in {:?} ({}/{})",
                self.url,
                self.config.reconnect_delay,
                self.attempt,
                max
            );
            self.notify(TransportNotice::Reconnecting {
                attempt: self.attempt,
                max,
            });
        } else {
            self.set_state(ConnectionState::GivenUp);
            tracing::error!("Connection to {} lost after {} attempts", self.url, max);
            self.notify(TransportNotice::ReconnectExhausted { max });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status.send_replace(ConnectionStatus {
            state,
            reconnect_attempt: self.attempt,
        });
    }

    fn notify(&self, notice: TransportNotice) {
        let _ = self.notices.send(notice);
    }
}

async fn poll_attempt(pending: &mut Option<ConnectFuture>) -> Result<Link, TransportError> {
    match pending {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<String> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Far end of an in-memory link.
    struct Remote {
        to_client: mpsc::Sender<String>,
        from_client: mpsc::Receiver<String>,
        failed: oneshot::Sender<TransportError>,
    }

    impl Remote {
        /// Break the connection the way a failed socket write does.
        fn fail_write(self, reason: &str) {
            let _ = self.failed.send(TransportError::Send(reason.into()));
        }
    }

    /// Connector whose attempts succeed or fail on demand.
    #[derive(Clone)]
    struct MockConnector {
        attempts: Arc<AtomicUsize>,
        accept: Arc<Mutex<bool>>,
        remotes: mpsc::UnboundedSender<Remote>,
    }

    impl MockConnector {
        fn new(accept: bool) -> (Self, mpsc::UnboundedReceiver<Remote>) {
            let (remotes, rx) = mpsc::unbounded_channel();
            (
                Self {
                    attempts: Arc::new(AtomicUsize::new(0)),
                    accept: Arc::new(Mutex::new(accept)),
                    remotes,
                },
                rx,
            )
        }

        fn set_accept(&self, accept: bool) {
            *self.accept.lock().unwrap() = accept;
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, _url: &str) -> ConnectFuture {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let accept = *self.accept.lock().unwrap();
            let remotes = self.remotes.clone();
            Box::pin(async move {
                if !accept {
                    return Err(TransportError::Connect("refused".into()));
                }
                let (outbound, from_client) = mpsc::channel(16);
                let (to_client, inbound) = mpsc::channel(16);
                let (link, failed) = Link::new(outbound, inbound);
                let _ = remotes.send(Remote {
                    to_client,
                    from_client,
                    failed,
                });
                Ok(link)
            })
        }
    }

    fn config(max: u32) -> TransportConfig {
        TransportConfig {
            max_reconnect_attempts: max,
            reconnect_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(1),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let base = "ws://localhost:8000/ws/";
        assert_eq!(
            Endpoint::from_session(Some("S-1".into())).url(base),
            "ws://localhost:8000/ws/S-1"
        );
        assert_eq!(
            Endpoint::from_session(None).url(base),
            "ws://localhost:8000/ws/dashboard"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_opens_once() {
        let (connector, mut remotes) = MockConnector::new(true);
        let (transport, mut channels) =
            Transport::spawn(connector.clone(), "ws://x", Endpoint::Dashboard, config(3));

        transport.connect();
        transport.connect();
        settle().await;
        transport.connect();
        settle().await;

        assert_eq!(connector.attempts(), 1);
        assert!(transport.is_connected());
        assert_eq!(channels.notices.recv().await, Some(TransportNotice::Connected));
        assert!(remotes.try_recv().is_ok());
        assert!(remotes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_connection_fails() {
        let (connector, _remotes) = MockConnector::new(true);
        let (transport, _channels) =
            Transport::spawn(connector, "ws://x", Endpoint::Dashboard, config(3));
        assert!(!transport.send(&json!({"type": "audio"})).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive_frames() {
        let (connector, mut remotes) = MockConnector::new(true);
        let (transport, mut channels) = Transport::spawn(
            connector,
            "ws://x",
            Endpoint::Session("S-1".into()),
            config(3),
        );
        transport.connect();
        let mut remote = remotes.recv().await.unwrap();

        assert!(transport.send(&json!({"type": "audio", "data": {}})).await);
        let frame = remote.from_client.recv().await.unwrap();
        assert!(frame.contains("\"audio\""));

        remote.to_client.send("{not json".into()).await.unwrap();
        remote
            .to_client
            .send(r#"{"type":"alert","data":{"message":"Suspicious behavior detected!"}}"#.into())
            .await
            .unwrap();
        remote
            .to_client
            .send(r#"{"type":"screen","data":{"trigger":"copy"},"timestamp":5}"#.into())
            .await
            .unwrap();

        let first = channels.messages.recv().await.unwrap();
        assert_eq!(first.kind, "alert");
        let second = channels.messages.recv().await.unwrap();
        assert_eq!(second.kind, "screen");

        assert_eq!(channels.notices.recv().await, Some(TransportNotice::Connected));
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Alert {
                message: "Suspicious behavior detected!".into()
            })
        );
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_surfaced_before_retry() {
        let (connector, mut remotes) = MockConnector::new(true);
        let (transport, mut channels) =
            Transport::spawn(connector, "ws://x", Endpoint::Dashboard, config(3));
        transport.connect();
        assert_eq!(channels.notices.recv().await, Some(TransportNotice::Connected));

        remotes.recv().await.unwrap().fail_write("broken pipe");
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::SendFailed {
                reason: "Send failed: broken pipe".into()
            })
        );
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 1, max: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_schedule_retries() {
        let (connector, _remotes) = MockConnector::new(false);
        let (transport, mut channels) =
            Transport::spawn(connector.clone(), "ws://x", Endpoint::Dashboard, config(3));
        transport.connect();

        for n in 1..=3 {
            assert_eq!(
                channels.notices.recv().await,
                Some(TransportNotice::Reconnecting { attempt: n, max: 3 })
            );
            assert_eq!(transport.status().reconnect_attempt, n);
            assert_eq!(connector.attempts(), n as usize);
        }
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::ReconnectExhausted { max: 3 })
        );
        assert_eq!(connector.attempts(), 4);
        assert_eq!(transport.status().state, ConnectionState::GivenUp);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_counter() {
        let (connector, mut remotes) = MockConnector::new(false);
        let (transport, mut channels) =
            Transport::spawn(connector.clone(), "ws://x", Endpoint::Dashboard, config(5));
        transport.connect();

        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 1, max: 5 })
        );
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 2, max: 5 })
        );
        connector.set_accept(true);

        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnected { attempts: 2 })
        );
        assert_eq!(
            transport.status(),
            ConnectionStatus {
                state: ConnectionState::Connected,
                reconnect_attempt: 0
            }
        );

        // closing the far end starts a fresh cycle at 1
        drop(remotes.recv().await.unwrap());
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 1, max: 5 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (connector, _remotes) = MockConnector::new(false);
        let (transport, mut channels) =
            Transport::spawn(connector.clone(), "ws://x", Endpoint::Dashboard, config(5));
        transport.connect();

        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 1, max: 5 })
        );
        transport.disconnect().await;
        transport.disconnect().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(
            transport.status(),
            ConnectionStatus {
                state: ConnectionState::Disconnected,
                reconnect_attempt: 0
            }
        );
        assert!(channels.notices.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_after_exhaustion_keeps_counter() {
        let (connector, _remotes) = MockConnector::new(false);
        let (transport, mut channels) =
            Transport::spawn(connector.clone(), "ws://x", Endpoint::Dashboard, config(1));
        transport.connect();

        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 1, max: 1 })
        );
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::ReconnectExhausted { max: 1 })
        );

        transport.connect();
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::ReconnectExhausted { max: 1 })
        );
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        struct Stalled;
        impl Connector for Stalled {
            fn connect(&self, _url: &str) -> ConnectFuture {
                Box::pin(std::future::pending())
            }
        }

        let (transport, mut channels) =
            Transport::spawn(Stalled, "ws://x", Endpoint::Dashboard, config(2));
        transport.connect();
        assert_eq!(
            channels.notices.recv().await,
            Some(TransportNotice::Reconnecting { attempt: 1, max: 2 })
        );
        assert_eq!(transport.status().state, ConnectionState::Retrying);
    }
}
