//! Long-lived connection to the certificate stream.
//!
//! `StreamConnection` drives the lifecycle in `state` over a transport from
//! `transport`, decodes frames with `message`, and forwards every certificate
//! to its single `DomainsObserver`. Frames are handled one at a time: the
//! observer call for one frame returns before the next frame is read.
//!
//! Liveness is tracked by a per-session heartbeat task that owns the write
//! half. It pings on one timer and checks for a stall on another; on a stall
//! it closes the transport and tells the read loop to give up the session.

pub mod message;
pub mod state;
pub mod transport;

pub use message::{decode_message, normalize_domain, ProtocolError, StreamMessage};
pub use state::{Action, BackoffPolicy, ConnectionEvent, ConnectionState, ConnectionStateMachine};
pub use transport::{
    Connector, HeartbeatSink, Transport, TransportError, TungsteniteConnector,
    WebSocketConnection,
};

use crate::config::StreamConfig;
use crate::core::DomainsObserver;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, trace, warn};

/// Log a progress line every this many frames.
const MESSAGE_LOG_INTERVAL: u64 = 100;
/// Upper bound for closing a transport that stopped responding.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("gave up on {url} after {retries} reconnect attempts")]
    Exhausted { url: String, retries: u32 },

    #[error("stream task failed: {0}")]
    Task(String),
}

/// Timing parameters of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSettings {
    pub heartbeat_interval: Duration,
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            stall_timeout: config.stall_timeout(),
            stall_check_interval: config.stall_check_interval(),
            backoff: BackoffPolicy::new(config.initial_backoff(), config.max_backoff()),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Requests teardown of a stream connection. Cloneable, idempotent.
#[derive(Clone, Debug)]
pub struct Disconnector(Arc<watch::Sender<bool>>);

impl Disconnector {
    pub fn disconnect(&self) {
        self.0.send_replace(true);
    }
}

/// Time of the last liveness signal, shared by the read loop and the
/// heartbeat task.
#[derive(Clone)]
struct Liveness {
    origin: Instant,
    last_seen_ms: Arc<AtomicU64>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Stalled,
    Disconnected,
}

/// Owns the transport to the certificate stream and its lifecycle.
pub struct StreamConnection<O> {
    url: String,
    connector: Arc<dyn Connector>,
    observer: O,
    settings: StreamSettings,
    state_tx: watch::Sender<ConnectionState>,
    disconnect_tx: Arc<watch::Sender<bool>>,
    messages_received: u64,
}

impl<O: DomainsObserver + 'static> StreamConnection<O> {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        observer: O,
        settings: StreamSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (disconnect_tx, _) = watch::channel(false);
        Self {
            url: url.into(),
            connector,
            observer,
            settings,
            state_tx,
            disconnect_tx: Arc::new(disconnect_tx),
            messages_received: 0,
        }
    }

    /// Read-only view of the connection state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn disconnector(&self) -> Disconnector {
        Disconnector(self.disconnect_tx.clone())
    }

    /// Total frames read across all sessions.
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Runs the connection on its own task.
    pub fn spawn(self, max_retries: u32) -> StreamHandle
    where
        O: Send,
    {
        let disconnector = self.disconnector();
        let state_rx = self.subscribe();
        let mut connection = self;
        let join = tokio::spawn(async move { connection.connect(max_retries).await });
        StreamHandle {
            disconnector,
            state_rx,
            join,
        }
    }

    /// Connects and keeps the stream alive until disconnected or exhausted.
    ///
    /// # Returns
    /// * `Ok(())` after a requested disconnect
    /// * `Err(StreamError::Exhausted)` once `max_retries` consecutive
    ///   reconnect attempts have failed
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn connect(&mut self, max_retries: u32) -> Result<(), StreamError> {
        let mut machine = ConnectionStateMachine::new(max_retries, self.settings.backoff);
        let mut disconnect_rx = self.disconnect_tx.subscribe();
        let mut opened: Option<Transport> = None;

        let mut action = machine.handle(ConnectionEvent::Connect);
        self.publish(machine.state());

        loop {
            let event = match action {
                Action::Open => {
                    if *disconnect_rx.borrow() {
                        ConnectionEvent::Disconnect
                    } else {
                        info!("Connecting to certificate stream");
                        tokio::select! {
                            biased;
                            _ = disconnect_rx.wait_for(|requested| *requested) => ConnectionEvent::Disconnect,
                            result = self.connector.connect(&self.url) => match result {
                                Ok(transport) => {
                                    opened = Some(transport);
                                    ConnectionEvent::TransportOpened
                                }
                                Err(e) => {
                                    warn!(error = %e, "Failed to open stream transport");
                                    ConnectionEvent::TransportFailed
                                }
                            },
                        }
                    }
                }
                Action::Listen => match opened.take() {
                    Some(transport) => {
                        info!("Connected to certificate stream");
                        match self.run_session(transport).await {
                            SessionEnd::Lost => ConnectionEvent::TransportLost,
                            SessionEnd::Stalled => ConnectionEvent::HeartbeatTimeout,
                            SessionEnd::Disconnected => ConnectionEvent::Disconnect,
                        }
                    }
                    None => ConnectionEvent::TransportLost,
                },
                Action::ScheduleReconnect { attempt, delay } => {
                    metrics::counter!("stream_reconnects_total").increment(1);
                    info!(
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting to certificate stream after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = disconnect_rx.wait_for(|requested| *requested) => ConnectionEvent::Disconnect,
                        _ = tokio::time::sleep(delay) => ConnectionEvent::BackoffElapsed,
                    }
                }
                Action::GiveUp => {
                    error!(max_retries, "Reconnect attempts exhausted, giving up");
                    return Err(StreamError::Exhausted {
                        url: self.url.clone(),
                        retries: machine.consecutive_failures(),
                    });
                }
                Action::Stop | Action::Ignore => {
                    info!(
                        messages = self.messages_received,
                        "Certificate stream connection closed"
                    );
                    return Ok(());
                }
            };

            action = machine.handle(event);
            self.publish(machine.state());
        }
    }

    fn publish(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
        metrics::gauge!("stream_connection_state").set(state.as_gauge());
    }

    async fn run_session(&mut self, transport: Transport) -> SessionEnd {
        let Transport { mut reader, writer } = transport;
        let liveness = Liveness::new();
        let (stalled_tx, mut stalled_rx) = oneshot::channel();
        let mut heartbeat = spawn_heartbeat(writer, liveness.clone(), self.settings, stalled_tx);
        let mut disconnect_rx = self.disconnect_tx.subscribe();

        let end = loop {
            let frame = tokio::select! {
                biased;
                _ = disconnect_rx.wait_for(|requested| *requested) => break SessionEnd::Disconnected,
                _ = &mut stalled_rx => break SessionEnd::Stalled,
                frame = reader.read_message() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), &liveness).await,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => liveness.touch(),
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Stream server closed the connection");
                    break SessionEnd::Lost;
                }
                Some(Ok(_)) => trace!("Ignoring non-text frame"),
                Some(Err(e)) => {
                    warn!(error = %e, "Stream transport error");
                    break SessionEnd::Lost;
                }
                None => {
                    info!("Stream transport closed");
                    break SessionEnd::Lost;
                }
            }
        };

        if end == SessionEnd::Stalled {
            // The heartbeat task is closing the transport.
            let _ = tokio::time::timeout(CLOSE_GRACE, &mut heartbeat).await;
        }
        heartbeat.abort();

        // A stall closes the socket, so the read side may report the loss first.
        if end == SessionEnd::Lost && stalled_rx.try_recv().is_ok() {
            return SessionEnd::Stalled;
        }
        end
    }

    async fn handle_text(&mut self, text: &str, liveness: &Liveness) {
        self.messages_received += 1;
        metrics::counter!("stream_messages_total").increment(1);
        if self.messages_received % MESSAGE_LOG_INTERVAL == 0 {
            info!(
                messages = self.messages_received,
                "Certificate stream is flowing"
            );
        }

        match decode_message(text) {
            Ok(StreamMessage::Heartbeat) => {
                metrics::counter!("stream_heartbeats_total").increment(1);
                liveness.touch();
            }
            Ok(StreamMessage::Certificate(event)) => {
                metrics::counter!("stream_certificates_total").increment(1);
                trace!(domains = event.domains.len(), "Certificate received");
                self.observer.on_domains_observed(event).await;
            }
            Ok(StreamMessage::Other) => trace!("Ignoring frame of unknown type"),
            Err(e) => {
                metrics::counter!("stream_malformed_frames_total").increment(1);
                warn!(error = %e, "Dropping malformed stream frame");
            }
        }
    }
}

fn spawn_heartbeat(
    mut writer: Box<dyn HeartbeatSink>,
    liveness: Liveness,
    settings: StreamSettings,
    stalled_tx: oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut ping = interval_at(start + settings.heartbeat_interval, settings.heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stall_check = interval_at(
            start + settings.stall_check_interval,
            settings.stall_check_interval,
        );
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    trace!("Sending heartbeat ping");
                    if let Err(e) = writer.send_ping().await {
                        debug!(error = %e, "Heartbeat ping failed");
                    }
                }
                _ = stall_check.tick() => {
                    let silent_for = liveness.silent_for();
                    if silent_for >= settings.stall_timeout {
                        warn!(
                            silent_secs = silent_for.as_secs(),
                            "No heartbeat from certificate stream, closing connection"
                        );
                        metrics::counter!("stream_stalls_total").increment(1);
                        // Reported before closing: a close on a dead socket may never finish.
                        let _ = stalled_tx.send(());
                        match tokio::time::timeout(CLOSE_GRACE, writer.close()).await {
                            Ok(Err(e)) => debug!(error = %e, "Failed to close stalled transport"),
                            Err(_) => debug!("Close of stalled transport timed out"),
                            Ok(Ok(())) => {}
                        }
                        return;
                    }
                }
            }
        }
    })
}

/// Handle to a connection running on its own task.
pub struct StreamHandle {
    disconnector: Disconnector,
    state_rx: watch::Receiver<ConnectionState>,
    join: JoinHandle<Result<(), StreamError>>,
}

impl StreamHandle {
    /// Tears the connection down. Safe to call any number of times.
    pub fn disconnect(&self) {
        self.disconnector.disconnect();
    }

    pub fn disconnector(&self) -> Disconnector {
        self.disconnector.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Waits for the connection task to finish.
    pub async fn join(self) -> Result<(), StreamError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(StreamError::Task(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_liveness_tracks_silence() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(liveness.silent_for(), Duration::from_secs(12));

        liveness.touch();
        assert_eq!(liveness.silent_for(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(liveness.silent_for(), Duration::from_secs(3));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = StreamSettings::default();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.stall_timeout, Duration::from_secs(40));
        assert_eq!(settings.stall_check_interval, Duration::from_secs(5));
        assert_eq!(settings.backoff.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_disconnector_is_idempotent() {
        let (tx, rx) = watch::channel(false);
        let disconnector = Disconnector(Arc::new(tx));
        disconnector.disconnect();
        disconnector.disconnect();
        assert!(*rx.borrow());
    }
}
