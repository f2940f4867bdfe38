//! Websocket transport seam.
//!
//! The connection driver only sees the traits below. The real implementation
//! wraps tokio-tungstenite; tests plug in scripted fakes.

use async_trait::async_trait;
use futures_util::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to build TLS connector: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("websocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: WsError,
    },

    #[error("websocket handshake with {0} timed out")]
    Timeout(String),

    #[error("failed to send frame: {0}")]
    Send(#[source] WsError),
}

/// Trait for WebSocket connections to enable testing with fake implementations
#[async_trait]
pub trait WebSocketConnection: Send + Sync {
    /// Reads the next message from the WebSocket connection
    ///
    /// # Returns
    /// * `Some(Ok(Message))` if a message was successfully received
    /// * `Some(Err(error))` if there was an error reading the message
    /// * `None` if the connection has been closed
    async fn read_message(&mut self) -> Option<Result<Message, WsError>>;
}

/// Write half of a connection, owned by the heartbeat task.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Closes the connection. Pending reads on the other half end afterwards.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An opened connection, split into its read and write halves.
pub struct Transport {
    pub reader: Box<dyn WebSocketConnection>,
    pub writer: Box<dyn HeartbeatSink>,
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError>;
}

/// Connector backed by tokio-tungstenite over native-tls.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    allow_invalid_certs: bool,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(allow_invalid_certs: bool, connect_timeout: Duration) -> Self {
        Self {
            allow_invalid_certs,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.allow_invalid_certs)
            .build()?;

        let handshake = connect_async_tls_with_config(
            url,
            None,
            false,
            Some(tokio_tungstenite::Connector::NativeTls(tls)),
        );

        let (ws_stream, response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(url.to_string()))?
            .map_err(|source| TransportError::Handshake {
                url: url.to_string(),
                source,
            })?;
        debug!(status = %response.status(), "Websocket handshake completed");

        let (sink, stream) = ws_stream.split();
        Ok(Transport {
            reader: Box::new(TungsteniteReader { stream }),
            writer: Box::new(TungsteniteWriter { sink }),
        })
    }
}

struct TungsteniteReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl WebSocketConnection for TungsteniteReader {
    async fn read_message(&mut self) -> Option<Result<Message, WsError>> {
        self.stream.next().await
    }
}

struct TungsteniteWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl HeartbeatSink for TungsteniteWriter {
    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Default::default()))
            .await
            .map_err(TransportError::Send)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(TransportError::Send)
    }
}
