#![allow(dead_code)]
//! Scripted transports for driving `StreamConnection` without a network.
use async_trait::async_trait;
use cabalwatch::network::{Connector, HeartbeatSink, Transport, TransportError, WebSocketConnection};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// One step of a scripted session, consumed by `read_message`.
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    Frame(Message),
    /// Sleeps before the next step.
    Delay(Duration),
    /// A transport error.
    Error,
    /// The server closes the connection.
    End,
}

/// What a single connection attempt yields.
#[derive(Debug, Clone)]
pub enum Attempt {
    Fail,
    /// Plays the steps, then stays silent until the sink is closed.
    Session(Vec<Step>),
    /// Like `Session`, but closing the sink never completes.
    Unresponsive(Vec<Step>),
}

/// Shared view of everything the connector and its transports did.
#[derive(Debug, Default)]
pub struct TransportLog {
    connects: Mutex<Vec<Instant>>,
    pings: AtomicUsize,
    closes: AtomicUsize,
}

impl TransportLog {
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    /// Gaps between consecutive connection attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        self.connect_times().windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Hands out the scripted attempts in order. Once the script runs out,
/// every further attempt fails.
pub struct ScriptedConnector {
    attempts: Mutex<VecDeque<Attempt>>,
    log: Arc<TransportLog>,
}

impl ScriptedConnector {
    pub fn new(attempts: Vec<Attempt>) -> (Arc<Self>, Arc<TransportLog>) {
        let log = Arc::new(TransportLog::default());
        let connector = Arc::new(Self {
            attempts: Mutex::new(attempts.into()),
            log: log.clone(),
        });
        (connector, log)
    }

    /// A connector whose every attempt fails.
    pub fn refusing() -> (Arc<Self>, Arc<TransportLog>) {
        Self::new(Vec::new())
    }

    /// A single session playing `steps`.
    pub fn session(steps: Vec<Step>) -> (Arc<Self>, Arc<TransportLog>) {
        Self::new(vec![Attempt::Session(steps)])
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        self.log.connects.lock().unwrap().push(Instant::now());
        let attempt = self.attempts.lock().unwrap().pop_front();
        match attempt {
            Some(Attempt::Session(steps)) => Ok(self.transport(steps, false)),
            Some(Attempt::Unresponsive(steps)) => Ok(self.transport(steps, true)),
            Some(Attempt::Fail) | None => Err(TransportError::Timeout(url.to_string())),
        }
    }
}

impl ScriptedConnector {
    fn transport(&self, steps: Vec<Step>, hang_on_close: bool) -> Transport {
        let (closed_tx, closed_rx) = watch::channel(false);
        Transport {
            reader: Box::new(ScriptedReader {
                steps: steps.into(),
                closed_rx,
            }),
            writer: Box::new(RecordingSink {
                closed_tx,
                hang_on_close,
                log: self.log.clone(),
            }),
        }
    }
}

struct ScriptedReader {
    steps: VecDeque<Step>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl WebSocketConnection for ScriptedReader {
    async fn read_message(&mut self) -> Option<Result<Message, WsError>> {
        loop {
            if *self.closed_rx.borrow() {
                return None;
            }
            match self.steps.pop_front() {
                Some(Step::Text(text)) => return Some(Ok(Message::Text(text.into()))),
                Some(Step::Frame(message)) => return Some(Ok(message)),
                Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Error) => return Some(Err(WsError::ConnectionClosed)),
                Some(Step::End) => return None,
                None => {
                    let _ = self.closed_rx.wait_for(|closed| *closed).await;
                    return None;
                }
            }
        }
    }
}

struct RecordingSink {
    closed_tx: watch::Sender<bool>,
    hang_on_close: bool,
    log: Arc<TransportLog>,
}

#[async_trait]
impl HeartbeatSink for RecordingSink {
    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.log.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        self.closed_tx.send_replace(true);
        Ok(())
    }
}
