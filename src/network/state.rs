//! Connection lifecycle state machine.
//!
//! The machine is pure: it consumes `ConnectionEvent`s and answers with the
//! `Action` the driver in `network::StreamConnection` must take. Timers and
//! sockets live in the driver, which keeps retry and reset rules testable
//! without any I/O.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal. The retry budget is spent and no further attempts are made.
    Exhausted,
}

impl ConnectionState {
    /// Numeric form for the `stream_connection_state` gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Reconnecting => 3.0,
            ConnectionState::Exhausted => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The owner asked to start the lifecycle.
    Connect,
    /// The websocket handshake completed.
    TransportOpened,
    /// The websocket could not be opened.
    TransportFailed,
    /// An established transport closed or errored.
    TransportLost,
    /// No liveness signal within the stall timeout.
    HeartbeatTimeout,
    /// The reconnect delay has passed.
    BackoffElapsed,
    /// The owner asked to stop.
    Disconnect,
}

/// What the driver must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a new transport.
    Open,
    /// Start reading from the freshly opened transport.
    Listen,
    /// Wait `delay`, then feed `BackoffElapsed`. `attempt` is 1-based.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Give up and report exhaustion to the owner.
    GiveUp,
    /// Tear down and stop.
    Stop,
    /// The event does not apply in the current state.
    Ignore,
}

/// Exponential reconnect delay: `min(initial * 2^failures, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before the retry that follows `failures` earlier consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    consecutive_failures: u32,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl ConnectionStateMachine {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            max_retries,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed attempts since the last successful connection.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Action {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self.state, event) {
            (S::Exhausted, _) => Action::Ignore,
            (_, E::Disconnect) => {
                self.state = S::Disconnected;
                Action::Stop
            }
            (S::Disconnected, E::Connect) => {
                self.consecutive_failures = 0;
                self.state = S::Connecting;
                Action::Open
            }
            (S::Connecting, E::TransportOpened) => {
                self.consecutive_failures = 0;
                self.state = S::Connected;
                Action::Listen
            }
            (S::Connecting, E::TransportFailed)
            | (S::Connected, E::TransportLost)
            | (S::Connected, E::HeartbeatTimeout) => self.retry_or_give_up(),
            (S::Reconnecting, E::BackoffElapsed) => {
                self.state = S::Connecting;
                Action::Open
            }
            _ => Action::Ignore,
        }
    }

    fn retry_or_give_up(&mut self) -> Action {
        if self.consecutive_failures >= self.max_retries {
            self.state = ConnectionState::Exhausted;
            return Action::GiveUp;
        }
        let delay = self.backoff.delay_for(self.consecutive_failures);
        self.consecutive_failures += 1;
        self.state = ConnectionState::Reconnecting;
        Action::ScheduleReconnect {
            attempt: self.consecutive_failures,
            delay,
        }
    }
}
