//! Connection Lifecycle
//!
//! The broker connection moves through
//! `Disconnected -> Connecting -> Connected -> Disconnected ...` until a
//! deliberate shutdown puts it in the terminal `Stopping` state.
//!
//! [`ConnectionStateMachine`] holds the transition rules and is free of I/O.
//! [`ConnectionDriver`] polls the transport, applies the rules, sleeps the
//! reconnect backoff and forwards everything the session needs to know as
//! [`ConnectionEvent`]s on an unbounded channel, so polling never waits on
//! the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{Event, EventLoop, Outgoing, Packet};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::types::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Deliberate shutdown; no further reconnects
    Stopping = 3,
}

impl ConnectionState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Stopping,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Stopping => write!(f, "stopping"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stop Signal
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StopInner {
    stopping: AtomicBool,
    notify: Notify,
}

/// Process-wide "stopping" flag shared by the session and the driver.
///
/// Set before the deliberate disconnect is sent, and checked before every
/// reconnect is scheduled or attempted.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set
    pub async fn wait(&self) {
        loop {
            // Register before checking so a trigger in between is not lost
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State Machine
// ─────────────────────────────────────────────────────────────────────────────

/// What to do after a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait `delay`, then attempt again. `report` marks the first failure of
    /// a streak, which is logged prominently.
    Retry { delay: Duration, report: bool },
    /// Shutdown in progress; never reconnect
    Stop,
}

/// Pure reconnect rules
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    reconnect_delay: Duration,
    /// Consecutive failures since the last successful connection
    failures: u32,
    attempts: u64,
}

impl ConnectionStateMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_delay,
            failures: 0,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of connection attempts started so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Enter `Connecting`, unless a shutdown has begun.
    ///
    /// Returns `false` when no attempt may be made.
    pub fn begin_attempt(&mut self, stopping: bool) -> bool {
        if stopping || self.state == ConnectionState::Stopping {
            self.state = ConnectionState::Stopping;
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.attempts += 1;
        true
    }

    /// The transport reported an open, authenticated session
    pub fn on_connected(&mut self) {
        if self.state != ConnectionState::Stopping {
            self.state = ConnectionState::Connected;
        }
        self.failures = 0;
    }

    /// The connection attempt started by [`Self::begin_attempt`] failed or
    /// was closed unexpectedly
    pub fn on_failure(&mut self, stopping: bool) -> Backoff {
        if stopping || self.state == ConnectionState::Stopping {
            self.state = ConnectionState::Stopping;
            return Backoff::Stop;
        }
        self.state = ConnectionState::Disconnected;
        self.failures += 1;
        Backoff::Retry {
            delay: self.reconnect_delay,
            report: self.failures == 1,
        }
    }

    /// Deliberate shutdown
    pub fn stop(&mut self) {
        self.state = ConnectionState::Stopping;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-level event the driver cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// CONNACK accepted by the broker
    ConnAck,
    Publish { topic: String, payload: Vec<u8> },
    /// Our own DISCONNECT went out
    Disconnect,
    Other,
}

/// Inbound half of an MQTT connection.
///
/// Polling again after an error starts a new connection attempt.
#[async_trait]
pub trait TransportEvents: Send {
    async fn poll(&mut self) -> Result<TransportEvent>;
}

#[async_trait]
impl TransportEvents for EventLoop {
    async fn poll(&mut self) -> Result<TransportEvent> {
        let event = match EventLoop::poll(self).await? {
            Event::Incoming(Packet::ConnAck(_)) => TransportEvent::ConnAck,
            Event::Incoming(Packet::Publish(publish)) => TransportEvent::Publish {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Event::Outgoing(Outgoing::Disconnect) => TransportEvent::Disconnect,
            _ => TransportEvent::Other,
        };
        Ok(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Event delivered to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// How long to keep polling after shutdown so the DISCONNECT can be flushed
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Runs the connection lifecycle over a [`TransportEvents`] source
pub struct ConnectionDriver<T> {
    transport: T,
    machine: ConnectionStateMachine,
    stop: StopSignal,
    state: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl<T: TransportEvents> ConnectionDriver<T> {
    pub fn new(
        transport: T,
        reconnect_delay: Duration,
        stop: StopSignal,
        state: Arc<AtomicU8>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            transport,
            machine: ConnectionStateMachine::new(reconnect_delay),
            stop,
            state,
            events,
        }
    }

    fn publish_state(&self) {
        self.state.store(self.machine.state() as u8, Ordering::SeqCst);
    }

    /// Forward an event; `false` once the session is gone.
    ///
    /// After shutdown the session may already have dropped its receiver while
    /// the DISCONNECT is still being flushed, so failures are tolerated then.
    fn emit(&self, event: ConnectionEvent) -> bool {
        self.events.send(event).is_ok() || self.stop.is_set()
    }

    async fn next_event(&mut self) -> Option<Result<TransportEvent>> {
        if self.stop.is_set() {
            tokio::time::timeout(DISCONNECT_GRACE, self.transport.poll())
                .await
                .ok()
        } else {
            Some(self.transport.poll().await)
        }
    }

    /// Drive the connection until shutdown
    pub async fn run(mut self) {
        'attempts: while self.machine.begin_attempt(self.stop.is_set()) {
            self.publish_state();
            debug!(attempt = self.machine.attempts(), "Connecting to MQTT broker");

            let failure = loop {
                let Some(polled) = self.next_event().await else {
                    debug!("Gave up waiting for DISCONNECT to flush");
                    break 'attempts;
                };

                match polled {
                    Ok(TransportEvent::ConnAck) => {
                        self.machine.on_connected();
                        self.publish_state();
                        info!("Connected to MQTT broker");
                        if !self.emit(ConnectionEvent::Connected) {
                            break 'attempts;
                        }
                    }
                    Ok(TransportEvent::Publish { topic, payload }) => {
                        if !self.emit(ConnectionEvent::Message { topic, payload }) {
                            break 'attempts;
                        }
                    }
                    Ok(TransportEvent::Disconnect) => {
                        if self.stop.is_set() {
                            break 'attempts;
                        }
                        break "disconnected".to_string();
                    }
                    Ok(TransportEvent::Other) => {}
                    Err(e) => break e.to_string(),
                }
            };

            if self.machine.state().is_connected() {
                self.emit(ConnectionEvent::Disconnected);
            }

            match self.machine.on_failure(self.stop.is_set()) {
                Backoff::Retry { delay, report } => {
                    self.publish_state();
                    if report {
                        warn!(
                            "MQTT connection failed: {}; retrying in {}s",
                            failure,
                            delay.as_secs()
                        );
                    } else {
                        debug!(error = %failure, "MQTT connection still failing");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.wait() => {}
                    }
                }
                Backoff::Stop => break,
            }
        }

        self.machine.stop();
        self.publish_state();
        info!("MQTT connection stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
