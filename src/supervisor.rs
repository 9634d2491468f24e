//! Connection supervision for the bus link.
//!
//! ```text
//!   Disconnected ──► Connecting ──► Connected ──► Disconnected ──► ...
//!                        │                             │
//!                        └──── attempts exhausted ─────┴──► Fatal
//! ```
//!
//! Startup and every reconnect after an unclean disconnect make a bounded
//! number of attempts with a fixed backoff. Timeouts in the receive loop are
//! transient: they bump a counter and reconnect on the next iteration, and
//! too many in a row are fatal. Anything unclassified is fatal at once.

use crate::protocol::{Inbound, InboundMessage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Message(InboundMessage),
    /// Reason 0 is a disconnect we asked for.
    Disconnected { reason: u8 },
    /// Protocol traffic with nothing for us.
    Idle,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Receive side of the bus. Each `poll` drives the connection (including
/// reconnecting after an error) until the next event.
pub trait BusTransport: Send {
    fn poll(&mut self) -> impl Future<Output = Result<BusEvent, TransportError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorExit {
    Shutdown,
    StartupExhausted,
    ReconnectExhausted,
    Unexpected,
}

impl SupervisorExit {
    pub fn exit_code(self) -> i32 {
        match self {
            SupervisorExit::Shutdown => 0,
            SupervisorExit::StartupExhausted | SupervisorExit::ReconnectExhausted => 1,
            SupervisorExit::Unexpected => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub connect_attempts: u32,
    pub backoff: Duration,
    pub connect_timeout: Duration,
    /// Consecutive receive-loop timeouts tolerated before giving up.
    pub max_transient: u32,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            max_transient: 10,
        }
    }
}

enum Attempt {
    Connected,
    Failed(String),
    Fatal(SupervisorExit),
}

pub struct ConnectionSupervisor<T: BusTransport> {
    transport: T,
    policy: SupervisorPolicy,
    inbound: mpsc::Sender<Inbound>,
    state: LinkState,
    transient: u32,
}

impl<T: BusTransport> ConnectionSupervisor<T> {
    pub fn new(transport: T, policy: SupervisorPolicy, inbound: mpsc::Sender<Inbound>) -> Self {
        Self {
            transport,
            policy,
            inbound,
            state: LinkState::Disconnected,
            transient: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Link {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    async fn forward(sender: &mpsc::Sender<Inbound>, inbound: Inbound) {
        if sender.send(inbound).await.is_err() {
            warn!("Dispatcher gone, inbound traffic dropped");
        }
    }

    /// One connection attempt bounded by the connect timeout.
    async fn attempt(&mut self) -> Attempt {
        self.set_state(LinkState::Connecting);
        let timeout = self.policy.connect_timeout;
        let attempt = tokio::time::timeout(timeout, async {
            loop {
                match self.transport.poll().await {
                    Ok(BusEvent::Connected) => return Attempt::Connected,
                    Ok(BusEvent::Idle) | Ok(BusEvent::Message(_)) => continue,
                    Ok(BusEvent::Disconnected { reason: 0 }) | Err(TransportError::Closed) => {
                        return Attempt::Fatal(SupervisorExit::Shutdown)
                    }
                    Ok(BusEvent::Disconnected { reason }) => {
                        return Attempt::Failed(format!("disconnected with reason {}", reason))
                    }
                    Err(TransportError::Other(e)) => {
                        error!("Exception while connecting: {}", e);
                        return Attempt::Fatal(SupervisorExit::Unexpected);
                    }
                    Err(e) => return Attempt::Failed(e.to_string()),
                }
            }
        })
        .await
        .unwrap_or_else(|_| Attempt::Failed(format!("no connection within {:?}", timeout)));

        match &attempt {
            Attempt::Connected => {
                self.set_state(LinkState::Connected);
                self.transient = 0;
                Self::forward(&self.inbound, Inbound::Connected).await;
            }
            Attempt::Failed(_) | Attempt::Fatal(SupervisorExit::Shutdown) => self.set_state(LinkState::Disconnected),
            Attempt::Fatal(_) => self.set_state(LinkState::Fatal),
        }
        attempt
    }

    /// Up to `connect_attempts` attempts with backoff between them.
    async fn establish(&mut self, exhausted: SupervisorExit) -> Result<(), SupervisorExit> {
        let max = self.policy.connect_attempts.max(1);
        for attempt in 1..=max {
            match self.attempt().await {
                Attempt::Connected => {
                    info!("Connected (attempt {}/{})", attempt, max);
                    return Ok(());
                }
                Attempt::Fatal(exit) => return Err(exit),
                Attempt::Failed(reason) => {
                    error!("Connection attempt {}/{} failed: {}", attempt, max, reason);
                    if attempt < max {
                        info!("Waiting {:?} to reconnect...", self.policy.backoff);
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }
        error!("Too many connection attempts ({}), giving up", max);
        self.set_state(LinkState::Fatal);
        Err(exhausted)
    }

    /// Connect, then run the receive loop until shutdown or a fatal error.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> SupervisorExit {
        let started = tokio::select! {
            biased;
            _ = stop.changed() => return SupervisorExit::Shutdown,
            started = self.establish(SupervisorExit::StartupExhausted) => started,
        };
        if let Err(exit) = started {
            return exit;
        }
        info!("Startup success");

        let mut reconnect = false;
        loop {
            if reconnect {
                reconnect = false;
                let attempt = tokio::select! {
                    biased;
                    _ = stop.changed() => return SupervisorExit::Shutdown,
                    attempt = self.attempt() => attempt,
                };
                match attempt {
                    Attempt::Connected => info!("Reconnected"),
                    Attempt::Fatal(exit) => return exit,
                    Attempt::Failed(reason) => {
                        if let Err(exit) = self.transient_failure(&reason) {
                            return exit;
                        }
                        reconnect = true;
                        continue;
                    }
                }
            }

            let event = tokio::select! {
                biased;
                _ = stop.changed() => return SupervisorExit::Shutdown,
                event = self.transport.poll() => event,
            };

            match event {
                Ok(BusEvent::Connected) => {
                    self.transient = 0;
                    self.set_state(LinkState::Connected);
                    Self::forward(&self.inbound, Inbound::Connected).await;
                }
                Ok(BusEvent::Message(message)) => {
                    self.transient = 0;
                    Self::forward(&self.inbound, Inbound::Message(message)).await;
                }
                Ok(BusEvent::Idle) => self.transient = 0,
                Ok(BusEvent::Disconnected { reason: 0 }) => {
                    info!("Disconnected cleanly");
                    self.set_state(LinkState::Disconnected);
                    return SupervisorExit::Shutdown;
                }
                Ok(BusEvent::Disconnected { reason }) => {
                    warn!("Unexpected disconnection (reason {}), reconnecting", reason);
                    self.set_state(LinkState::Disconnected);
                    if let Err(exit) = self.reestablish(&mut stop).await {
                        return exit;
                    }
                }
                Err(TransportError::Timeout(reason)) => {
                    if let Err(exit) = self.transient_failure(&reason) {
                        return exit;
                    }
                    reconnect = true;
                }
                Err(e @ (TransportError::ConnectionLost(_) | TransportError::Refused(_))) => {
                    warn!("{}, reconnecting", e);
                    self.set_state(LinkState::Disconnected);
                    if let Err(exit) = self.reestablish(&mut stop).await {
                        return exit;
                    }
                }
                Err(TransportError::Closed) => {
                    info!("Transport closed");
                    self.set_state(LinkState::Disconnected);
                    return SupervisorExit::Shutdown;
                }
                Err(TransportError::Other(e)) => {
                    error!("Exception in MQTT loop: {}", e);
                    self.set_state(LinkState::Fatal);
                    return SupervisorExit::Unexpected;
                }
            }
        }
    }

    async fn reestablish(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), SupervisorExit> {
        tokio::select! {
            biased;
            _ = stop.changed() => Err(SupervisorExit::Shutdown),
            result = self.establish(SupervisorExit::ReconnectExhausted) => result,
        }
    }

    fn transient_failure(&mut self, reason: &str) -> Result<(), SupervisorExit> {
        self.transient += 1;
        let max = self.policy.max_transient.max(1);
        error!("MQTT loop error ({}). Attempting to reconnect: {}/{}", reason, self.transient, max);
        if self.transient >= max {
            error!("Too many consecutive transport errors, giving up");
            self.set_state(LinkState::Fatal);
            return Err(SupervisorExit::ReconnectExhausted);
        }
        self.set_state(LinkState::Disconnected);
        Ok(())
    }
}

/// One scripted transport step.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Yield(Result<BusEvent, TransportError>),
    /// Hang for this long before moving on.
    Stall(Duration),
}

/// Transport that replays a script, then waits forever. Nothing in the
/// binaries uses it; it lets integration tests drive the supervisor and
/// [`crate::daemon::run`] without a broker.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    steps: VecDeque<ScriptStep>,
    polls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared poll counter, readable after the transport has been moved.
    pub fn poll_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.polls)
    }
}

impl BusTransport for ScriptedTransport {
    async fn poll(&mut self) -> Result<BusEvent, TransportError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        loop {
            match self.steps.pop_front() {
                Some(ScriptStep::Yield(result)) => return result,
                Some(ScriptStep::Stall(delay)) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}
