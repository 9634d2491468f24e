//! Task wiring.
//!
//! ```text
//!  bus ──► ConnectionSupervisor ──Inbound──► Dispatcher ──► RuntimeState
//!                                                │
//!  PollingScheduler ──tick──► RuntimeState       │ checkup requests
//!          │                                     ▼
//!          └──── periodic requests ──────────► Watchdog ──► CheckupRunner
//! ```
//!
//! The poll task is the only user of the line backend. Inbound bus traffic
//! goes through one queue so handlers never run concurrently.

use crate::auth::CommandAuthenticator;
use crate::channels::{ChannelRegistry, RuntimeState};
use crate::config::{Config, ConfigError};
use crate::diagnostics::Diagnostics;
use crate::line_io::{LineError, LineIo};
use crate::protocol::{BusClient, Inbound, Publisher, Route, Topics};
use crate::scheduler::{CheckupRunner, PollingScheduler, SharedState};
use crate::supervisor::{BusTransport, ConnectionSupervisor, SupervisorExit, SupervisorPolicy};
use crate::telemetry::unix_time_secs;
use crate::watchdog::{CheckupKind, CheckupSignal, Watchdog};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

const INBOUND_DEPTH: usize = 64;
/// Time allowed for the disconnect to reach the broker on shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("line setup failed: {0}")]
    Line(#[from] LineError),
}

/// Routes inbound bus traffic to its handler.
pub struct Dispatcher {
    state: SharedState,
    publisher: Publisher,
    authenticator: CommandAuthenticator,
    checkups: CheckupSignal,
}

impl Dispatcher {
    pub fn new(
        state: SharedState,
        publisher: Publisher,
        authenticator: CommandAuthenticator,
        checkups: CheckupSignal,
    ) -> Self {
        Self {
            state,
            publisher,
            authenticator,
            checkups,
        }
    }

    pub async fn handle(&self, inbound: Inbound) {
        let message = match inbound {
            Inbound::Connected => {
                if let Err(e) = self.publisher.subscribe_all() {
                    error!("Subscription setup failed: {}", e);
                }
                self.checkups.request(CheckupKind::Bootup);
                return;
            }
            Inbound::Message(message) => message,
        };

        match self.publisher.topics().route(&message) {
            Route::CheckupRequest => {
                info!("Checkup requested on {}", message.topic);
                self.checkups.request(CheckupKind::Requested);
            }
            Route::TempPower(on) => {
                info!("Temperature bus power commanded {}", if on { "on" } else { "off" });
                self.state.lock().await.temp_power.commanded = on;
            }
            Route::Command(raw) => {
                let mut state = self.state.lock().await;
                if let Some(applied) = self.authenticator.apply(&raw, unix_time_secs(), &mut state.registry) {
                    info!("Command accepted on {}: {} output(s) updated", message.topic, applied.len());
                }
            }
            Route::Unknown => debug!("Ignoring message on {}", message.topic),
        }
    }

    /// Handle messages until every sender is gone.
    pub async fn run(self, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some(message) = inbound.recv().await {
            self.handle(message).await;
        }
        debug!("Dispatcher stopped");
    }
}

pub fn supervisor_policy(config: &Config) -> SupervisorPolicy {
    SupervisorPolicy {
        connect_attempts: config.connect_attempts,
        backoff: config.reconnect_backoff(),
        connect_timeout: config.mqtt_timeout(),
        max_transient: config.connect_attempts,
    }
}

/// Resolve channels, configure lines and seed the runtime state.
pub fn bootstrap(config: &Config, io: &mut dyn LineIo) -> Result<RuntimeState, DaemonError> {
    let acquisitions = config.resolve_acquisitions()?;
    let registry = ChannelRegistry::build(&acquisitions, config.thresholds(), config.temp_max_restart, io)?;
    info!("{} channel(s) configured for '{}'", registry.channels().len(), config.name);
    Ok(RuntimeState::new(registry))
}

/// Run the daemon until `shutdown` resolves or the bus link fails for good.
pub async fn run<L, T, S>(
    config: &Config,
    mut io: L,
    client: Arc<dyn BusClient>,
    transport: T,
    shutdown: S,
) -> Result<SupervisorExit, DaemonError>
where
    L: LineIo + 'static,
    T: BusTransport + 'static,
    S: Future<Output = ()>,
{
    let state: SharedState = Arc::new(Mutex::new(bootstrap(config, &mut io)?));
    let publisher = Publisher::new(client, Topics::new(&config.name));

    let tokens = config.tokens.clone().unwrap_or_default();
    let authenticator = CommandAuthenticator::from_tokens(&config.token_prefix, &tokens, config.cmd_max_age());
    let diagnostics = Arc::new(Diagnostics::new(config.boot_checks()?, config.diagnostic_timeout()));

    let (checkups, requests) = CheckupSignal::channel();
    let runner = CheckupRunner::new(
        Arc::clone(&state),
        publisher.clone(),
        diagnostics,
        config.long_checkup_freq,
        config.long_checkup_leng,
    );
    let watchdog = Watchdog::new(runner, config.deadman_window(), requests).spawn();

    let (poll_stop, poll_stop_rx) = watch::channel(false);
    let scheduler = PollingScheduler::new(
        io,
        Arc::clone(&state),
        publisher.clone(),
        checkups.clone(),
        config.poll_interval(),
        config.ticks_per_checkup(),
    );
    let poller = tokio::spawn(scheduler.run(poll_stop_rx));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
    let dispatcher = Dispatcher::new(Arc::clone(&state), publisher.clone(), authenticator, checkups);
    let dispatcher = tokio::spawn(dispatcher.run(inbound_rx));

    let (link_stop, link_stop_rx) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(transport, supervisor_policy(config), inbound_tx);
    let mut link = tokio::spawn(supervisor.run(link_stop_rx));

    let early_exit = tokio::select! {
        exit = &mut link => Some(exit.unwrap_or_else(|e| {
            error!("Bus task failed: {}", e);
            SupervisorExit::Unexpected
        })),
        _ = shutdown => {
            warn!("Caught a deadly signal, shutting down");
            None
        }
    };

    match watchdog.shutdown().await {
        Ok(stats) => debug!("Watchdog ran {:?}", stats),
        Err(e) => error!("Watchdog task failed: {}", e),
    }

    let _ = poll_stop.send(true);
    if let Err(e) = poller.await {
        error!("Poll task failed: {}", e);
    }

    let exit = match early_exit {
        Some(exit) => exit,
        None => {
            publisher.disconnect();
            match tokio::time::timeout(DISCONNECT_GRACE, &mut link).await {
                Ok(exit) => exit.unwrap_or(SupervisorExit::Unexpected),
                Err(_) => {
                    warn!("Bus did not close within {:?}", DISCONNECT_GRACE);
                    let _ = link_stop.send(true);
                    link.await.unwrap_or(SupervisorExit::Unexpected)
                }
            }
        }
    };

    if let Err(e) = dispatcher.await {
        error!("Dispatcher task failed: {}", e);
    }

    info!("Stopped ({:?})", exit);
    Ok(exit)
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = interrupt => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = interrupt.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}
