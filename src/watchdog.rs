//! Deadman timer.
//!
//! Every checkup runs on the watchdog task. Other activities only send a
//! request through [`CheckupSignal`]; the watchdog runs it and then starts a
//! fresh wait window. If the window elapses with no request, the watchdog
//! runs a checkup on its own.

use crate::scheduler::CheckupRunner;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Pending requests beyond this are folded into the ones already queued.
const SIGNAL_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckupKind {
    /// Snapshot after a (re)connection, published retained.
    Bootup,
    /// Poll cadence elapsed.
    Periodic,
    /// Asked for over the bus.
    Requested,
    /// Window elapsed with nothing else happening.
    Deadman,
}

/// A bootup that found the queue full. Plain checkups cannot stand in for
/// it, so it is parked here until the watchdog picks it up.
#[derive(Debug, Default)]
struct PendingBootup {
    flag: AtomicBool,
    wake: Notify,
}

impl PendingBootup {
    fn park(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct CheckupSignal {
    tx: mpsc::Sender<CheckupKind>,
    bootup: Arc<PendingBootup>,
}

impl CheckupSignal {
    pub fn channel() -> (Self, CheckupRequests) {
        let (tx, rx) = mpsc::channel(SIGNAL_DEPTH);
        let bootup = Arc::new(PendingBootup::default());
        (
            Self {
                tx,
                bootup: Arc::clone(&bootup),
            },
            CheckupRequests { rx, bootup },
        )
    }

    /// Ask the watchdog for a checkup. Returns `false` once the watchdog
    /// has gone away.
    pub fn request(&self, kind: CheckupKind) -> bool {
        match self.tx.try_send(kind) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(CheckupKind::Bootup)) => {
                debug!("Checkup queue full, bootup parked");
                self.bootup.park();
                true
            }
            Err(mpsc::error::TrySendError::Full(kind)) => {
                debug!("{:?} checkup coalesced with pending requests", kind);
                true
            }
            Err(mpsc::error::TrySendError::Closed(kind)) => {
                warn!("{:?} checkup requested after watchdog stopped", kind);
                false
            }
        }
    }
}

/// Receiving side of [`CheckupSignal`]. A parked bootup is served before
/// anything queued.
#[derive(Debug)]
pub struct CheckupRequests {
    rx: mpsc::Receiver<CheckupKind>,
    bootup: Arc<PendingBootup>,
}

impl CheckupRequests {
    /// Next request, or `None` once every signal has been dropped.
    pub async fn recv(&mut self) -> Option<CheckupKind> {
        loop {
            if self.bootup.take() {
                return Some(CheckupKind::Bootup);
            }
            tokio::select! {
                biased;
                _ = self.bootup.wake.notified() => continue,
                request = self.rx.recv() => return request,
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<CheckupKind, mpsc::error::TryRecvError> {
        if self.bootup.take() {
            return Ok(CheckupKind::Bootup);
        }
        self.rx.try_recv()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogStats {
    pub bootup: u32,
    pub periodic: u32,
    pub requested: u32,
    pub deadman: u32,
}

impl WatchdogStats {
    fn record(&mut self, kind: CheckupKind) {
        let slot = match kind {
            CheckupKind::Bootup => &mut self.bootup,
            CheckupKind::Periodic => &mut self.periodic,
            CheckupKind::Requested => &mut self.requested,
            CheckupKind::Deadman => &mut self.deadman,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn total(&self) -> u32 {
        self.bootup + self.periodic + self.requested + self.deadman
    }
}

pub struct Watchdog {
    runner: CheckupRunner,
    window: Duration,
    requests: CheckupRequests,
}

impl Watchdog {
    pub fn new(runner: CheckupRunner, window: Duration, requests: CheckupRequests) -> Self {
        Self {
            runner,
            window,
            requests,
        }
    }

    /// Serve requests until `stop` flips. A checkup in progress finishes
    /// before the stop is seen.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> WatchdogStats {
        let mut stats = WatchdogStats::default();
        info!("Deadman window {:?}", self.window);

        loop {
            let kind = tokio::select! {
                biased;
                _ = stop.changed() => break,
                request = self.requests.recv() => match request {
                    Some(kind) => kind,
                    None => break,
                },
                _ = tokio::time::sleep(self.window) => {
                    warn!("No checkup in {:?}, deadman checkup", self.window);
                    CheckupKind::Deadman
                }
            };

            self.runner.run(kind).await;
            stats.record(kind);
        }

        info!("Watchdog stopped after {} checkup(s)", stats.total());
        stats
    }

    pub fn spawn(self) -> WatchdogHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        WatchdogHandle { stop, task }
    }
}

pub struct WatchdogHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<WatchdogStats>,
}

impl WatchdogHandle {
    pub async fn shutdown(self) -> Result<WatchdogStats, JoinError> {
        let _ = self.stop.send(true);
        self.task.await
    }
}
