//! Poll loop and checkup assembly.
//!
//! [`poll_tick`] is one synchronous pass over every channel. The async
//! [`PollingScheduler`] runs it on the blocking pool at a fixed interval
//! and owns the line backend. Probes are read before the state lock is
//! taken; [`CheckupRunner`] builds and publishes snapshots and is only
//! ever driven by the watchdog task.

use crate::channels::{input_bit, ChannelKind, ChannelState, Counters, RuntimeState};
use crate::diagnostics::Diagnostics;
use crate::line_io::{Level, LineIo, LineRef, TEMPERATURE_SENTINEL};
use crate::power_cycle::{evaluate_chain, PowerState};
use crate::protocol::Publisher;
use crate::telemetry::{Report, ReportKind, TEMP_POWER_FAULT_KEY, TEMP_POWER_KEY};
use crate::watchdog::{CheckupKind, CheckupSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type SharedState = Arc<Mutex<RuntimeState>>;

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Confirmed changes to publish, if any.
    pub event: Option<Report>,
    /// The periodic checkup cadence elapsed on this tick.
    pub checkup_due: bool,
}

/// Raw probe readings in channel order, `None` where a probe gave nothing.
pub type ProbeReadings = Vec<Option<String>>;

/// Names and lines of the temperature probes, in channel order.
pub fn probe_lines(state: &RuntimeState) -> Vec<(String, LineRef)> {
    state
        .registry
        .channels()
        .iter()
        .filter(|channel| matches!(channel.state, ChannelState::TempSensor { .. }))
        .map(|channel| (channel.name.clone(), channel.line.clone()))
        .collect()
}

pub fn read_probes(io: &mut dyn LineIo, probes: &[(String, LineRef)]) -> ProbeReadings {
    probes
        .iter()
        .map(|(name, line)| match io.read_temperature(line) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Probe '{}' gave no reading: {}", name, e);
                None
            }
        })
        .collect()
}

/// One poll pass: sample inputs, run the probe power chain, drive outputs.
pub fn poll_tick(state: &mut RuntimeState, io: &mut dyn LineIo, ticks_per_checkup: u32) -> TickOutcome {
    let probes = probe_lines(state);
    let readings = read_probes(io, &probes);
    poll_tick_with_probes(state, io, readings, ticks_per_checkup)
}

/// [`poll_tick`] with the probes already read.
pub fn poll_tick_with_probes(
    state: &mut RuntimeState,
    io: &mut dyn LineIo,
    readings: ProbeReadings,
    ticks_per_checkup: u32,
) -> TickOutcome {
    let RuntimeState {
        registry,
        temp_power,
        counters,
    } = state;

    counters.ticks = counters.ticks.wrapping_add(1);
    debug!("IO check {}", counters.ticks);

    let mut event = Report::new(ReportKind::Event);

    for channel in registry.channels_mut() {
        let kind = channel.kind();
        match &mut channel.state {
            ChannelState::Switch { filter, .. } => {
                let level = match io.read(&channel.line) {
                    Ok(level) => level,
                    Err(e) => {
                        warn!("Read of '{}' failed: {}", channel.name, e);
                        continue;
                    }
                };
                let update = filter.sample(input_bit(kind, level));
                if update.changed {
                    event.insert(channel.name.clone(), update.confirmed);
                }
            }
            ChannelState::Motion { filter, last_reported } => {
                let level = match io.read(&channel.line) {
                    Ok(level) => level,
                    Err(e) => {
                        warn!("Read of '{}' failed: {}", channel.name, e);
                        continue;
                    }
                };
                let update = filter.sample(input_bit(kind, level));
                // off is left for the next checkup to report
                if update.changed && update.confirmed == 1 && *last_reported != 1 {
                    event.insert(channel.name.clone(), update.confirmed);
                    *last_reported = 1;
                }
            }
            _ => {}
        }
    }

    if let Some(fault) = registry.temp_fault_mut() {
        match io.read(&fault.line) {
            Ok(level) => {
                let update = fault.filter.sample(input_bit(ChannelKind::TempFault, level));
                if update.changed {
                    event.insert(TEMP_POWER_FAULT_KEY, update.confirmed);
                }
                temp_power.fault = update.confirmed != 0;
            }
            Err(e) => warn!("Read of '{}' failed: {}", fault.name, e),
        }
    }

    if registry.has_temp_sensors() {
        let mut readings = readings.into_iter();
        for channel in registry.channels_mut() {
            if let ChannelState::TempSensor { reading, .. } = &mut channel.state {
                *reading = readings.next().flatten();
            }
        }

        let chain = registry.channels_mut().iter_mut().filter_map(|channel| match &mut channel.state {
            ChannelState::TempSensor { controller, reading } => Some((controller, reading.is_some())),
            _ => None,
        });
        let power = evaluate_chain(chain, temp_power.last, temp_power.commanded, temp_power.fault);

        for channel in registry.channels() {
            if let ChannelState::TempSensor { controller, .. } = &channel.state {
                if !controller.is_broke() {
                    continue;
                }
                if controller.state() == PowerState::Restart {
                    warn!(
                        "Temp sensor '{}' down and causing one-wire network restart ({})",
                        channel.name,
                        controller.restart_count()
                    );
                } else {
                    warn!("Temp sensor '{}' down", channel.name);
                }
            }
        }

        temp_power.on = power;
        temp_power.last = power;
    }

    if let Some(enable) = registry.temp_enable() {
        if let Err(e) = io.write(&enable.line, Level::from_bool(temp_power.on)) {
            warn!("Write of '{}' failed: {}", enable.name, e);
        }
    }

    for channel in registry.channels() {
        if let ChannelState::Output { commanded } = &channel.state {
            if let Err(e) = io.write(&channel.line, *commanded) {
                warn!("Write of '{}' failed: {}", channel.name, e);
            }
        }
    }

    counters.checkup_ticks += 1;
    let checkup_due = counters.checkup_ticks >= ticks_per_checkup.max(1);
    if checkup_due {
        counters.checkup_ticks = 0;
    }

    let event = if event.is_empty() {
        debug!("Nothing changed between timed io checks");
        None
    } else {
        Some(event)
    };

    TickOutcome { event, checkup_due }
}

/// Full snapshot of the current state. Motion channels are marked as
/// reported with their confirmed value.
pub fn snapshot(state: &mut RuntimeState, kind: ReportKind) -> Report {
    let mut report = Report::new(kind);

    for channel in state.registry.channels_mut() {
        match &mut channel.state {
            ChannelState::Switch { filter, .. } => report.insert(channel.name.clone(), *filter.confirmed()),
            ChannelState::Motion { filter, last_reported } => {
                *last_reported = *filter.confirmed();
                report.insert(channel.name.clone(), *last_reported);
            }
            ChannelState::TempSensor { reading, .. } => report.insert(
                channel.name.clone(),
                reading.clone().unwrap_or_else(|| TEMPERATURE_SENTINEL.to_string()),
            ),
            ChannelState::Output { commanded } => report.insert(channel.name.clone(), commanded.as_bit()),
        }
    }

    if state.registry.temp_fault().is_some() {
        report.insert(TEMP_POWER_FAULT_KEY, u8::from(state.temp_power.fault));
        report.insert(TEMP_POWER_KEY, u8::from(state.temp_power.on));
    }
    report
}

/// Advance the long-check counters and return which diagnostics are due.
pub fn plan_long_checks(counters: &mut Counters, diagnostics: &Diagnostics, every: u32, per_call: usize) -> Vec<usize> {
    counters.pings += 1;
    if counters.pings < every.max(1) {
        return Vec::new();
    }
    counters.pings = 0;
    let (picked, cursor) = diagnostics.rotation(counters.long_check_cursor, per_call);
    counters.long_check_cursor = cursor;
    picked.to_vec()
}

#[derive(Clone)]
pub struct CheckupRunner {
    state: SharedState,
    publisher: Publisher,
    diagnostics: Arc<Diagnostics>,
    long_checkup_freq: u32,
    long_checkup_leng: usize,
}

impl CheckupRunner {
    pub fn new(
        state: SharedState,
        publisher: Publisher,
        diagnostics: Arc<Diagnostics>,
        long_checkup_freq: u32,
        long_checkup_leng: usize,
    ) -> Self {
        Self {
            state,
            publisher,
            diagnostics,
            long_checkup_freq,
            long_checkup_leng,
        }
    }

    /// Build and publish one snapshot. Bootup snapshots carry every
    /// diagnostic and are retained.
    pub async fn run(&self, kind: CheckupKind) -> Report {
        let report_kind = match kind {
            CheckupKind::Bootup => ReportKind::Bootup,
            _ => ReportKind::Checkup,
        };

        let (mut report, due) = {
            let mut state = self.state.lock().await;
            let report = snapshot(&mut state, report_kind);
            let due = match kind {
                CheckupKind::Bootup => (0..self.diagnostics.checks().len()).collect(),
                _ => plan_long_checks(
                    &mut state.counters,
                    &self.diagnostics,
                    self.long_checkup_freq,
                    self.long_checkup_leng,
                ),
            };
            (report, due)
        };

        // diagnostics can take seconds, so they run without the state lock
        if !due.is_empty() {
            debug!("Running {} diagnostic(s) for {:?} checkup", due.len(), kind);
            report.extend(self.diagnostics.collect(&due).await);
        }

        match self.publisher.publish(&report) {
            Ok(()) => info!("{:?} checkup published ({} entries)", kind, report.len()),
            Err(e) => error!("{:?} checkup not published: {}", kind, e),
        }
        report
    }
}

pub struct PollingScheduler<L: LineIo> {
    io: Option<L>,
    state: SharedState,
    publisher: Publisher,
    checkups: CheckupSignal,
    interval: Duration,
    ticks_per_checkup: u32,
}

impl<L: LineIo + 'static> PollingScheduler<L> {
    pub fn new(
        io: L,
        state: SharedState,
        publisher: Publisher,
        checkups: CheckupSignal,
        interval: Duration,
        ticks_per_checkup: u32,
    ) -> Self {
        Self {
            io: Some(io),
            state,
            publisher,
            checkups,
            interval,
            ticks_per_checkup,
        }
    }

    /// One poll pass on the blocking pool. Returns `None` once the line
    /// backend has been lost to a panicking pass.
    pub async fn tick(&mut self) -> Option<TickOutcome> {
        let mut io = self.io.take()?;
        let probes = probe_lines(&*self.state.lock().await);
        let state = Arc::clone(&self.state);
        let ticks_per_checkup = self.ticks_per_checkup;

        let pass = task::spawn_blocking(move || {
            // w1 reads take most of a second each; keep them outside the lock
            let readings = read_probes(&mut io, &probes);
            let outcome = poll_tick_with_probes(&mut state.blocking_lock(), &mut io, readings, ticks_per_checkup);
            (io, outcome)
        });
        let outcome = match pass.await {
            Ok((io, outcome)) => {
                self.io = Some(io);
                outcome
            }
            Err(e) => {
                error!("Poll pass failed, line backend lost: {}", e);
                return None;
            }
        };

        if let Some(event) = &outcome.event {
            if let Err(e) = self.publisher.publish(event) {
                error!("Event not published: {}", e);
            }
        }
        if outcome.checkup_due {
            self.checkups.request(CheckupKind::Periodic);
        }
        Some(outcome)
    }

    /// Tick until `stop` flips. Returns the line backend unless a poll pass
    /// lost it.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Option<L> {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Polling every {:?}", self.interval);

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    if self.tick().await.is_none() {
                        break;
                    }
                }
            }
        }

        info!("Polling stopped");
        self.io
    }
}
