//! # Hardware Data Collector
//!
//! An unattended telemetry/control daemon for a fixed set of digital sensor
//! lines: door and light switches, PIR motion sensors, one-wire temperature
//! probes with a shared power rail, and commanded output lines. State changes
//! and periodic snapshots go out over MQTT; authenticated commands come back
//! in to drive the outputs.
//!
//! ## Features
//!
//! - **Debouncing**: noisy samples only count once they persist
//! - **Probe bus recovery**: a dead one-wire probe power-cycles the shared rail
//! - **Events and checkups**: per-tick change events plus full snapshots, with
//!   a deadman timer guaranteeing a minimum report cadence
//! - **Supervised link**: bounded reconnect policy with distinct exit statuses
//! - **Authenticated commands**: checksummed tokens, HMAC-SHA256 tags and a
//!   freshness window
//!
//! ## Quick Start
//!
//! ```rust
//! use hdc::DebounceFilter;
//!
//! // A switch line that has to hold a new value for three polls
//! let mut door = DebounceFilter::new(0u8, 3);
//!
//! assert!(!door.sample(1).changed);
//! assert!(!door.sample(1).changed);
//! assert!(door.sample(1).changed);
//! assert_eq!(*door.confirmed(), 1);
//! ```
//!
//! ## Architecture
//!
//! - [`debounce`] - confirmation filter for raw samples
//! - [`power_cycle`] - restart state machine for the probe bus
//! - [`channels`] - channel registry and runtime state
//! - [`line_io`] - hardware line access (sysfs and simulated)
//! - [`scheduler`] - poll tick and checkup assembly
//! - [`watchdog`] - deadman timer that runs every checkup
//! - [`supervisor`] - bus connection policy
//! - [`auth`] - tokens and command authentication
//! - [`daemon`] - task wiring and shutdown

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod auth;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod debounce;
pub mod diagnostics;
pub mod line_io;
pub mod mqtt;
pub mod power_cycle;
pub mod protocol;
pub mod scheduler;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;

// Re-export main public types for convenience
pub use auth::{CommandAuthenticator, CommandEnvelope, TrustedSecret};
pub use channels::{ChannelRegistry, RuntimeState};
pub use config::Config;
pub use debounce::DebounceFilter;
pub use line_io::{LineIo, SimulatedLines, SysfsLines};
pub use power_cycle::{PowerCycleController, PowerState};
pub use scheduler::{CheckupRunner, PollingScheduler};
pub use supervisor::{ConnectionSupervisor, SupervisorExit};
pub use watchdog::{CheckupKind, CheckupRequests, CheckupSignal, Watchdog};
