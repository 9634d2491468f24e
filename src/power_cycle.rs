//! Restart logic for the shared one-wire temperature bus.
//!
//! ```text
//!            broke                     always
//!   Init ───────────► Restart ──────────────────► Check
//!    ▲                   ▲                          │
//!    │                   └── broke && budget left ──┤
//!    └──────────────────────── !broke ──────────────┘
//! ```
//!
//! A probe is judged broken when power was applied last cycle, the rail
//! reports no fault, and the probe still returned nothing. Entering
//! `Restart` forces the bus power off for one cycle.

use serde::{Deserialize, Serialize};

pub const DEFAULT_ALLOWED_RESTARTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Init,
    Restart,
    Check,
}

impl PowerState {
    pub fn code(self) -> u8 {
        match self {
            PowerState::Init => 0,
            PowerState::Restart => 1,
            PowerState::Check => 2,
        }
    }

    /// Decode a raw state code; anything unrecognized is corrupt and
    /// restarts the machine from `Init`. The daemon never stores raw codes,
    /// so this only matters to callers that carry [`PowerState::code`]
    /// values outside the controller.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PowerState::Restart,
            2 => PowerState::Check,
            _ => PowerState::Init,
        }
    }
}

/// Inputs of one evaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerInputs {
    /// Commanded bus power as of the previous cycle.
    pub last_power: bool,
    /// Proposed bus power for this cycle.
    pub power: bool,
    /// The probe produced a valid reading this cycle.
    pub reception: bool,
    /// Debounced power-rail fault.
    pub fault: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerCycleController {
    state: PowerState,
    allowed_restarts: u32,
    restart_count: u32,
    broke: bool,
}

impl PowerCycleController {
    /// `allowed_restarts == 0` means unlimited.
    pub fn new(allowed_restarts: u32) -> Self {
        Self {
            state: PowerState::Init,
            allowed_restarts,
            restart_count: 0,
            broke: false,
        }
    }

    /// Evaluate one cycle and return the resulting bus power.
    pub fn run(&mut self, inputs: PowerInputs) -> bool {
        self.broke = inputs.last_power && !inputs.fault && !inputs.reception;

        self.state = match self.state {
            PowerState::Init if self.broke => PowerState::Restart,
            PowerState::Init => PowerState::Init,
            PowerState::Restart => PowerState::Check,
            PowerState::Check if !self.broke => PowerState::Init,
            PowerState::Check if self.has_restart_budget() => PowerState::Restart,
            PowerState::Check => PowerState::Check,
        };

        if self.state == PowerState::Restart {
            self.restart_count = self.restart_count.saturating_add(1);
            return false;
        }

        inputs.power
    }

    fn has_restart_budget(&self) -> bool {
        self.allowed_restarts == 0 || self.restart_count < self.allowed_restarts
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn allowed_restarts(&self) -> u32 {
        self.allowed_restarts
    }

    pub fn is_broke(&self) -> bool {
        self.broke
    }
}

impl Default for PowerCycleController {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_RESTARTS)
    }
}

/// Run every probe's controller in sequence against a shared enable line.
/// Each controller sees the power proposed by the one before it, so any
/// single broken probe can force the line off for the cycle.
pub fn evaluate_chain<'a, I>(controllers: I, last_power: bool, desired_power: bool, fault: bool) -> bool
where
    I: IntoIterator<Item = (&'a mut PowerCycleController, bool)>,
{
    let mut power = desired_power;
    for (controller, reception) in controllers {
        power = controller.run(PowerInputs {
            last_power,
            power,
            reception,
            fault,
        });
    }
    power
}
