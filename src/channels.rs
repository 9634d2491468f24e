use crate::debounce::{
    DebounceFilter, DEFAULT_FAULT_THRESHOLD, DEFAULT_MOTION_THRESHOLD, DEFAULT_SWITCH_THRESHOLD,
};
use crate::line_io::{Bias, Direction, Level, LineError, LineIo, LineRef};
use crate::power_cycle::PowerCycleController;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Switch,
    SwitchInverted,
    Motion,
    TempSensor,
    TempFault,
    TempEnable,
    Output,
}

impl ChannelKind {
    /// Configuration spelling of the kind.
    pub fn code(self) -> &'static str {
        match self {
            ChannelKind::Switch => "SW",
            ChannelKind::SwitchInverted => "SW_INV",
            ChannelKind::Motion => "PIR",
            ChannelKind::TempSensor => "TEMP",
            ChannelKind::TempFault => "TEMP_FAULT",
            ChannelKind::TempEnable => "TEMP_EN",
            ChannelKind::Output => "OUT",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SW" => Some(ChannelKind::Switch),
            "SW_INV" => Some(ChannelKind::SwitchInverted),
            "PIR" => Some(ChannelKind::Motion),
            "TEMP" => Some(ChannelKind::TempSensor),
            "TEMP_FAULT" => Some(ChannelKind::TempFault),
            "TEMP_EN" => Some(ChannelKind::TempEnable),
            "OUT" => Some(ChannelKind::Output),
            _ => None,
        }
    }
}

/// A validated acquisition descriptor, one variant per channel kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Switch { name: String, pin: u32 },
    SwitchInverted { name: String, pin: u32 },
    Motion { name: String, pin: u32 },
    TempSensor { name: String, path: std::path::PathBuf },
    TempFault { name: String, pin: u32 },
    TempEnable { name: String, pin: u32 },
    Output { name: String, pin: u32, initial: Level },
}

impl Acquisition {
    pub fn name(&self) -> &str {
        match self {
            Acquisition::Switch { name, .. }
            | Acquisition::SwitchInverted { name, .. }
            | Acquisition::Motion { name, .. }
            | Acquisition::TempSensor { name, .. }
            | Acquisition::TempFault { name, .. }
            | Acquisition::TempEnable { name, .. }
            | Acquisition::Output { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Acquisition::Switch { .. } => ChannelKind::Switch,
            Acquisition::SwitchInverted { .. } => ChannelKind::SwitchInverted,
            Acquisition::Motion { .. } => ChannelKind::Motion,
            Acquisition::TempSensor { .. } => ChannelKind::TempSensor,
            Acquisition::TempFault { .. } => ChannelKind::TempFault,
            Acquisition::TempEnable { .. } => ChannelKind::TempEnable,
            Acquisition::Output { .. } => ChannelKind::Output,
        }
    }

    pub fn line(&self) -> LineRef {
        match self {
            Acquisition::TempSensor { path, .. } => LineRef::Path(path.clone()),
            Acquisition::Switch { pin, .. }
            | Acquisition::SwitchInverted { pin, .. }
            | Acquisition::Motion { pin, .. }
            | Acquisition::TempFault { pin, .. }
            | Acquisition::TempEnable { pin, .. }
            | Acquisition::Output { pin, .. } => LineRef::Pin(*pin),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceThresholds {
    pub switch: u32,
    pub motion: u32,
    pub fault: u32,
}

impl Default for DebounceThresholds {
    fn default() -> Self {
        Self {
            switch: DEFAULT_SWITCH_THRESHOLD,
            motion: DEFAULT_MOTION_THRESHOLD,
            fault: DEFAULT_FAULT_THRESHOLD,
        }
    }
}

/// Normalize a commanded value: `0`, `false` and `"off"` (any case) are
/// inactive, everything else is active.
pub fn command_level(value: &Value) -> Level {
    let inactive = match value {
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.eq_ignore_ascii_case("off"),
        _ => false,
    };
    Level::from_bool(!inactive)
}

/// Sample value for a polled input after polarity normalization.
pub fn input_bit(kind: ChannelKind, level: Level) -> u8 {
    match kind {
        // inverted switches and the active-low fault rail read 0 when ACTIVE
        ChannelKind::SwitchInverted | ChannelKind::TempFault => u8::from(!level.is_active()),
        _ => level.as_bit(),
    }
}

#[derive(Debug, Clone)]
pub enum ChannelState {
    Switch { inverted: bool, filter: DebounceFilter<u8> },
    Motion { filter: DebounceFilter<u8>, last_reported: u8 },
    TempSensor { controller: PowerCycleController, reading: Option<String> },
    Output { commanded: Level },
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub line: LineRef,
    pub state: ChannelState,
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        match &self.state {
            ChannelState::Switch { inverted: false, .. } => ChannelKind::Switch,
            ChannelState::Switch { inverted: true, .. } => ChannelKind::SwitchInverted,
            ChannelState::Motion { .. } => ChannelKind::Motion,
            ChannelState::TempSensor { .. } => ChannelKind::TempSensor,
            ChannelState::Output { .. } => ChannelKind::Output,
        }
    }

    /// Confirmed value of a debounced input.
    pub fn confirmed(&self) -> Option<u8> {
        match &self.state {
            ChannelState::Switch { filter, .. } | ChannelState::Motion { filter, .. } => {
                Some(*filter.confirmed())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaultChannel {
    pub name: String,
    pub line: LineRef,
    pub filter: DebounceFilter<u8>,
}

#[derive(Debug, Clone)]
pub struct EnableChannel {
    pub name: String,
    pub line: LineRef,
}

/// All channels of the instance, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
    temp_fault: Option<FaultChannel>,
    temp_enable: Option<EnableChannel>,
}

impl ChannelRegistry {
    /// Configure every line and seed the debounce filters from a first
    /// sample. The acquisitions must already be validated.
    pub fn build(
        acquisitions: &[Acquisition],
        thresholds: DebounceThresholds,
        allowed_restarts: u32,
        io: &mut dyn LineIo,
    ) -> Result<Self, LineError> {
        let mut registry = Self::default();

        for acquisition in acquisitions {
            let name = acquisition.name().to_string();
            let line = acquisition.line();
            debug!("Configuring {} '{}' on {}", acquisition.kind().code(), name, line);

            match acquisition {
                Acquisition::Switch { .. } | Acquisition::SwitchInverted { .. } => {
                    io.configure(&line, Direction::Input, Bias::PullUp)?;
                    let inverted = acquisition.kind() == ChannelKind::SwitchInverted;
                    let initial = input_bit(acquisition.kind(), io.read(&line)?);
                    registry.channels.push(Channel {
                        name,
                        line,
                        state: ChannelState::Switch {
                            inverted,
                            filter: DebounceFilter::new(initial, thresholds.switch),
                        },
                    });
                }
                Acquisition::Motion { .. } => {
                    io.configure(&line, Direction::Input, Bias::PullUp)?;
                    let initial = input_bit(ChannelKind::Motion, io.read(&line)?);
                    registry.channels.push(Channel {
                        name,
                        line,
                        state: ChannelState::Motion {
                            filter: DebounceFilter::new(initial, thresholds.motion),
                            last_reported: 0,
                        },
                    });
                }
                Acquisition::TempSensor { .. } => {
                    io.configure(&line, Direction::Input, Bias::AsIs)?;
                    registry.channels.push(Channel {
                        name,
                        line,
                        state: ChannelState::TempSensor {
                            controller: PowerCycleController::new(allowed_restarts),
                            reading: None,
                        },
                    });
                }
                Acquisition::TempFault { .. } => {
                    io.configure(&line, Direction::Input, Bias::PullUp)?;
                    let initial = input_bit(ChannelKind::TempFault, io.read(&line)?);
                    registry.temp_fault = Some(FaultChannel {
                        name,
                        line,
                        filter: DebounceFilter::new(initial, thresholds.fault),
                    });
                }
                Acquisition::TempEnable { .. } => {
                    // the bus starts powered
                    io.configure(&line, Direction::Output(Level::Active), Bias::AsIs)?;
                    registry.temp_enable = Some(EnableChannel { name, line });
                }
                Acquisition::Output { initial, .. } => {
                    io.configure(&line, Direction::Output(*initial), Bias::AsIs)?;
                    registry.channels.push(Channel {
                        name,
                        line,
                        state: ChannelState::Output { commanded: *initial },
                    });
                }
            }
        }

        Ok(registry)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn temp_fault(&self) -> Option<&FaultChannel> {
        self.temp_fault.as_ref()
    }

    pub fn temp_fault_mut(&mut self) -> Option<&mut FaultChannel> {
        self.temp_fault.as_mut()
    }

    pub fn temp_enable(&self) -> Option<&EnableChannel> {
        self.temp_enable.as_ref()
    }

    pub fn has_temp_sensors(&self) -> bool {
        self.channels.iter().any(|c| c.kind() == ChannelKind::TempSensor)
    }

    pub fn output_level(&self, name: &str) -> Option<Level> {
        match self.get(name).map(|c| &c.state) {
            Some(ChannelState::Output { commanded }) => Some(*commanded),
            _ => None,
        }
    }

    /// Store commanded values for every entry naming an output channel.
    /// Returns what was applied; unknown names are ignored.
    pub fn apply_command(&mut self, command: &serde_json::Map<String, Value>) -> Vec<(String, Level)> {
        let mut applied = Vec::new();
        for (name, value) in command {
            let Some(channel) = self.channels.iter_mut().find(|c| &c.name == name) else {
                continue;
            };
            match &mut channel.state {
                ChannelState::Output { commanded } => {
                    *commanded = command_level(value);
                    applied.push((name.clone(), *commanded));
                }
                _ => warn!("Command for non-output channel '{}' ignored", name),
            }
        }
        applied
    }
}

/// Bus power bookkeeping shared by all probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempPower {
    /// Externally commanded power (the `temp_power` topic).
    pub commanded: bool,
    /// Power decided by the last evaluation of the restart chain.
    pub on: bool,
    /// Power written to the enable line on the previous tick.
    pub last: bool,
    /// Debounced rail fault.
    pub fault: bool,
}

impl Default for TempPower {
    fn default() -> Self {
        Self {
            commanded: true,
            on: true,
            last: true,
            fault: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Poll ticks, wrapping at `u16::MAX`.
    pub ticks: u16,
    /// Poll ticks since the last periodic checkup request.
    pub checkup_ticks: u32,
    /// Checkups since the last long check.
    pub pings: u32,
    /// Next boot check to run in the long-check rotation.
    pub long_check_cursor: usize,
}

/// Everything the daemon mutates at run time.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub registry: ChannelRegistry,
    pub temp_power: TempPower,
    pub counters: Counters,
}

impl RuntimeState {
    pub fn new(registry: ChannelRegistry) -> Self {
        let temp_power = TempPower {
            fault: registry.temp_fault().is_some_and(|f| *f.filter.confirmed() != 0),
            ..TempPower::default()
        };
        Self {
            registry,
            temp_power,
            counters: Counters::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_level_normalization() {
        assert_eq!(command_level(&json!(0)), Level::Inactive);
        assert_eq!(command_level(&json!(0.0)), Level::Inactive);
        assert_eq!(command_level(&json!(false)), Level::Inactive);
        assert_eq!(command_level(&json!("OFF")), Level::Inactive);
        assert_eq!(command_level(&json!("off")), Level::Inactive);
        assert_eq!(command_level(&json!(1)), Level::Active);
        assert_eq!(command_level(&json!("on")), Level::Active);
        assert_eq!(command_level(&json!("0")), Level::Active);
        assert_eq!(command_level(&json!(null)), Level::Active);
    }

    #[test]
    fn test_input_polarity() {
        assert_eq!(input_bit(ChannelKind::Switch, Level::Active), 1);
        assert_eq!(input_bit(ChannelKind::SwitchInverted, Level::Active), 0);
        assert_eq!(input_bit(ChannelKind::TempFault, Level::Inactive), 1);
        assert_eq!(input_bit(ChannelKind::Motion, Level::Active), 1);
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for kind in [
            ChannelKind::Switch,
            ChannelKind::SwitchInverted,
            ChannelKind::Motion,
            ChannelKind::TempSensor,
            ChannelKind::TempFault,
            ChannelKind::TempEnable,
            ChannelKind::Output,
        ] {
            assert_eq!(ChannelKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ChannelKind::from_code("LED"), None);
    }
}
