//! Line-level hardware access.
//!
//! [`LineIo`] is the only seam between the daemon and physical lines. The
//! sysfs backend drives `/sys/class/gpio` style trees and one-wire
//! `w1_slave` files; [`SimulatedLines`] keeps everything in memory for
//! bench runs and tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Temperature reading reported when a probe cannot be read.
pub const TEMPERATURE_SENTINEL: &str = "XX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Inactive,
    Active,
}

impl Level {
    pub fn from_bool(active: bool) -> Self {
        if active {
            Level::Active
        } else {
            Level::Inactive
        }
    }

    pub fn is_active(self) -> bool {
        self == Level::Active
    }

    pub fn as_bit(self) -> u8 {
        u8::from(self.is_active())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineRef {
    Pin(u32),
    Path(PathBuf),
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineRef::Pin(pin) => write!(f, "pin {}", pin),
            LineRef::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output(Level),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    AsIs,
    PullUp,
    PullDown,
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("I/O error on {line}: {source}")]
    Io {
        line: LineRef,
        source: std::io::Error,
    },
    #[error("unexpected value {value:?} on {line}")]
    BadValue { line: LineRef, value: String },
    #[error("no temperature in probe output from {0}")]
    NoReading(LineRef),
    #[error("{0} is not configured")]
    NotConfigured(LineRef),
    #[error("{0} cannot be used for this operation")]
    WrongKind(LineRef),
}

pub trait LineIo: Send {
    fn configure(&mut self, line: &LineRef, direction: Direction, bias: Bias) -> Result<(), LineError>;
    fn read(&mut self, line: &LineRef) -> Result<Level, LineError>;
    fn write(&mut self, line: &LineRef, level: Level) -> Result<(), LineError>;
    /// Raw millidegree reading of a one-wire probe.
    fn read_temperature(&mut self, probe: &LineRef) -> Result<String, LineError>;
}

/// Pull the `t=<digits>` field out of `w1_slave` output.
pub fn parse_w1_temperature(output: &str) -> Option<String> {
    let start = output.find("t=")? + 2;
    let rest = &output[start..];
    let end = rest
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
        .map_or(rest.len(), |(i, _)| i);
    let digits = &rest[..end];
    if digits.is_empty() || digits == "-" {
        return None;
    }
    Some(digits.to_string())
}

/// sysfs GPIO (`<root>/gpioN/value`) plus one-wire probe files.
#[derive(Debug)]
pub struct SysfsLines {
    root: PathBuf,
}

impl SysfsLines {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn pin_of(&self, line: &LineRef) -> Result<u32, LineError> {
        match line {
            LineRef::Pin(pin) => Ok(*pin),
            LineRef::Path(_) => Err(LineError::WrongKind(line.clone())),
        }
    }

    fn write_attr(line: &LineRef, path: &Path, value: &str) -> Result<(), LineError> {
        fs::write(path, value).map_err(|source| LineError::Io {
            line: line.clone(),
            source,
        })
    }
}

impl LineIo for SysfsLines {
    fn configure(&mut self, line: &LineRef, direction: Direction, bias: Bias) -> Result<(), LineError> {
        let pin = match line {
            LineRef::Pin(pin) => *pin,
            // probe files need no setup
            LineRef::Path(_) => return Ok(()),
        };

        let dir = self.pin_dir(pin);
        if !dir.exists() {
            Self::write_attr(line, &self.root.join("export"), &pin.to_string())?;
        }

        let direction_value = match direction {
            Direction::Input => "in",
            Direction::Output(Level::Active) => "high",
            Direction::Output(Level::Inactive) => "low",
        };
        Self::write_attr(line, &dir.join("direction"), direction_value)?;

        if bias != Bias::AsIs {
            // sysfs has no bias control; the board's resistors have to match
            debug!("Bias {:?} for {} left to hardware", bias, line);
        }
        Ok(())
    }

    fn read(&mut self, line: &LineRef) -> Result<Level, LineError> {
        let pin = self.pin_of(line)?;
        let raw = fs::read_to_string(self.pin_dir(pin).join("value")).map_err(|source| LineError::Io {
            line: line.clone(),
            source,
        })?;
        match raw.trim() {
            "0" => Ok(Level::Inactive),
            "1" => Ok(Level::Active),
            other => Err(LineError::BadValue {
                line: line.clone(),
                value: other.to_string(),
            }),
        }
    }

    fn write(&mut self, line: &LineRef, level: Level) -> Result<(), LineError> {
        let pin = self.pin_of(line)?;
        let value = if level.is_active() { "1" } else { "0" };
        Self::write_attr(line, &self.pin_dir(pin).join("value"), value)
    }

    fn read_temperature(&mut self, probe: &LineRef) -> Result<String, LineError> {
        let LineRef::Path(path) = probe else {
            return Err(LineError::WrongKind(probe.clone()));
        };
        let output = fs::read_to_string(path).map_err(|source| LineError::Io {
            line: probe.clone(),
            source,
        })?;
        parse_w1_temperature(&output).ok_or_else(|| LineError::NoReading(probe.clone()))
    }
}

#[derive(Debug, Default)]
struct SimulatedInner {
    configured: HashMap<LineRef, Direction>,
    levels: HashMap<LineRef, Level>,
    temperatures: HashMap<LineRef, Option<String>>,
    failing: Vec<LineRef>,
    writes: Vec<(LineRef, Level)>,
}

/// In-memory lines. Clones share state, so a test can keep one handle to
/// drive inputs while the scheduler owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLines {
    inner: Arc<Mutex<SimulatedInner>>,
}

impl SimulatedLines {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedInner> {
        // a panicked test thread must not wedge the others
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_level(&self, line: &LineRef, level: Level) {
        self.lock().levels.insert(line.clone(), level);
    }

    pub fn set_pin(&self, pin: u32, active: bool) {
        self.set_level(&LineRef::Pin(pin), Level::from_bool(active));
    }

    /// `None` makes the probe unreadable.
    pub fn set_temperature(&self, probe: &LineRef, reading: Option<&str>) {
        self.lock()
            .temperatures
            .insert(probe.clone(), reading.map(str::to_string));
    }

    pub fn fail_line(&self, line: &LineRef) {
        self.lock().failing.push(line.clone());
    }

    pub fn level(&self, line: &LineRef) -> Option<Level> {
        self.lock().levels.get(line).copied()
    }

    pub fn pin(&self, pin: u32) -> Option<Level> {
        self.level(&LineRef::Pin(pin))
    }

    pub fn direction(&self, line: &LineRef) -> Option<Direction> {
        self.lock().configured.get(line).copied()
    }

    pub fn writes(&self) -> Vec<(LineRef, Level)> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

impl LineIo for SimulatedLines {
    fn configure(&mut self, line: &LineRef, direction: Direction, _bias: Bias) -> Result<(), LineError> {
        let mut inner = self.lock();
        inner.configured.insert(line.clone(), direction);
        if let Direction::Output(level) = direction {
            inner.levels.insert(line.clone(), level);
        }
        Ok(())
    }

    fn read(&mut self, line: &LineRef) -> Result<Level, LineError> {
        let inner = self.lock();
        if inner.failing.contains(line) {
            return Err(LineError::Io {
                line: line.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated failure"),
            });
        }
        if !inner.configured.contains_key(line) {
            return Err(LineError::NotConfigured(line.clone()));
        }
        Ok(inner.levels.get(line).copied().unwrap_or(Level::Inactive))
    }

    fn write(&mut self, line: &LineRef, level: Level) -> Result<(), LineError> {
        let mut inner = self.lock();
        if !matches!(inner.configured.get(line), Some(Direction::Output(_))) {
            return Err(LineError::NotConfigured(line.clone()));
        }
        inner.levels.insert(line.clone(), level);
        inner.writes.push((line.clone(), level));
        Ok(())
    }

    fn read_temperature(&mut self, probe: &LineRef) -> Result<String, LineError> {
        let inner = self.lock();
        match inner.temperatures.get(probe) {
            Some(Some(reading)) => Ok(reading.clone()),
            _ => Err(LineError::NoReading(probe.clone())),
        }
    }
}
