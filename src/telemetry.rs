use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TEMP_POWER_FAULT_KEY: &str = "Temp Power Fault";
pub const TEMP_POWER_KEY: &str = "Temp Power";
pub const TIME_KEY: &str = "time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    /// First snapshot after each connection, retained by the broker.
    Bootup,
    /// Full periodic snapshot.
    Checkup,
    /// Confirmed changes from one poll tick.
    Event,
}

impl ReportKind {
    pub fn topic_suffix(self) -> &'static str {
        match self {
            ReportKind::Bootup => "bootup",
            ReportKind::Checkup => "checkup",
            ReportKind::Event => "event",
        }
    }

    pub fn retained(self) -> bool {
        self == ReportKind::Bootup
    }
}

/// One outgoing JSON object. Keys keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    kind: ReportKind,
    entries: Map<String, Value>,
}

impl Report {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            kind,
            entries: Map::new(),
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn extend<K: Into<String>, V: Into<Value>>(&mut self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize with the `time` field (epoch seconds as text) appended.
    pub fn to_payload(&self, now: f64) -> String {
        let mut entries = self.entries.clone();
        entries.insert(TIME_KEY.to_string(), Value::String(now.to_string()));
        Value::Object(entries).to_string()
    }
}

/// Seconds since the Unix epoch with sub-second precision.
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_time_as_text() {
        let mut report = Report::new(ReportKind::Event);
        report.insert("Door", 1);
        let payload: Value = serde_json::from_str(&report.to_payload(1700000000.5)).unwrap();
        assert_eq!(payload["Door"], 1);
        assert_eq!(payload["time"], "1700000000.5");
    }

    #[test]
    fn test_only_bootup_is_retained() {
        assert!(ReportKind::Bootup.retained());
        assert!(!ReportKind::Checkup.retained());
        assert!(!ReportKind::Event.retained());
    }

    #[test]
    fn test_keys_keep_insertion_order() {
        let mut report = Report::new(ReportKind::Checkup);
        report.extend([("b", 1), ("a", 2)]);
        let keys: Vec<_> = report.entries().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
