//! Bus topics, inbound routing and the publish side of the bus.

use crate::telemetry::{unix_time_secs, Report, ReportKind};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CHECKUP_REQUEST_TOPIC: &str = "reporter/checkup_req";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub bootup: String,
    pub checkup: String,
    pub event: String,
    pub cmd: String,
    pub temp_power: String,
    pub checkup_req: String,
}

impl Topics {
    pub fn new(instance: &str) -> Self {
        Self {
            bootup: format!("{}/{}", instance, ReportKind::Bootup.topic_suffix()),
            checkup: format!("{}/{}", instance, ReportKind::Checkup.topic_suffix()),
            event: format!("{}/{}", instance, ReportKind::Event.topic_suffix()),
            cmd: format!("{}/cmd", instance),
            temp_power: format!("{}/temp_power", instance),
            checkup_req: CHECKUP_REQUEST_TOPIC.to_string(),
        }
    }

    pub fn for_report(&self, kind: ReportKind) -> &str {
        match kind {
            ReportKind::Bootup => &self.bootup,
            ReportKind::Checkup => &self.checkup,
            ReportKind::Event => &self.event,
        }
    }

    /// Topics subscribed on every (re)connection.
    pub fn subscriptions(&self) -> [&str; 3] {
        [&self.checkup_req, &self.temp_power, &self.cmd]
    }

    pub fn route(&self, message: &InboundMessage) -> Route {
        if message.topic == self.checkup_req {
            Route::CheckupRequest
        } else if message.topic == self.temp_power {
            Route::TempPower(parse_temp_power(&message.payload_text()))
        } else if message.topic == self.cmd {
            Route::Command(message.payload_text())
        } else {
            Route::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// What the receive loop hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Connected,
    Message(InboundMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    CheckupRequest,
    TempPower(bool),
    Command(String),
    Unknown,
}

/// `false` (any case) or `0` switches the probe bus off; anything else on.
pub fn parse_temp_power(payload: &str) -> bool {
    let payload = payload.trim();
    !(payload.eq_ignore_ascii_case("false") || payload == "0")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus client rejected request: {0}")]
    Rejected(String),
    #[error("bus client is closed")]
    Closed,
}

/// Request side of the bus. Calls queue work for the transport and never
/// block on the network.
pub trait BusClient: Send + Sync {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), BusError>;
    fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    fn disconnect(&self) -> Result<(), BusError>;
}

#[derive(Clone)]
pub struct Publisher {
    client: Arc<dyn BusClient>,
    topics: Topics,
}

impl Publisher {
    pub fn new(client: Arc<dyn BusClient>, topics: Topics) -> Self {
        Self { client, topics }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn publish(&self, report: &Report) -> Result<(), BusError> {
        let topic = self.topics.for_report(report.kind());
        let payload = report.to_payload(unix_time_secs());
        debug!("{}: {}", topic, payload);
        self.client.publish(topic, payload, report.kind().retained())?;
        info!("Published {}", topic);
        Ok(())
    }

    pub fn subscribe_all(&self) -> Result<(), BusError> {
        for topic in self.topics.subscriptions() {
            self.client.subscribe(topic)?;
            debug!("Subscribed to {}", topic);
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.client.disconnect() {
            warn!("Disconnect failed: {}", e);
        }
    }
}

/// One request seen by a [`RecordingBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRequest {
    Publish { topic: String, payload: String, retain: bool },
    Subscribe(String),
    Disconnect,
}

/// In-memory bus client that keeps every request. The binaries always use
/// the rumqttc client; this one is public so integration tests can watch
/// what [`crate::daemon::run`] publishes.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    requests: Arc<Mutex<Vec<BusRequest>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, request: BusRequest) {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request);
    }

    pub fn requests(&self) -> Vec<BusRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Payloads published to `topic`, parsed as JSON.
    pub fn published(&self, topic: &str) -> Vec<serde_json::Value> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                BusRequest::Publish { topic: t, payload, .. } if t == topic => serde_json::from_str(&payload).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

impl BusClient for RecordingBus {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), BusError> {
        self.record(BusRequest::Publish {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.record(BusRequest::Subscribe(topic.to_string()));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BusError> {
        self.record(BusRequest::Disconnect);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_by_topic() {
        let topics = Topics::new("secmon00");
        assert_eq!(
            topics.route(&InboundMessage::new("reporter/checkup_req", "")),
            Route::CheckupRequest
        );
        assert_eq!(
            topics.route(&InboundMessage::new("secmon00/temp_power", "FALSE")),
            Route::TempPower(false)
        );
        assert_eq!(
            topics.route(&InboundMessage::new("secmon00/cmd", "(x, y)")),
            Route::Command("(x, y)".into())
        );
        assert_eq!(topics.route(&InboundMessage::new("other/cmd", "")), Route::Unknown);
    }

    #[test]
    fn test_temp_power_payloads() {
        assert!(!parse_temp_power("false"));
        assert!(!parse_temp_power("False"));
        assert!(!parse_temp_power("0"));
        assert!(parse_temp_power("true"));
        assert!(parse_temp_power("1"));
        assert!(parse_temp_power(""));
    }

    #[test]
    fn test_bootup_published_retained() {
        let bus = RecordingBus::new();
        let publisher = Publisher::new(Arc::new(bus.clone()), Topics::new("n"));
        publisher.publish(&Report::new(ReportKind::Bootup)).unwrap();
        match &bus.requests()[0] {
            BusRequest::Publish { topic, retain, .. } => {
                assert_eq!(topic, "n/bootup");
                assert!(*retain);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
