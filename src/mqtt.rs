//! rumqttc adapters for [`BusTransport`] and [`BusClient`].

use crate::protocol::{BusClient, BusError, InboundMessage};
use crate::supervisor::{BusEvent, BusTransport, TransportError};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, StateError};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, trace};

/// Bootup snapshots carry diagnostic dumps, well past rumqttc's default cap.
const MAX_PACKET_SIZE: usize = 256 * 1024;
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn new(instance: &str, host: &str, port: u16, keep_alive: Duration) -> Self {
        Self {
            client_id: format!("hdc-{}", instance),
            host: host.to_string(),
            port,
            keep_alive,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        // keep-alive below 5s is rejected by rumqttc
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(5)));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options
    }
}

/// Create the client/transport pair. Nothing touches the network until the
/// transport is first polled.
pub fn connect(settings: &MqttSettings) -> (AsyncClient, MqttTransport) {
    debug!("MQTT client '{}' for {}:{}", settings.client_id, settings.host, settings.port);
    let (client, eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
    (client, MqttTransport { eventloop })
}

pub struct MqttTransport {
    eventloop: EventLoop,
}

/// Sort rumqttc connection errors into the supervisor's classes.
pub fn classify(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => TransportError::Timeout(error.to_string()),
        ConnectionError::Io(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            TransportError::Timeout(error.to_string())
        }
        ConnectionError::MqttState(StateError::AwaitPingResp) => TransportError::Timeout(error.to_string()),
        ConnectionError::Io(_) | ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => {
            TransportError::ConnectionLost(error.to_string())
        }
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{:?}", code)),
        ConnectionError::RequestsDone => TransportError::Closed,
        other => TransportError::Other(other.to_string()),
    }
}

impl BusTransport for MqttTransport {
    async fn poll(&mut self) -> Result<BusEvent, TransportError> {
        let event = self.eventloop.poll().await.map_err(classify)?;
        trace!("MQTT {:?}", event);
        Ok(match event {
            Event::Incoming(Packet::ConnAck(_)) => BusEvent::Connected,
            Event::Incoming(Packet::Publish(publish)) => {
                BusEvent::Message(InboundMessage::new(publish.topic, publish.payload.to_vec()))
            }
            Event::Incoming(Packet::Disconnect) => BusEvent::Disconnected { reason: 1 },
            Event::Outgoing(Outgoing::Disconnect) => BusEvent::Disconnected { reason: 0 },
            _ => BusEvent::Idle,
        })
    }
}

impl BusClient for AsyncClient {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), BusError> {
        self.try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| BusError::Rejected(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| BusError::Rejected(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), BusError> {
        self.try_disconnect().map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::ConnectReturnCode;

    #[test]
    fn test_error_classes() {
        assert!(matches!(classify(ConnectionError::NetworkTimeout), TransportError::Timeout(_)));
        assert!(matches!(
            classify(ConnectionError::MqttState(StateError::AwaitPingResp)),
            TransportError::Timeout(_)
        ));
        assert!(matches!(
            classify(ConnectionError::Io(std::io::Error::from(ErrorKind::ConnectionReset))),
            TransportError::ConnectionLost(_)
        ));
        assert!(matches!(
            classify(ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)),
            TransportError::Refused(_)
        ));
        assert_eq!(classify(ConnectionError::RequestsDone), TransportError::Closed);
    }

    #[test]
    fn test_keep_alive_floor() {
        let settings = MqttSettings::new("n", "localhost", 1883, Duration::from_secs(1));
        assert_eq!(settings.options().keep_alive(), Duration::from_secs(5));
    }
}
