use hdc::auth::{encode_token, CommandAuthenticator, CommandEnvelope};
use hdc::config::Config;
use hdc::daemon::{self, bootstrap, Dispatcher};
use hdc::line_io::{Level, SimulatedLines};
use hdc::protocol::{BusClient, BusRequest, Inbound, InboundMessage, Publisher, RecordingBus, Topics};
use hdc::scheduler::SharedState;
use hdc::supervisor::{BusEvent, ScriptStep, ScriptedTransport, SupervisorExit, TransportError};
use hdc::telemetry::unix_time_secs;
use hdc::watchdog::{CheckupKind, CheckupRequests, CheckupSignal};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SECRET: &[u8] = b"front door secret";
const SIREN: u32 = 13;

fn config() -> Config {
    let text = json!({
        "name": "secmon00",
        "mqtt_broker": "localhost",
        "mqtt_timeout": 5,
        "connect_attempts": 2,
        "reconnect_backoff_secs": 1,
        "tokens": [encode_token("magls_", SECRET)],
        "acq_io": [
            {"name": "Door", "type": "SW", "object": 17},
            {"name": "Siren", "type": "OUT", "object": [13, 0]}
        ]
    });
    Config::from_json(&text.to_string()).unwrap()
}

struct Harness {
    dispatcher: Dispatcher,
    state: SharedState,
    bus: RecordingBus,
    requests: CheckupRequests,
}

fn harness() -> Harness {
    let config = config();
    let mut lines = SimulatedLines::new();
    let state: SharedState = Arc::new(Mutex::new(bootstrap(&config, &mut lines).unwrap()));
    let bus = RecordingBus::new();
    let client: Arc<dyn BusClient> = Arc::new(bus.clone());
    let publisher = Publisher::new(client, Topics::new(&config.name));
    let tokens = config.tokens.clone().unwrap_or_default();
    let authenticator = CommandAuthenticator::from_tokens(&config.token_prefix, &tokens, config.cmd_max_age());
    let (signal, requests) = CheckupSignal::channel();

    Harness {
        dispatcher: Dispatcher::new(Arc::clone(&state), publisher, authenticator, signal),
        state,
        bus,
        requests,
    }
}

fn message(topic: &str, payload: impl Into<Vec<u8>>) -> Inbound {
    Inbound::Message(InboundMessage::new(topic, payload))
}

fn signed(body: Value, secret: &[u8]) -> String {
    let Value::Object(body) = body else {
        panic!("command body must be an object");
    };
    CommandEnvelope::sign(body, secret, unix_time_secs()).to_string()
}

#[tokio::test]
async fn test_connect_subscribes_and_requests_bootup() {
    let mut h = harness();
    h.dispatcher.handle(Inbound::Connected).await;

    let subscribed: Vec<String> = h
        .bus
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            BusRequest::Subscribe(topic) => Some(topic),
            _ => None,
        })
        .collect();
    assert_eq!(subscribed, vec!["reporter/checkup_req", "secmon00/temp_power", "secmon00/cmd"]);
    assert_eq!(h.requests.try_recv().ok(), Some(CheckupKind::Bootup));
}

#[tokio::test]
async fn test_checkup_request_routed_to_watchdog() {
    let mut h = harness();
    h.dispatcher.handle(message("reporter/checkup_req", "")).await;
    assert_eq!(h.requests.try_recv().ok(), Some(CheckupKind::Requested));
}

#[tokio::test]
async fn test_temp_power_override() {
    let h = harness();
    h.dispatcher.handle(message("secmon00/temp_power", "False")).await;
    assert!(!h.state.lock().await.temp_power.commanded);
    h.dispatcher.handle(message("secmon00/temp_power", "true")).await;
    assert!(h.state.lock().await.temp_power.commanded);
}

#[tokio::test]
async fn test_authentic_command_sets_output() {
    let h = harness();
    h.dispatcher
        .handle(message("secmon00/cmd", signed(json!({"Siren": 1, "Door": 1, "Nope": 1}), SECRET)))
        .await;

    let state = h.state.lock().await;
    assert_eq!(state.registry.output_level("Siren"), Some(Level::Active));
}

#[tokio::test]
async fn test_forged_command_ignored() {
    let h = harness();
    h.dispatcher
        .handle(message("secmon00/cmd", signed(json!({"Siren": 1}), b"guessed")))
        .await;
    h.dispatcher.handle(message("secmon00/cmd", "garbage")).await;

    let state = h.state.lock().await;
    assert_eq!(state.registry.output_level("Siren"), Some(Level::Inactive));
}

#[tokio::test]
async fn test_other_topics_ignored() {
    let mut h = harness();
    h.dispatcher.handle(message("elsewhere/cmd", "x")).await;
    assert!(h.requests.try_recv().is_err());
    assert!(h.bus.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_daemon_runs_until_shutdown() {
    let config = config();
    let lines = SimulatedLines::new();
    let bus = RecordingBus::new();
    let client: Arc<dyn BusClient> = Arc::new(bus.clone());
    let command = signed(json!({"Siren": "on"}), SECRET);
    let transport = ScriptedTransport::new(vec![
        ScriptStep::Yield(Ok(BusEvent::Connected)),
        ScriptStep::Stall(Duration::from_secs(2)),
        ScriptStep::Yield(Ok(BusEvent::Message(InboundMessage::new("secmon00/cmd", command)))),
    ]);

    let exit = daemon::run(
        &config,
        lines.clone(),
        client,
        transport,
        tokio::time::sleep(Duration::from_secs(10)),
    )
    .await
    .unwrap();

    assert_eq!(exit, SupervisorExit::Shutdown);
    assert_eq!(bus.published("secmon00/bootup").len(), 1);
    assert_eq!(lines.pin(SIREN), Some(Level::Active));
    assert_eq!(bus.requests().last(), Some(&BusRequest::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn test_daemon_exits_when_broker_unreachable() {
    let config = config();
    let bus = RecordingBus::new();
    let client: Arc<dyn BusClient> = Arc::new(bus.clone());
    let transport = ScriptedTransport::new(vec![
        ScriptStep::Yield(Err(TransportError::ConnectionLost("refused".into()))),
        ScriptStep::Yield(Err(TransportError::ConnectionLost("refused".into()))),
    ]);

    let exit = daemon::run(
        &config,
        SimulatedLines::new(),
        client,
        transport,
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(exit, SupervisorExit::StartupExhausted);
    assert!(bus.published("secmon00/bootup").is_empty());
}
