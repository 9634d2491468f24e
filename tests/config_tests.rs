use hdc::channels::Acquisition;
use hdc::config::*;
use hdc::line_io::Level;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

const FULL: &str = r#"{
    "name": "secmon00",
    "description": "Front door monitor",
    "boot_check_list": {
        "uptime": "uptime",
        "disk": ["df", "-h", "/"]
    },
    "acq_io": [
        {"name": "Door", "type": "SW", "object": 17},
        {"name": "Window", "type": "SW_INV", "object": 27},
        {"name": "Hall PIR", "type": "PIR", "object": 22},
        {"name": "Outside", "type": "TEMP", "object": "/sys/bus/w1/devices/28-0000/w1_slave"},
        {"name": "Temp fault", "type": "TEMP_FAULT", "object": 5},
        {"name": "Temp enable", "type": "TEMP_EN", "object": 6},
        {"name": "Siren", "type": "OUT", "object": [13, 0]}
    ],
    "long_checkup_freq": 12,
    "long_checkup_leng": 1,
    "mqtt_broker": "broker.local",
    "mqtt_port": 8883,
    "tokens": ["magls_c2VjcmV0AAAAAA"],
    "loglevel": "INFO",
    "poll_interval_ms": 500,
    "checkup_interval_secs": 60
}"#;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn with_channels(channels: &str) -> String {
    format!(r#"{{"name": "n", "mqtt_broker": "b", "acq_io": [{}]}}"#, channels)
}

#[test]
fn test_load_full_config() {
    let file = write_config(FULL);
    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.name, "secmon00");
    assert_eq!(config.mqtt_port, 8883);
    assert_eq!(config.loglevel.as_deref(), Some("INFO"));
    assert_eq!(config.poll_interval(), Duration::from_millis(500));
    assert_eq!(config.ticks_per_checkup(), 120);

    let acquisitions = config.resolve_acquisitions().unwrap();
    assert_eq!(acquisitions.len(), 7);
    assert_eq!(acquisitions[0], Acquisition::Switch { name: "Door".into(), pin: 17 });
    assert_eq!(
        acquisitions[3],
        Acquisition::TempSensor {
            name: "Outside".into(),
            path: PathBuf::from("/sys/bus/w1/devices/28-0000/w1_slave"),
        }
    );
    assert_eq!(
        acquisitions[6],
        Acquisition::Output { name: "Siren".into(), pin: 13, initial: Level::Inactive }
    );

    let checks = config.boot_checks().unwrap();
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[1].command, "df -h /");
}

#[test]
fn test_missing_file() {
    let result = Config::load(std::path::Path::new("/nonexistent/hdc_config.json"));
    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
fn test_malformed_json() {
    let file = write_config("{ not json");
    assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
}

#[test]
fn test_unknown_acquisition_type() {
    let text = with_channels(r#"{"name": "Gate", "type": "SERVO", "object": 4}"#);
    match Config::from_json(&text) {
        Err(ConfigError::UnknownType { name, kind }) => {
            assert_eq!(name, "Gate");
            assert_eq!(kind, "SERVO");
        }
        other => panic!("expected UnknownType, got {:?}", other),
    }
}

#[test]
fn test_duplicate_temp_fault() {
    let text = with_channels(
        r#"{"name": "F1", "type": "TEMP_FAULT", "object": 5},
           {"name": "F2", "type": "TEMP_FAULT", "object": 6}"#,
    );
    assert!(matches!(Config::from_json(&text), Err(ConfigError::DuplicateTempFault(_))));
}

#[test]
fn test_duplicate_temp_enable() {
    let text = with_channels(
        r#"{"name": "E1", "type": "TEMP_EN", "object": 5},
           {"name": "E2", "type": "TEMP_EN", "object": 6}"#,
    );
    assert!(matches!(Config::from_json(&text), Err(ConfigError::DuplicateTempEnable(_))));
}

#[test]
fn test_duplicate_channel_name() {
    let text = with_channels(
        r#"{"name": "Door", "type": "SW", "object": 5},
           {"name": "Door", "type": "PIR", "object": 6}"#,
    );
    assert!(matches!(Config::from_json(&text), Err(ConfigError::DuplicateName(_))));
}

#[test]
fn test_bad_pin_object() {
    let text = with_channels(r#"{"name": "Door", "type": "SW", "object": "seventeen"}"#);
    assert!(matches!(Config::from_json(&text), Err(ConfigError::BadObject { .. })));
}

#[test]
fn test_long_checkup_cap() {
    let text = format!(
        r#"{{"name": "n", "mqtt_broker": "b", "acq_io": [], "long_checkup_leng": {}}}"#,
        MAX_LONG_CHECKS_PER_CALL + 1
    );
    assert!(matches!(
        Config::from_json(&text),
        Err(ConfigError::Invalid { field: "long_checkup_leng", .. })
    ));
}
