use hdc::auth::*;
use serde_json::{json, Map, Value};
use std::time::Duration;

const PREFIX: &str = "magls_";
const NOW: f64 = 1_700_000_000.0;

fn body(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("test body must be an object"),
    }
}

fn authenticator(secrets: &[&[u8]], max_age: u64) -> CommandAuthenticator {
    let tokens: Vec<String> = secrets.iter().map(|s| encode_token(PREFIX, s)).collect();
    CommandAuthenticator::from_tokens(PREFIX, &tokens, Duration::from_secs(max_age))
}

#[test]
fn test_token_round_trip() {
    let secrets: [&[u8]; 4] = [b"ab", b"correct horse battery staple", &[0, 255, 1, 254, 2], &[7; 64]];
    for secret in secrets {
        let token = encode_token(PREFIX, secret);
        assert!(token.starts_with(PREFIX));
        let decoded = decode_token(PREFIX, &token).unwrap();
        assert_eq!(decoded.as_bytes(), secret);
    }
}

#[test]
fn test_corrupted_checksum_rejected() {
    let token = encode_token(PREFIX, b"top secret");
    let split = token.len() - CHECKSUM_CHARS;

    for idx in split..token.len() {
        let mut chars: Vec<char> = token.chars().collect();
        chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
        let corrupted: String = chars.into_iter().collect();
        assert!(decode_token(PREFIX, &corrupted).is_err(), "corruption at {} accepted", idx);
    }
}

#[test]
fn test_token_trailing_whitespace_and_prefix_case() {
    let token = encode_token(PREFIX, b"secret");
    let shouted = format!("{}{}\n", PREFIX.to_uppercase(), &token[PREFIX.len()..]);
    assert_eq!(decode_token(PREFIX, &shouted).unwrap().as_bytes(), b"secret");
}

#[test]
fn test_bad_tokens() {
    assert!(matches!(decode_token(PREFIX, "magls_"), Err(TokenError::TooShort { .. })));
    assert!(matches!(
        decode_token(PREFIX, "other_c2VjcmV0AAAAAA"),
        Err(TokenError::BadPrefix(_))
    ));
    assert!(matches!(
        decode_token(PREFIX, "magls_!!!!AAAAAA"),
        Err(TokenError::BadEncoding(_))
    ));
}

#[test]
fn test_secret_debug_is_redacted() {
    let secret = TrustedSecret::new(b"hunter2".to_vec());
    assert_eq!(format!("{:?}", secret), "TrustedSecret(7 bytes)");
}

#[test]
fn test_signed_command_authenticates() {
    let auth = authenticator(&[b"other", b"shared secret"], 10);
    assert_eq!(auth.secret_count(), 2);
    let envelope = CommandEnvelope::sign(body(json!({"LED": 1, "Relay": "off"})), b"shared secret", NOW);

    let verified = auth.authenticate(&envelope.to_string(), NOW + 3.0).unwrap();
    assert_eq!(verified["LED"], 1);
    assert_eq!(verified["Relay"], "off");
    assert_eq!(verified["time"].as_f64(), Some(NOW));
}

#[test]
fn test_freshness_window() {
    let auth = authenticator(&[b"shared secret"], 10);
    let envelope = CommandEnvelope::sign(body(json!({"LED": 1})), b"shared secret", NOW);
    let raw = envelope.to_string();

    assert!(auth.authenticate(&raw, NOW + 10.0).is_ok());
    assert!(matches!(auth.authenticate(&raw, NOW + 11.0), Err(AuthError::Stale { .. })));
    // Clocks running ahead of ours are bounded the same way
    assert!(matches!(auth.authenticate(&raw, NOW - 11.0), Err(AuthError::Stale { .. })));
}

#[test]
fn test_unknown_secret_rejected() {
    let auth = authenticator(&[b"one", b"two"], 10);
    let envelope = CommandEnvelope::sign(body(json!({"LED": 1})), b"three", NOW);
    assert!(matches!(auth.authenticate(&envelope.to_string(), NOW), Err(AuthError::BadTag)));
}

#[test]
fn test_tampered_body_rejected() {
    let auth = authenticator(&[b"shared secret"], 10);
    let envelope = CommandEnvelope::sign(body(json!({"LED": 0})), b"shared secret", NOW);
    let tampered = envelope.to_string().replace("\"LED\":0", "\"LED\":1");
    assert!(matches!(auth.authenticate(&tampered, NOW), Err(AuthError::BadTag)));
}

#[test]
fn test_pair_formats() {
    let secret = b"shared secret";
    let envelope = CommandEnvelope::sign(body(json!({"LED": 1})), secret, NOW);
    let auth = authenticator(&[secret], 10);

    let quoted = format!("('{}', '{}')", envelope.body, envelope.tag);
    let bare = format!("({}, {})", envelope.body, envelope.tag);
    assert!(auth.authenticate(&quoted, NOW).is_ok());
    assert!(auth.authenticate(&bare, NOW).is_ok());

    assert!(matches!(auth.authenticate("not a pair", NOW), Err(AuthError::Malformed)));
}

#[test]
fn test_body_without_time_rejected() {
    let secret = b"shared secret";
    let auth = authenticator(&[secret], 10);
    let body = r#"{"LED": 1}"#;
    let raw = format!("('{}', '{}')", body, message_tag(body, secret));
    assert!(matches!(auth.authenticate(&raw, NOW), Err(AuthError::MissingTime)));
}

#[test]
fn test_no_secrets_means_no_commands() {
    let auth = CommandAuthenticator::from_tokens(PREFIX, &["garbage"], Duration::from_secs(10));
    assert!(auth.is_empty());
    let envelope = CommandEnvelope::sign(body(json!({"LED": 1})), b"anything", NOW);
    assert!(matches!(auth.authenticate(&envelope.to_string(), NOW), Err(AuthError::NoSecrets)));
}

#[test]
fn test_truncated_or_garbled_tag_rejected() {
    let secret = b"shared secret";
    let auth = authenticator(&[secret], 10);
    let envelope = CommandEnvelope::sign(body(json!({"LED": 1})), secret, NOW);

    let truncated = format!("('{}', '{}')", envelope.body, &envelope.tag[..envelope.tag.len() - 1]);
    let garbled = format!("('{}', '{}')", envelope.body, "#".repeat(envelope.tag.len()));
    let padded = format!("('{}', '{}=')", envelope.body, envelope.tag);

    assert!(matches!(auth.authenticate(&truncated, NOW), Err(AuthError::BadTag)));
    assert!(matches!(auth.authenticate(&garbled, NOW), Err(AuthError::BadTag)));
    assert!(auth.authenticate(&padded, NOW).is_ok());
}
