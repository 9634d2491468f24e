//! Command authentication.
//!
//! Trusted secrets travel as tokens:
//!
//! ```text
//! <prefix><base64(secret)><base64(crc32_le(secret))>
//! ```
//!
//! with both base64 segments unpadded, so the checksum is always six
//! characters. Commands arrive as a textual `(json_body, tag)` pair where
//! `tag = base64(HMAC-SHA256(secret, json_body))`; the body must carry a
//! numeric `time` close enough to ours.

use crate::channels::ChannelRegistry;
use crate::line_io::Level;
use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64_NO_PAD, Engine as _};
use heapless::Vec as BoundedVec;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Minimum length of the encoded secret inside a token.
pub const MIN_SECRET_CHARS: usize = 2;
/// Length of the encoded checksum at the end of a token.
pub const CHECKSUM_CHARS: usize = 6;
pub const MAX_TRUSTED_SECRETS: usize = 16;

lazy_static! {
    // `('{...}', 'tag')` from Python tuples or `({...}, tag)` from Kotlin pairs
    static ref PAIR_RE: Regex =
        Regex::new(r#"^\(["']?(\{.+\})["']?, ["']?(.*?)["']?\)$"#).expect("pair pattern is valid");
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is {len} characters, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("token does not start with '{0}'")]
    BadPrefix(String),
    #[error("token body is not valid base64: {0}")]
    BadEncoding(#[from] base64::DecodeError),
    #[error("token checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("message is not a (body, tag) pair")]
    Malformed,
    #[error("message body is not JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("message body is not a JSON object")]
    NotAnObject,
    #[error("message body has no numeric 'time'")]
    MissingTime,
    #[error("message time is {age:.1}s away from now, limit {max_age:.0}s")]
    Stale { age: f64, max_age: f64 },
    #[error("message tag matches no trusted secret")]
    BadTag,
    #[error("no trusted secrets loaded")]
    NoSecrets,
}

/// Decoded secret bytes. `Debug` only shows the length.
#[derive(Clone, PartialEq, Eq)]
pub struct TrustedSecret(Vec<u8>);

impl TrustedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TrustedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustedSecret({} bytes)", self.0.len())
    }
}

fn checksum(secret: &[u8]) -> String {
    BASE64_NO_PAD.encode(crc32fast::hash(secret).to_le_bytes())
}

pub fn encode_token(prefix: &str, secret: &[u8]) -> String {
    format!("{}{}{}", prefix, BASE64_NO_PAD.encode(secret), checksum(secret))
}

pub fn decode_token(prefix: &str, token: &str) -> Result<TrustedSecret, TokenError> {
    let token = token.trim_end();
    let min = prefix.len() + MIN_SECRET_CHARS + CHECKSUM_CHARS;
    if token.len() < min {
        return Err(TokenError::TooShort { len: token.len(), min });
    }

    let head = token.get(..prefix.len()).unwrap_or_default();
    if !head.eq_ignore_ascii_case(prefix) {
        return Err(TokenError::BadPrefix(prefix.to_string()));
    }

    let split = token.len() - CHECKSUM_CHARS;
    let (Some(body), Some(expected)) = (token.get(prefix.len()..split), token.get(split..)) else {
        return Err(TokenError::ChecksumMismatch);
    };

    let secret = BASE64_NO_PAD.decode(body)?;
    if checksum(&secret) != expected {
        return Err(TokenError::ChecksumMismatch);
    }
    Ok(TrustedSecret(secret))
}

/// Raw 32-byte MAC from its unpadded base64 form.
fn decode_tag(tag: &str) -> Option<[u8; 32]> {
    let bytes = BASE64_NO_PAD.decode(tag.trim_end_matches('=')).ok()?;
    bytes.as_slice().try_into().ok()
}

/// Unpadded base64 HMAC-SHA256 of `message` under `secret`.
pub fn message_tag(message: &str, secret: &[u8]) -> String {
    BASE64_NO_PAD.encode(hmac_sha256::HMAC::mac(message.as_bytes(), secret))
}

/// Transient `(json_body, tag)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub body: String,
    pub tag: String,
}

impl CommandEnvelope {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let captures = PAIR_RE.captures(raw.trim()).ok_or(AuthError::Malformed)?;
        match (captures.get(1), captures.get(2)) {
            (Some(body), Some(tag)) => Ok(Self {
                body: body.as_str().to_string(),
                tag: tag.as_str().to_string(),
            }),
            _ => Err(AuthError::Malformed),
        }
    }

    /// Stamp `body` with `now`, serialize it and tag it.
    pub fn sign(mut body: Map<String, Value>, secret: &[u8], now: f64) -> Self {
        body.insert("time".to_string(), Value::from(now));
        let body = Value::Object(body).to_string();
        let tag = message_tag(&body, secret);
        Self { body, tag }
    }
}

impl fmt::Display for CommandEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "('{}', '{}')", self.body, self.tag)
    }
}

#[derive(Debug, Clone)]
pub struct CommandAuthenticator {
    secrets: BoundedVec<TrustedSecret, MAX_TRUSTED_SECRETS>,
    max_age: Duration,
}

impl CommandAuthenticator {
    pub fn new(max_age: Duration) -> Self {
        Self {
            secrets: BoundedVec::new(),
            max_age,
        }
    }

    /// Decode every token independently. Bad tokens are logged and skipped.
    pub fn from_tokens<S: AsRef<str>>(prefix: &str, tokens: &[S], max_age: Duration) -> Self {
        let mut authenticator = Self::new(max_age);
        for (idx, token) in tokens.iter().enumerate() {
            debug!("Decoding token {}...", idx);
            match decode_token(prefix, token.as_ref()) {
                Ok(secret) => {
                    if authenticator.add_secret(secret).is_err() {
                        error!("Token {} ignored: at most {} tokens", idx, MAX_TRUSTED_SECRETS);
                    }
                }
                Err(e) => error!("Token {} not recognized: {}", idx, e),
            }
        }

        if authenticator.secrets.is_empty() {
            error!("CRITICAL: no tokens accepted, remote commands are disabled");
        } else {
            debug!("{} token(s) decoded", authenticator.secrets.len());
        }
        authenticator
    }

    pub fn add_secret(&mut self, secret: TrustedSecret) -> Result<(), TrustedSecret> {
        self.secrets.push(secret)
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Verify a raw command message and return its body.
    pub fn authenticate(&self, raw: &str, now: f64) -> Result<Map<String, Value>, AuthError> {
        debug!("Received in command channel: {}", raw);
        let envelope = CommandEnvelope::parse(raw)?;

        let body = match serde_json::from_str::<Value>(&envelope.body)? {
            Value::Object(map) => map,
            _ => return Err(AuthError::NotAnObject),
        };
        let sent = body.get("time").and_then(Value::as_f64).ok_or(AuthError::MissingTime)?;

        let age = (now - sent).abs();
        let max_age = self.max_age.as_secs_f64();
        if age > max_age || age.is_nan() {
            return Err(AuthError::Stale { age, max_age });
        }

        if self.secrets.is_empty() {
            return Err(AuthError::NoSecrets);
        }
        let tag = decode_tag(&envelope.tag).ok_or(AuthError::BadTag)?;
        let matched = self
            .secrets
            .iter()
            .any(|secret| hmac_sha256::HMAC::verify(envelope.body.as_bytes(), secret.as_bytes(), &tag));
        if !matched {
            return Err(AuthError::BadTag);
        }
        Ok(body)
    }

    /// Authenticate `raw` and store its output values in `registry`. Failures
    /// are logged and leave the registry untouched.
    pub fn apply(&self, raw: &str, now: f64, registry: &mut ChannelRegistry) -> Option<Vec<(String, Level)>> {
        match self.authenticate(raw, now) {
            Ok(mut body) => {
                body.remove("time");
                let applied = registry.apply_command(&body);
                for (name, level) in &applied {
                    debug!("Output '{}' commanded {:?}", name, level);
                }
                Some(applied)
            }
            Err(e) => {
                warn!("Command rejected: {}", e);
                None
            }
        }
    }
}
