//! Slack request signing (v0 scheme)

use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Slack-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Slack-Request-Timestamp";
const VERSION_PREFIX: &str = "v0=";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signing secret is not configured")]
    MissingSecret,

    #[error("missing X-Slack-Request-Timestamp header")]
    MissingTimestamp,

    #[error("missing X-Slack-Signature header")]
    MissingSignature,

    #[error("request timestamp is not a unix time: {0:?}")]
    MalformedTimestamp(String),

    #[error("request timestamp is {age_secs}s away from server time")]
    StaleTimestamp { age_secs: i64 },

    #[error("signature is not a v0 hex digest")]
    MalformedSignature,

    #[error("signature does not match")]
    Mismatch,
}

fn signed_mac(secret: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::MissingSecret)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    Ok(mac)
}

/// Computes the `X-Slack-Signature` header value for a request body.
pub fn sign_slack_request(
    secret: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    let mac = signed_mac(secret, timestamp, body)?;
    Ok(format!(
        "{}{}",
        VERSION_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifies a Slack request signature and its replay window.
///
/// `now` is unix seconds; requests whose timestamp differs from it by more
/// than `tolerance_secs` in either direction are rejected before the MAC is
/// checked.
pub fn verify_slack_signature(
    secret: &str,
    timestamp_header: Option<&str>,
    body: &[u8],
    signature_header: Option<&str>,
    now: i64,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    let timestamp = timestamp_header.ok_or(SignatureError::MissingTimestamp)?;
    let signature = signature_header.ok_or(SignatureError::MissingSignature)?;

    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp(timestamp.to_string()))?;
    let age_secs = now.saturating_sub(sent_at);
    if age_secs.unsigned_abs() > tolerance_secs {
        return Err(SignatureError::StaleTimestamp { age_secs });
    }

    let hex_digest = signature
        .strip_prefix(VERSION_PREFIX)
        .ok_or(SignatureError::MalformedSignature)?;
    let expected = hex_decode(hex_digest).map_err(|_| SignatureError::MalformedSignature)?;

    let mac = signed_mac(secret, timestamp, body)?;
    // verify_slice compares in constant time
    mac.verify_slice(&expected).map_err(|_| {
        debug!("Slack signature mismatch for timestamp {}", timestamp);
        SignatureError::Mismatch
    })
}
