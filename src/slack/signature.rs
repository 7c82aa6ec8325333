//! Request-signature verification for inbound chat events.
//!
//! Every inbound event must pass here before any state transition. The
//! scheme is the standard `v0` one: hex HMAC-SHA256 of
//! `v0:{timestamp}:{body}` under the signing secret, with a freshness
//! window on the timestamp to stop replays.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew between the event timestamp and now.
const FRESHNESS_WINDOW_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature timestamp is not a unix epoch value")]
    MalformedTimestamp,

    #[error("signature timestamp outside the freshness window")]
    Stale,

    #[error("signature has an unknown version prefix")]
    UnknownVersion,

    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("signature mismatch")]
    Mismatch,
}

/// Verify an inbound event signature.
pub fn verify(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp)?;
    if (now.timestamp() - ts).abs() > FRESHNESS_WINDOW_SECS {
        return Err(SignatureError::Stale);
    }

    let provided = signature
        .strip_prefix("v0=")
        .ok_or(SignatureError::UnknownVersion)?;
    let provided = hex::decode(provided).map_err(|_| SignatureError::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn sign(timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn at(epoch: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch, 0).unwrap()
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"type":"form_submission"}"#;
        let signature = sign("1700000000", body);
        assert_eq!(
            verify(SECRET, "1700000000", body, &signature, at(1_700_000_010)),
            Ok(())
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signature = sign("1700000000", b"original");
        assert_eq!(
            verify(SECRET, "1700000000", b"tampered", &signature, at(1_700_000_010)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = b"body";
        let signature = sign("1700000000", body);
        assert_eq!(
            verify(SECRET, "1700000000", body, &signature, at(1_700_000_000 + 301)),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn unknown_version_prefix_is_rejected() {
        assert_eq!(
            verify(SECRET, "1700000000", b"body", "v1=abcdef", at(1_700_000_000)),
            Err(SignatureError::UnknownVersion)
        );
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        assert_eq!(
            verify(SECRET, "yesterday", b"body", "v0=abcdef", at(1_700_000_000)),
            Err(SignatureError::MalformedTimestamp)
        );
    }
}
