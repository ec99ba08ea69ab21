//! Jira webhook signature verification using HMAC-SHA256.
//!
//! Jira signs webhook payloads with the shared secret configured on the
//! webhook and sends the result in the `X-Hub-Signature` header as
//! `sha256=<hex>`. Some senders omit the algorithm prefix, so a bare hex
//! digest is accepted as well.
//!
//! Verification runs over the exact raw request bytes, before any parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Name of the header carrying the signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

/// Parses a signature header (`sha256=abc123...` or `abc123...`) into raw
/// bytes.
///
/// Returns `None` for malformed headers (other algorithm, invalid hex, empty
/// digest). Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let header = header.trim();
    let hex_sig = match header.split_once('=') {
        Some(("sha256", digest)) => digest,
        Some(_) => return None,
        None => header,
    };

    if hex_sig.is_empty() {
        return None;
    }
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so the fallback is unreachable.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return Vec::new();
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a header value: `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Signs `payload` and returns the header value a sender would attach.
pub fn sign_payload(payload: &[u8], secret: &[u8]) -> String {
    format_signature_header(&compute_signature(payload, secret))
}

/// Verifies a webhook signature against the payload and secret.
///
/// Fails closed: a missing header, a malformed header, a mismatch or an empty
/// secret all yield `false`. The digest comparison is constant-time.
///
/// # Arguments
///
/// * `payload` - The raw webhook payload bytes
/// * `signature_header` - The value of the `X-Hub-Signature` header, if any
/// * `secret` - The webhook secret configured in Jira
pub fn verify_signature(payload: &[u8], signature_header: Option<&str>, secret: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }

    let Some(expected_signature) = signature_header.and_then(parse_signature_header) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&expected_signature).is_ok()
}
