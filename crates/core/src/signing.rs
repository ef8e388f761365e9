//! HMAC-SHA256 signing of webhook bodies.
//!
//! Receivers verify a delivery by recomputing the HMAC of the raw body with
//! the shared secret and comparing it against the `X-Webhook-Signature`
//! header, which carries `sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 of `body` keyed by `secret`.
pub fn compute_webhook_hmac(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Full header value for `body`, e.g. `sha256=5bdc...`.
pub fn signature_header_value(secret: &str, body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", compute_webhook_hmac(secret, body))
}

/// Constant-time check of a received header value against `body`.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
