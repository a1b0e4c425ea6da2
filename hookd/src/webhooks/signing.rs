//! HMAC-SHA256 payload signing.
//!
//! The signature is the hex-encoded HMAC-SHA256 of the exact request body,
//! keyed by the subscription's secret string. Subscribers recompute it over
//! the raw bytes they received and compare against the signature header.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str) -> HmacSha256 {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC key can be of any size"),
    }
}

/// Generate a new subscription secret: 32 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    hex::encode(secret_bytes)
}

/// Sign `body` with `secret`, returning the lowercase hex digest.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex signature against `body` in constant time.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(signature) = hex::decode(signature.trim()) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}
