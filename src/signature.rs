// signature.rs
//! HMAC-SHA256 verification of webhook payloads.
//!
//! GitHub sends the signature in `X-Hub-Signature-256` as `sha256=<hex>`.
//! [`verify`] accepts that header value as-is or with the prefix already
//! stripped. Malformed hex never panics; it simply fails verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Checks a request signature against a repository secret.
///
/// Implemented by [`HmacVerifier`]; the pipeline holds it behind this trait
/// so tests can observe whether verification happened at all.
pub trait Verifier: Send + Sync {
    fn verify(&self, secret: &str, signature: &str, payload: &[u8]) -> bool;
}

/// The production verifier: HMAC-SHA256 keyed by the UTF-8 bytes of the secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacVerifier;

impl Verifier for HmacVerifier {
    fn verify(&self, secret: &str, signature: &str, payload: &[u8]) -> bool {
        verify(secret, signature, payload)
    }
}

/// Decodes a signature into raw bytes, stripping an optional `sha256=` prefix.
///
/// Returns `None` for odd-length or non-hex input.
pub fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    let hex_sig = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature);
    hex::decode(hex_sig).ok()
}

/// Computes the raw HMAC-SHA256 of `payload` keyed by `secret`.
pub fn compute_signature(secret: &str, payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats raw signature bytes the way GitHub sends them: `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", hex::encode(signature))
}

/// Verifies `signature` over the raw `payload` using `secret`.
///
/// The comparison is constant-time via [`Mac::verify_slice`]. Callers decide
/// what an empty secret means; this function never skips verification itself.
///
/// ```
/// use github_checkpoint::signature::{compute_signature, format_signature_header, verify};
///
/// let payload = b"Hello, World!";
/// let header = format_signature_header(&compute_signature("It's a Secret to Everybody", payload));
///
/// assert!(verify("It's a Secret to Everybody", &header, payload));
/// assert!(!verify("wrong-secret", &header, payload));
/// ```
pub fn verify(secret: &str, signature: &str, payload: &[u8]) -> bool {
    let Some(expected) = decode_signature(signature) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
