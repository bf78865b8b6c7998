// HMAC-SHA1 signatures in the `X-Hub-Signature` format (`sha1=<hex>`)

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Prefix identifying the SHA1 HMAC scheme in a signature header
pub const SIGNATURE_PREFIX: &str = "sha1=";

/// Check that `signature` is the HMAC-SHA1 of `payload` under `key`.
///
/// Returns `false` for a missing prefix, a non-hex remainder or a mismatch.
/// The comparison runs in constant time.
pub fn verify(payload: &[u8], signature: &str, key: &[u8]) -> bool {
    let Some(hex_sig) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let provided = match hex::decode(hex_sig) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let Some(expected) = compute(payload, key) else {
        return false;
    };

    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Produce the `sha1=<hex>` signature header value for `payload`.
pub fn sign(payload: &[u8], key: &[u8]) -> String {
    let digest = compute(payload, key).unwrap_or_default();
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest))
}

fn compute(payload: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    // HMAC accepts keys of any length, so this only fails on a broken backend
    let mut mac = HmacSha1::new_from_slice(key).ok()?;
    mac.update(payload);
    Some(mac.finalize().into_bytes().to_vec())
}
