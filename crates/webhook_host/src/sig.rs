//! Keyed-MAC helpers shared by the provider plugins.
//!
//! All comparisons are constant-time over the decoded MAC bytes; a
//! candidate that fails to decode never matches.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

pub(crate) fn hmac_sha256(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn hmac_sha1(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Compare a hex-encoded candidate against a computed MAC.
pub(crate) fn ct_eq_hex(candidate_hex: &str, expected: &[u8]) -> bool {
    match hex::decode(candidate_hex.trim()) {
        Ok(bytes) => bool::from(bytes.ct_eq(expected)),
        Err(_) => false,
    }
}

/// Compare a base64-encoded candidate against a computed MAC.
pub(crate) fn ct_eq_b64(candidate_b64: &str, expected: &[u8]) -> bool {
    match STANDARD.decode(candidate_b64.trim()) {
        Ok(bytes) => bool::from(bytes.ct_eq(expected)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_comparison_is_case_insensitive_on_decode() {
        let mac = hmac_sha256(b"secret", b"payload");
        let hex_lower = hex::encode(&mac);
        let hex_upper = hex_lower.to_ascii_uppercase();
        assert!(ct_eq_hex(&hex_lower, &mac));
        assert!(ct_eq_hex(&hex_upper, &mac));
        assert!(!ct_eq_hex(&hex_lower, &hmac_sha256(b"other", b"payload")));
    }

    #[test]
    fn undecodable_candidates_never_match() {
        let mac = hmac_sha256(b"secret", b"payload");
        assert!(!ct_eq_hex("zz-not-hex", &mac));
        assert!(!ct_eq_b64("!!!", &mac));
    }

    #[test]
    fn b64_comparison_roundtrip() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let mac = hmac_sha1(b"secret", b"payload");
        assert!(ct_eq_b64(&STANDARD.encode(&mac), &mac));
        assert!(!ct_eq_b64(&STANDARD.encode(b"wrong"), &mac));
    }
}
