//! SipHash-2-4 keyed MAC, used both by [`crate::response::Response::hmac`]
//! and by the request state machine's optional `server`-field integrity
//! check.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::codec::b64u_encode;

fn key_halves(key: &[u8]) -> (u64, u64) {
    let mut buf = [0u8; 16];
    let n = key.len().min(16);
    buf[..n].copy_from_slice(&key[..n]);
    (u64::from_le_bytes(buf[0..8].try_into().unwrap_or_default()), u64::from_le_bytes(buf[8..16].try_into().unwrap_or_default()))
}

/// Computes SipHash-2-4 of `data` keyed by the first 16 bytes of `key`,
/// returned as unpadded base64url.
#[must_use]
pub fn siphash_b64u(key: &[u8], data: &[u8]) -> String {
    let (k0, k1) = key_halves(key);
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(data);
    b64u_encode(&hasher.finish().to_le_bytes())
}
