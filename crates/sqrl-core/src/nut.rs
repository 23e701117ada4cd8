//! The 128-bit authenticated nut token: build, encrypt, decrypt, validate.
//!
//! The plaintext layout (16 bytes) is: a 32-bit client address
//! representation, a little-endian 32-bit Unix timestamp, a little-endian
//! 32-bit counter, and a 32-bit random word whose low bit is the QR/link
//! flag. Encryption is `ChaCha20Poly1305` with a synthetic nonce derived as
//! `HMAC-SHA256(master_key, plaintext)[..12]`, transmitted as a 12-byte
//! prefix ahead of the ciphertext — the host never supplies or tracks a
//! nonce itself.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::codec::{b64u_decode, b64u_encode};
use crate::error::NutError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const PLAINTEXT_LEN: usize = 16;

fn now_unix() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn derive_nonce(master_key: &[u8; 32], plaintext: &[u8; PLAINTEXT_LEN]) -> [u8; NONCE_LEN] {
    let Ok(mut mac) = HmacSha256::new_from_slice(master_key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

/// Packs a client address into its 32-bit nut representation.
///
/// IPv4 addresses pack as their raw 4 octets. IPv6 addresses reduce to the
/// last 4 bytes of `SHA-256(master_key ‖ packed_v6)`, using the master key
/// as a prefix so the digest cannot be linked across servers.
#[must_use]
pub fn pack_address(master_key: &[u8; 32], addr: IpAddr) -> [u8; 4] {
    match addr {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let mut hasher = Sha256::new();
            hasher.update(master_key);
            hasher.update(v6.octets());
            let digest = hasher.finalize();
            let mut out = [0u8; 4];
            out.copy_from_slice(&digest[digest.len() - 4..]);
            out
        }
    }
}

/// The two string forms produced by one call to [`generate`]. Both share
/// the same timestamp, counter, and random entropy; they differ only in
/// the QR/link flag bit, and so encrypt to distinct ciphertexts.
#[derive(Debug, Clone)]
pub struct GeneratedNut {
    /// Flag bit 0 — a nut meant to be scanned from a QR code.
    pub qr: String,
    /// Flag bit 1 — a nut meant to be followed as a clicked link.
    pub link: String,
}

impl GeneratedNut {
    /// Selects the string form matching `link`.
    #[must_use]
    pub fn for_flag(&self, link: bool) -> &str {
        if link { &self.link } else { &self.qr }
    }
}

fn encrypt_with_flag(
    master_key: &[u8; 32],
    addr: [u8; 4],
    timestamp: u32,
    counter: u32,
    random_word: [u8; 4],
    link: bool,
) -> Result<String, NutError> {
    let mut plaintext = [0u8; PLAINTEXT_LEN];
    plaintext[0..4].copy_from_slice(&addr);
    plaintext[4..8].copy_from_slice(&timestamp.to_le_bytes());
    plaintext[8..12].copy_from_slice(&counter.to_le_bytes());
    let mut random = random_word;
    random[3] = (random[3] & 0xFE) | u8::from(link);
    plaintext[12..16].copy_from_slice(&random);

    let nonce = derive_nonce(master_key, &plaintext);
    let cipher = ChaCha20Poly1305::new(master_key.into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| NutError::DecryptionFailed)?;

    let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(b64u_encode(&wire))
}

/// Generates a QR/link nut pair.
///
/// `random_word` is caller-supplied so generation stays a pure,
/// deterministically testable function; see [`generate_random`] for a
/// convenience wrapper drawing from the OS RNG.
///
/// # Errors
///
/// Returns [`NutError::InvalidAddress`] if `addr` does not parse as an
/// IPv4 or IPv6 address.
pub fn generate(
    master_key: &[u8; 32],
    addr: &str,
    counter: u32,
    timestamp: Option<u32>,
    random_word: [u8; 4],
) -> Result<GeneratedNut, NutError> {
    let ip: IpAddr = addr.parse().map_err(|_| NutError::InvalidAddress(addr.to_string()))?;
    let packed_addr = pack_address(master_key, ip);
    let ts = timestamp.unwrap_or_else(now_unix);

    let qr = encrypt_with_flag(master_key, packed_addr, ts, counter, random_word, false)?;
    let link = encrypt_with_flag(master_key, packed_addr, ts, counter, random_word, true)?;
    trace!(counter, timestamp = ts, "generated nut pair");
    Ok(GeneratedNut { qr, link })
}

/// Generates a QR/link nut pair using OS randomness for the random word.
///
/// # Errors
///
/// Returns [`NutError::InvalidAddress`] if `addr` does not parse.
pub fn generate_random(
    master_key: &[u8; 32],
    addr: &str,
    counter: u32,
    timestamp: Option<u32>,
) -> Result<GeneratedNut, NutError> {
    use rand::RngCore;
    let mut random_word = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut random_word);
    generate(master_key, addr, counter, timestamp, random_word)
}

/// A decrypted nut, plus the three validity booleans [`Nut::validate`]
/// fills in.
///
/// The original client address cannot be recovered from a loaded nut —
/// only equality against a rehashed candidate address is possible.
#[derive(Debug, Clone)]
pub struct Nut {
    addr: [u8; 4],
    /// Unix timestamp the nut was generated at.
    pub timestamp: u32,
    /// Host-supplied monotonic counter at generation time.
    pub counter: u32,
    flag_link: bool,
    /// Client address matched the candidate passed to `validate`.
    pub ipmatch: bool,
    /// `now - timestamp` was non-negative and under the configured ttl.
    pub fresh: bool,
    /// Counter fell within the configured `[mincounter, maxcounter]` bounds.
    pub countersane: bool,
}

impl Nut {
    /// Decrypts a base64url-encoded nut.
    ///
    /// # Errors
    ///
    /// Returns [`NutError::Encoding`] if `encoded` is not valid base64url,
    /// [`NutError::DecryptionFailed`] if authenticated decryption fails
    /// (wrong key, truncated input, or tampered ciphertext), or
    /// [`NutError::BadLength`] if the decrypted plaintext is not exactly
    /// 16 bytes.
    pub fn load(encoded: &str, master_key: &[u8; 32]) -> Result<Self, NutError> {
        let wire = b64u_decode(encoded).map_err(NutError::Encoding)?;
        if wire.len() < NONCE_LEN {
            warn!("nut ciphertext shorter than nonce prefix");
            return Err(NutError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(master_key.into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| NutError::DecryptionFailed)?;
        if plaintext.len() != PLAINTEXT_LEN {
            return Err(NutError::BadLength(plaintext.len()));
        }

        let mut addr = [0u8; 4];
        addr.copy_from_slice(&plaintext[0..4]);
        let timestamp = u32::from_le_bytes(plaintext[4..8].try_into().unwrap_or_default());
        let counter = u32::from_le_bytes(plaintext[8..12].try_into().unwrap_or_default());
        let flag_link = plaintext[15] & 1 == 1;

        Ok(Self {
            addr,
            timestamp,
            counter,
            flag_link,
            ipmatch: false,
            fresh: false,
            countersane: false,
        })
    }

    /// `true` if this nut was minted for QR-code display.
    #[must_use]
    pub fn isqr(&self) -> bool {
        !self.flag_link
    }

    /// `true` if this nut was minted for a clicked link.
    #[must_use]
    pub fn islink(&self) -> bool {
        self.flag_link
    }

    /// Validates the nut against an expected client address and freshness
    /// window, reading the current time from the OS clock.
    ///
    /// # Errors
    ///
    /// Returns [`NutError::InvalidAddress`] if `addr` does not parse.
    pub fn validate(
        &mut self,
        addr: &str,
        master_key: &[u8; 32],
        ttl: u32,
        maxcounter: Option<u32>,
        mincounter: Option<u32>,
    ) -> Result<(), NutError> {
        self.validate_at(addr, master_key, ttl, maxcounter, mincounter, now_unix())
    }

    /// Same as [`Nut::validate`] but with an explicit "now", for
    /// deterministic tests.
    ///
    /// # Errors
    ///
    /// Returns [`NutError::InvalidAddress`] if `addr` does not parse.
    pub fn validate_at(
        &mut self,
        addr: &str,
        master_key: &[u8; 32],
        ttl: u32,
        maxcounter: Option<u32>,
        mincounter: Option<u32>,
        now: u32,
    ) -> Result<(), NutError> {
        let ip: IpAddr = addr.parse().map_err(|_| NutError::InvalidAddress(addr.to_string()))?;
        let candidate = pack_address(master_key, ip);

        self.ipmatch = candidate == self.addr;
        self.fresh = ttl > 0 && now >= self.timestamp && (now - self.timestamp) < ttl;
        self.countersane = mincounter.is_none_or(|m| self.counter >= m)
            && maxcounter.is_none_or(|m| self.counter <= m);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn generate_then_load_roundtrips_v4_address() {
        let generated = generate(&KEY, "203.0.113.9", 42, Some(1_700_000_000), [1, 2, 3, 4]).unwrap();
        let nut = Nut::load(&generated.qr, &KEY).unwrap();
        assert_eq!(nut.timestamp, 1_700_000_000);
        assert_eq!(nut.counter, 42);
        assert!(nut.isqr());
        assert!(!nut.islink());
    }

    #[test]
    fn validate_confirms_matching_address_and_freshness() {
        let generated = generate(&KEY, "203.0.113.9", 42, Some(1_700_000_000), [1, 2, 3, 4]).unwrap();
        let mut nut = Nut::load(&generated.qr, &KEY).unwrap();
        nut.validate_at("203.0.113.9", &KEY, 60, None, None, 1_700_000_010).unwrap();
        assert!(nut.ipmatch);
        assert!(nut.fresh);
        assert!(nut.countersane);
    }

    #[test]
    fn qr_and_link_forms_are_distinct() {
        let generated = generate(&KEY, "203.0.113.9", 42, Some(1_700_000_000), [1, 2, 3, 4]).unwrap();
        assert_ne!(generated.qr, generated.link);

        let qr = Nut::load(&generated.qr, &KEY).unwrap();
        let link = Nut::load(&generated.link, &KEY).unwrap();
        assert!(qr.isqr());
        assert!(link.islink());
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let generated = generate(&KEY, "203.0.113.9", 1, Some(1_700_000_000), [9, 9, 9, 9]).unwrap();
        let mut raw = crate::codec::b64u_decode(&generated.qr).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = crate::codec::b64u_encode(&raw);
        assert!(matches!(Nut::load(&tampered, &KEY), Err(NutError::DecryptionFailed)));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let generated = generate(&KEY, "203.0.113.9", 1, Some(1_700_000_000), [9, 9, 9, 9]).unwrap();
        let other_key = [8u8; 32];
        assert!(matches!(Nut::load(&generated.qr, &other_key), Err(NutError::DecryptionFailed)));
    }

    #[test]
    fn ttl_zero_makes_every_nut_stale() {
        let generated = generate(&KEY, "203.0.113.9", 1, Some(1_700_000_000), [1, 1, 1, 1]).unwrap();
        let mut nut = Nut::load(&generated.qr, &KEY).unwrap();
        nut.validate_at("203.0.113.9", &KEY, 0, None, None, 1_700_000_000).unwrap();
        assert!(!nut.fresh);
    }

    #[test]
    fn future_timestamp_is_not_fresh() {
        let generated = generate(&KEY, "203.0.113.9", 1, Some(1_700_000_100), [1, 1, 1, 1]).unwrap();
        let mut nut = Nut::load(&generated.qr, &KEY).unwrap();
        nut.validate_at("203.0.113.9", &KEY, 600, None, None, 1_700_000_000).unwrap();
        assert!(!nut.fresh);
    }

    #[test]
    fn no_counter_bounds_always_sane() {
        let generated = generate(&KEY, "203.0.113.9", 999_999, Some(1_700_000_000), [1, 1, 1, 1]).unwrap();
        let mut nut = Nut::load(&generated.qr, &KEY).unwrap();
        nut.validate_at("203.0.113.9", &KEY, 600, None, None, 1_700_000_000).unwrap();
        assert!(nut.countersane);
    }

    #[test]
    fn counter_bounds_reject_out_of_range() {
        let generated = generate(&KEY, "203.0.113.9", 50, Some(1_700_000_000), [1, 1, 1, 1]).unwrap();
        let mut nut = Nut::load(&generated.qr, &KEY).unwrap();
        nut.validate_at("203.0.113.9", &KEY, 600, Some(10), Some(20), 1_700_000_000).unwrap();
        assert!(!nut.countersane);
    }

    #[test]
    fn ipv6_address_reduces_through_hash_and_is_bit_sensitive() {
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let b: IpAddr = "2001:db8::2".parse().unwrap();
        assert_ne!(pack_address(&KEY, a), pack_address(&KEY, b));

        let generated = generate(&KEY, "2001:db8::1", 1, Some(1_700_000_000), [1, 1, 1, 1]).unwrap();
        let mut nut = Nut::load(&generated.qr, &KEY).unwrap();
        nut.validate_at("2001:db8::1", &KEY, 600, None, None, 1_700_000_000).unwrap();
        assert!(nut.ipmatch);
        nut.validate_at("2001:db8::2", &KEY, 600, None, None, 1_700_000_000).unwrap();
        assert!(!nut.ipmatch);
    }

    #[test]
    fn invalid_address_string_is_rejected() {
        assert!(matches!(
            generate(&KEY, "not-an-address", 1, Some(0), [0, 0, 0, 0]),
            Err(NutError::InvalidAddress(_))
        ));
    }
}
