//! Accumulates TIF status bits and named return parameters, and serializes
//! them into the envelope a SQRL client receives back.

use crate::codec::b64u_encode;
use crate::mac::siphash_b64u;

/// Current identity known.
pub const TIF_IDS_MATCH: u16 = 0x01;
/// Previous identity known.
pub const TIF_PIDS_MATCH: u16 = 0x02;
/// Client and nut IP addresses matched.
pub const TIF_IP_MATCHED: u16 = 0x04;
/// Identity disabled.
pub const TIF_SQRL_DISABLED: u16 = 0x08;
/// Requested function not supported.
pub const TIF_FUNCTION_NOT_SUPPORTED: u16 = 0x10;
/// Transient error; client should retry.
pub const TIF_TRANSIENT_ERROR: u16 = 0x20;
/// The command failed.
pub const TIF_COMMAND_FAILED: u16 = 0x40;
/// The client request was malformed.
pub const TIF_CLIENT_FAILURE: u16 = 0x80;
/// The nut presented was stale.
pub const TIF_STALE_NUT: u16 = 0x100;

const ALL_TIF_BITS: u16 = 0x1FF;

/// Accumulated response state: TIF bitfield plus an ordered set of named
/// parameters.
///
/// A `Request` owns its `Response` exclusively until `finalize`, which
/// returns a clone via [`Response::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    tif: u16,
    params: Vec<(String, String)>,
}

impl Response {
    /// An empty response: `tif = 0`, no parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current TIF bitfield.
    #[must_use]
    pub fn tif(&self) -> u16 {
        self.tif
    }

    /// Sets the given bits. Bits outside the legal `0x000..=0x1FF` range
    /// are ignored. Setting an already-set bit is a no-op.
    pub fn tif_on(&mut self, bits: u16) {
        self.tif |= bits & ALL_TIF_BITS;
    }

    /// Clears the given bits. Clearing an already-clear bit is a no-op.
    pub fn tif_off(&mut self, bits: u16) {
        self.tif &= !(bits & ALL_TIF_BITS);
    }

    /// Sets or overwrites a named parameter.
    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.params.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.params.push((key, value));
        }
    }

    /// Reads back a previously set parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Shallow copy constructor, used by `Request::finalize` to produce
    /// the Response it hands back to the caller.
    #[must_use]
    pub fn load(other: &Self) -> Self {
        other.clone()
    }

    /// Serializes to CRLF-terminated `name=value` lines: `ver=1` first,
    /// then `tif` and every parameter sorted lexicographically by key.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut lines: Vec<(String, String)> = self.params.clone();
        lines.push(("tif".to_string(), format!("{:x}", self.tif)));
        lines.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::from("ver=1\r\n");
        for (key, value) in &lines {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }

    /// Serializes and base64url-encodes (unpadded) the envelope.
    #[must_use]
    pub fn to_envelope(&self) -> String {
        b64u_encode(self.serialize().as_bytes())
    }

    /// SipHash-2-4 of the serialized envelope, keyed by the first 16
    /// bytes of `key`, base64url-encoded unpadded.
    #[must_use]
    pub fn hmac(&self, key: &[u8]) -> String {
        siphash_b64u(key, self.serialize().as_bytes())
    }
}
