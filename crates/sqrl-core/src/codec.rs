//! base64url helpers and the CRLF-delimited name/value envelope format used
//! by the `client` and `server` wire fields.
//!
//! Pure functions only — no I/O, no global state.

use base64::{Engine as _, engine::general_purpose::URL_SAFE};

use crate::error::CodecError;

/// Pads a base64 string with `=` out to a multiple of 4 characters.
///
/// SQRL transmits base64url without padding; standard decoders require it.
#[must_use]
pub fn pad(data: &str) -> String {
    let remainder = data.len() % 4;
    if remainder == 0 {
        return data.to_string();
    }
    let mut out = data.to_string();
    out.extend(std::iter::repeat_n('=', 4 - remainder));
    out
}

/// Strips trailing `=` padding from a base64 string.
#[must_use]
pub fn depad(data: &str) -> String {
    data.trim_end_matches('=').to_string()
}

/// Encodes bytes as unpadded base64url.
#[must_use]
pub fn b64u_encode(data: &[u8]) -> String {
    depad(&URL_SAFE.encode(data))
}

/// Decodes an unpadded (or padded) base64url string.
///
/// # Errors
///
/// Returns [`CodecError::Base64`] if `s`, once re-padded, is not valid
/// base64url.
pub fn b64u_decode(s: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE.decode(pad(s)).map_err(|e| CodecError::Base64(e.to_string()))
}

/// Decodes an unpadded base64url string and interprets it as UTF-8.
///
/// # Errors
///
/// Returns [`CodecError::Base64`] on bad base64, [`CodecError::NotUtf8`] if
/// the decoded bytes are not valid UTF-8.
pub fn b64u_decode_utf8(s: &str) -> Result<String, CodecError> {
    let bytes = b64u_decode(s)?;
    String::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)
}

/// A parsed `name=value` CRLF envelope, preserving the order lines were
/// received in.
///
/// Used for both the `client` field and the name/value form of the
/// `server` field. Decoding tolerates leading/trailing whitespace around
/// the whole decoded blob (SQRL clients commonly append a trailing CRLF).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pairs: Vec<(String, String)>,
}

impl Envelope {
    /// An empty envelope, built up with [`Envelope::insert`].
    ///
    /// Used to hold the raw wire parameters (`nut`, `client`, `server`,
    /// `ids`, ...) a host extracts from a POST body, independent of the
    /// CRLF line format those values happen to share with the decoded
    /// `client`/`server` fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a key's value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.pairs.push((key, value));
        }
    }

    /// Parses CRLF-delimited `name=value` lines.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedLine`] if any non-empty line lacks an
    /// `=` separator.
    pub fn parse(decoded: &str) -> Result<Self, CodecError> {
        let trimmed = decoded.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let mut pairs = Vec::new();
        for line in trimmed.split("\r\n") {
            let Some((name, value)) = line.split_once('=') else {
                return Err(CodecError::MalformedLine(line.to_string()));
            };
            pairs.push((name.to_string(), value.to_string()));
        }
        Ok(Self { pairs })
    }

    /// Decodes a base64url-encoded envelope.
    ///
    /// # Errors
    ///
    /// Propagates base64/UTF-8 errors from [`b64u_decode_utf8`] and
    /// malformed-line errors from [`Envelope::parse`].
    pub fn from_base64(s: &str) -> Result<Self, CodecError> {
        Self::parse(&b64u_decode_utf8(s)?)
    }

    /// Looks up a single value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(name, _)| name == key).map(|(_, v)| v.as_str())
    }

    /// Returns `true` if the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates over pairs in the order they appeared on the wire.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Splits a `~`-separated option list into its ordered tokens,
    /// preserving client order.
    #[must_use]
    pub fn split_opt(value: &str) -> Vec<String> {
        if value.is_empty() {
            return Vec::new();
        }
        value.split('~').map(str::to_string).collect()
    }

    /// Composes CRLF-delimited `name=value` lines in the given order.
    #[must_use]
    pub fn compose(pairs: &[(&str, &str)]) -> String {
        pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_rounds_up_to_multiple_of_four() {
        assert_eq!(pad(""), "");
        assert_eq!(pad("a"), "a===");
        assert_eq!(pad("ab"), "ab==");
        assert_eq!(pad("abc"), "abc=");
        assert_eq!(pad("abcd"), "abcd");
    }

    #[test]
    fn depad_strips_trailing_equals() {
        assert_eq!(depad("abcd"), "abcd");
        assert_eq!(depad("ab=="), "ab");
        assert_eq!(depad("a==="), "a");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let data = b"hello, sqrl!";
        let encoded = b64u_encode(data);
        assert!(!encoded.ends_with('='));
        assert_eq!(b64u_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(b64u_decode("not base64!!").is_err());
    }

    #[test]
    fn envelope_parses_crlf_lines() {
        let env = Envelope::parse("ver=1\r\ncmd=query\r\nidk=abc\r\n").unwrap();
        assert_eq!(env.get("ver"), Some("1"));
        assert_eq!(env.get("cmd"), Some("query"));
        assert_eq!(env.get("idk"), Some("abc"));
        assert_eq!(env.get("missing"), None);
    }

    #[test]
    fn envelope_tolerates_surrounding_whitespace() {
        let env = Envelope::parse("  ver=1\r\ncmd=query\r\n  ").unwrap();
        assert_eq!(env.get("ver"), Some("1"));
    }

    #[test]
    fn envelope_rejects_line_without_equals() {
        assert!(Envelope::parse("ver=1\r\nbroken\r\n").is_err());
    }

    #[test]
    fn envelope_rejects_embedded_blank_line() {
        assert!(Envelope::parse("ver=1\r\n\r\ncmd=query").is_err());
    }

    #[test]
    fn envelope_values_may_contain_extra_equals() {
        let env = Envelope::parse("x=a=b=c").unwrap();
        assert_eq!(env.get("x"), Some("a=b=c"));
    }

    #[test]
    fn split_opt_preserves_order() {
        assert_eq!(Envelope::split_opt("cps~suk"), vec!["cps", "suk"]);
        assert_eq!(Envelope::split_opt(""), Vec::<String>::new());
    }

    #[test]
    fn compose_joins_with_crlf() {
        let s = Envelope::compose(&[("ver", "1"), ("cmd", "query")]);
        assert_eq!(s, "ver=1\r\ncmd=query");
    }

    #[test]
    fn from_base64_roundtrips_through_compose() {
        let s = Envelope::compose(&[("ver", "1"), ("cmd", "query"), ("idk", "abc")]);
        let encoded = b64u_encode(s.as_bytes());
        let env = Envelope::from_base64(&encoded).unwrap();
        assert_eq!(env.get("ver"), Some("1"));
        assert_eq!(env.get("cmd"), Some("query"));
        assert_eq!(env.get("idk"), Some("abc"));
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let mut env = Envelope::new();
        env.insert("nut", "first");
        env.insert("nut", "second");
        assert_eq!(env.get("nut"), Some("second"));
    }

    #[test]
    fn from_base64_rejects_non_utf8() {
        let bytes: &[u8] = &[0xff, 0xfe, 0xfd];
        let encoded = b64u_encode(bytes);
        assert!(matches!(Envelope::from_base64(&encoded), Err(CodecError::NotUtf8)));
    }
}
