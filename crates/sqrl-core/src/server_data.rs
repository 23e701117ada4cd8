//! The decoded `server` field: either the raw login URL the server most
//! recently issued, or a name/value envelope describing one (carrying at
//! least a `qry` sub-field). The distinction is made on scheme alone.

use url::Url;

use crate::codec::{CodecError, Envelope, b64u_decode_utf8};

/// A decoded `server` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerData {
    /// The decoded content was itself a `sqrl://`/`qrl://` URL.
    Url(String),
    /// The decoded content was a CRLF name/value envelope (the server's own
    /// prior response, echoed back by the client).
    Fields(Envelope),
}

impl ServerData {
    /// Decodes and classifies a base64url-encoded `server` field.
    ///
    /// # Errors
    ///
    /// Propagates [`CodecError`] from base64/UTF-8 decoding, or from
    /// [`Envelope::parse`] when the content is not a URL and fails to parse
    /// as CRLF name/value lines.
    pub fn from_base64(s: &str) -> Result<Self, CodecError> {
        let decoded = b64u_decode_utf8(s)?;
        match Url::parse(&decoded) {
            Ok(url) if url.scheme() == "sqrl" || url.scheme() == "qrl" => Ok(Self::Url(decoded)),
            _ => Ok(Self::Fields(Envelope::parse(&decoded)?)),
        }
    }

    /// The `qry` value to resume against: the `qry` sub-field when this is
    /// a name/value envelope, or the whole URL when it is a bare URL.
    #[must_use]
    pub fn qry(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url.as_str()),
            Self::Fields(fields) => fields.get("qry"),
        }
    }

    /// The raw URL, when this was a bare-URL `server` field.
    #[must_use]
    pub fn as_url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url.as_str()),
            Self::Fields(_) => None,
        }
    }
}
