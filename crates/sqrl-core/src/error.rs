//! Error types for the SQRL core library.
//!
//! Each component boundary gets its own error enum, following the same split
//! as the rest of this codebase: codec/parsing errors, cryptographic errors,
//! URL precondition errors, and the fatal host-contract errors the request
//! state machine raises when the host violates the documented action
//! contract.

use thiserror::Error;

/// Errors from the base64url / line-envelope / query-string codec layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input was not valid base64url.
    #[error("invalid base64url: {0}")]
    Base64(String),

    /// Decoded bytes were not valid UTF-8.
    #[error("decoded content was not valid UTF-8")]
    NotUtf8,

    /// A name/value line was missing its `=` separator.
    #[error("malformed name/value line: {0:?}")]
    MalformedLine(String),
}

/// Errors from the nut codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NutError {
    /// The ciphertext failed to decode from base64url.
    #[error("nut is not valid base64url: {0}")]
    Encoding(#[from] CodecError),

    /// AEAD decryption or authentication failed.
    #[error("nut failed authenticated decryption")]
    DecryptionFailed,

    /// The decrypted plaintext was not exactly 16 bytes.
    #[error("decrypted nut plaintext had {0} bytes, expected 16")]
    BadLength(usize),

    /// The address string passed to `generate`/`validate` did not parse as
    /// an IPv4 or IPv6 address.
    #[error("invalid client address: {0}")]
    InvalidAddress(String),
}

/// Errors from the SQRL URL builder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// The path was not absolute (did not start with `/`).
    #[error("path must be absolute: {0:?}")]
    PathNotAbsolute(String),

    /// The path contained a reserved query delimiter (`?` or `&`).
    #[error("path must not contain '?' or '&': {0:?}")]
    PathHasQueryDelimiter(String),
}

/// Fatal errors raised when the host violates the documented action
/// contract, or when client input is malformed in a way that cannot be
/// reported through the Response TIF bitfield (wire-format parse failures
/// are reported through TIF; these are programmer errors).
///
/// None of these are transient: they indicate a bug in the calling code,
/// not an expected protocol outcome. They must never be swallowed — see
/// [`RequestError::is_fatal`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The host answered a `find` action without a `found` list, or with
    /// an empty one.
    #[error("'find' action requires a non-empty 'found' list of booleans")]
    FindMissingFound,

    /// The host reported a disabled account without providing the Server
    /// Unlock Key.
    #[error("a disabled account response requires the Server Unlock Key (suk)")]
    MissingSuk,

    /// The host answered an `auth` action without the `authenticated` flag.
    #[error("'auth' action requires an 'authenticated' boolean")]
    AuthMissingAuthenticated,

    /// The host answered a `disable` action without the `deactivated` flag.
    #[error("'disable' action requires a 'deactivated' boolean")]
    DisableMissingDeactivated,

    /// The host answered an `enable` action without the `activated` flag.
    #[error("'enable' action requires an 'activated' boolean")]
    EnableMissingActivated,

    /// The host answered a `remove` action without the `removed` flag.
    #[error("'remove' action requires a 'removed' boolean")]
    RemoveMissingRemoved,

    /// The host answered a `vuk` action without the `vuk` field at all.
    #[error("'vuk' action requires a 'vuk' field (Some key or None)")]
    VukMissing,

    /// An `ask` prompt was requested without a message.
    #[error("'ask' requires a 'msg' field")]
    AskMissingMessage,

    /// An `ask` button label contained a semicolon, which would corrupt the
    /// wire encoding.
    #[error("'ask' button labels must not contain ';'")]
    AskLabelHasSemicolon,

    /// The step loop exceeded its iteration bound without reaching `ACTION`
    /// or `COMPLETE`. Indicates a mis-wired host driving the state machine
    /// incorrectly.
    #[error("request state machine exceeded its iteration bound; this indicates a wiring bug")]
    IterationBoundExceeded,

    /// `finalize` was asked to mint a fresh nut but given neither a
    /// pre-generated one nor a counter to stamp into it.
    #[error("finalize requires either a pre-generated nut or a counter")]
    FinalizeMissingCounter,

    /// Nut generation during `finalize` failed, almost always because the
    /// host passed an unparseable address.
    #[error("finalize failed to generate a replacement nut: {0}")]
    Nut(#[from] NutError),
}

impl RequestError {
    /// Always `true`. Every variant of [`RequestError`] is a host-contract
    /// violation, never a transient condition — unlike
    /// `ConnectionError::is_transient`, there is no variant here worth
    /// retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        true
    }
}
