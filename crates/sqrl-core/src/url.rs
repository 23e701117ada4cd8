//! Builds the `sqrl://`/`qrl://` login URL with a fixed query-parameter
//! ordering: `nut`, `sfn`, optionally `x`, then the caller's own pairs in
//! the order supplied.

use crate::codec::b64u_encode;
use crate::error::UrlError;

fn encode_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Builds a SQRL login URL.
///
/// `path` must be absolute and must not contain `?` or `&`; both are
/// fatal precondition violations the host is expected to never trigger in
/// production, so they surface as [`UrlError`] rather than a silently
/// mangled URL.
///
/// `sfn` is the human-readable server name; it is base64url-encoded
/// (unpadded) before being placed on the wire. `ext`, when `Some` and
/// greater than zero, inserts `x=<ext>` immediately after `sfn`. `extra`
/// pairs are appended in the order given, after percent-encoding.
///
/// # Errors
///
/// Returns [`UrlError::PathNotAbsolute`] if `path` does not start with
/// `/`, or [`UrlError::PathHasQueryDelimiter`] if it contains `?` or `&`.
pub fn build(
    secure: bool,
    authority: &str,
    path: &str,
    nut: &str,
    sfn: &str,
    ext: Option<u32>,
    extra: &[(String, String)],
) -> Result<String, UrlError> {
    if !path.starts_with('/') {
        return Err(UrlError::PathNotAbsolute(path.to_string()));
    }
    if path.contains('?') || path.contains('&') {
        return Err(UrlError::PathHasQueryDelimiter(path.to_string()));
    }

    let scheme = if secure { "sqrl" } else { "qrl" };

    let mut pairs = vec![
        ("nut".to_string(), encode_value(nut)),
        ("sfn".to_string(), encode_value(&b64u_encode(sfn.as_bytes()))),
    ];
    if ext.is_some_and(|e| e > 0) {
        pairs.push(("x".to_string(), ext.unwrap_or_default().to_string()));
    }
    for (key, value) in extra {
        pairs.push((encode_value(key), encode_value(value)));
    }

    let query = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");

    Ok(format!("{scheme}://{authority}{path}?{query}"))
}
