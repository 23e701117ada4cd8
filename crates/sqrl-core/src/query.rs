//! Query-string manipulation used when resolving the `qry` field into the
//! next nut's login URL and when reporting side-channel URLs (`can`).
//!
//! SQRL query strings are frequently relative (a bare path such as
//! `/sqrl?nut=...`), so these helpers parse against a fixed placeholder
//! base rather than requiring an absolute URL.

use url::Url;

const PLACEHOLDER_BASE: &str = "sqrl-internal://placeholder";

fn to_absolute(raw: &str) -> (bool, String) {
    if raw.contains("://") {
        (true, raw.to_string())
    } else if let Some(rest) = raw.strip_prefix('/') {
        (false, format!("{PLACEHOLDER_BASE}/{rest}"))
    } else {
        (false, format!("{PLACEHOLDER_BASE}/{raw}"))
    }
}

fn parse(raw: &str) -> (bool, Url) {
    let (was_absolute, absolute) = to_absolute(raw);
    // The placeholder base is a fixed, well-formed URL; only caller-supplied
    // paths can make parsing fail, and those are passed through verbatim by
    // the stdlib parser rather than rejected.
    let url = Url::parse(&absolute).unwrap_or_else(|_| {
        Url::parse(PLACEHOLDER_BASE).expect("placeholder base is well-formed")
    });
    (was_absolute, url)
}

fn rebuild(was_absolute: bool, url: &Url) -> String {
    if was_absolute {
        let mut out = String::new();
        out.push_str(url.scheme());
        out.push_str("://");
        out.push_str(url.host_str().unwrap_or_default());
        if let Some(port) = url.port() {
            out.push(':');
            out.push_str(&port.to_string());
        }
        out.push_str(url.path());
        if let Some(q) = url.query() {
            out.push('?');
            out.push_str(q);
        }
        if let Some(f) = url.fragment() {
            out.push('#');
            out.push_str(f);
        }
        out
    } else {
        let mut out = url.path().to_string();
        if let Some(q) = url.query() {
            out.push('?');
            out.push_str(q);
        }
        if let Some(f) = url.fragment() {
            out.push('#');
            out.push_str(f);
        }
        out
    }
}

/// Removes scheme and authority from a URL, leaving `path[?query][#fragment]`.
///
/// Used for the `can` side-channel, which must never leak the server's
/// own hostname back to the client.
#[must_use]
pub fn stripurl(raw: &str) -> String {
    let (_, url) = parse(raw);
    rebuild(false, &url)
}

/// Overwrites or inserts query parameters, then returns the query string
/// sorted lexicographically by key (matching the canonical nut-URL
/// ordering requirement).
#[must_use]
pub fn addquery(raw: &str, params: &[(String, String)]) -> String {
    let (was_absolute, mut url) = parse(raw);

    let mut merged: Vec<(String, String)> =
        url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    for (key, value) in params {
        if let Some(existing) = merged.iter_mut().find(|(k, _)| k == key) {
            existing.1.clone_from(value);
        } else {
            merged.push((key.clone(), value.clone()));
        }
    }
    merged.sort_by(|a, b| a.0.cmp(&b.0));

    if merged.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&merged);
    }
    rebuild(was_absolute, &url)
}

/// Removes the named query parameters, keeping the rest sorted
/// lexicographically by key.
#[must_use]
pub fn delquery(raw: &str, names: &[&str]) -> String {
    let (was_absolute, mut url) = parse(raw);

    let mut kept: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !names.contains(&k.as_str()))
        .collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0));

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }
    rebuild(was_absolute, &url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripurl_removes_scheme_and_host() {
        assert_eq!(stripurl("https://example.com/sqrl?nut=abc"), "/sqrl?nut=abc");
    }

    #[test]
    fn stripurl_is_noop_on_relative_path() {
        assert_eq!(stripurl("/sqrl?nut=abc"), "/sqrl?nut=abc");
    }

    #[test]
    fn addquery_overwrites_existing_param() {
        let out = addquery("/sqrl?nut=old&x=1", &[("nut".to_string(), "new".to_string())]);
        assert_eq!(out, "/sqrl?nut=new&x=1");
    }

    #[test]
    fn addquery_inserts_and_sorts() {
        let out = addquery("/sqrl?zeta=1", &[("alpha".to_string(), "2".to_string())]);
        assert_eq!(out, "/sqrl?alpha=2&zeta=1");
    }

    #[test]
    fn addquery_preserves_absolute_authority() {
        let out = addquery("https://example.com/sqrl?nut=old", &[("nut".to_string(), "new".to_string())]);
        assert_eq!(out, "https://example.com/sqrl?nut=new");
    }

    #[test]
    fn delquery_removes_named_param() {
        let out = delquery("/sqrl?nut=abc&x=1", &["x"]);
        assert_eq!(out, "/sqrl?nut=abc");
    }

    #[test]
    fn delquery_leaves_empty_query_absent() {
        let out = delquery("/sqrl?nut=abc", &["nut"]);
        assert_eq!(out, "/sqrl");
    }
}
