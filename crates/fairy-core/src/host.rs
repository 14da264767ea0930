//! Host derivation: the coarse partition key for on-disk grouping.
//!
//! The strip-of-`www.`/`m.` rule is intentionally simple and lives only
//! here so changes stay uniform across the engine.

use url::Url;

/// Schemes that never map to a monitored site.
const NOISE_SCHEMES: [&str; 8] = [
    "chrome",
    "chrome-extension",
    "devtools",
    "about",
    "data",
    "blob",
    "edge",
    "edge-extension",
];

/// Derive the registrable-host partition key from a page URL.
///
/// Returns `None` for non-http(s) schemes and browser-internal pages; such
/// targets are not monitored at all. An http(s) URL with an empty or opaque
/// host maps to `"unknown"`.
pub fn derive_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let scheme = parsed.scheme();
    if NOISE_SCHEMES.contains(&scheme) {
        return None;
    }
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
        _ => return Some("unknown".to_string()),
    };

    Some(normalize_host(&host))
}

/// Lowercase and strip one leading `www.` or `m.` label.
pub fn normalize_host(host: &str) -> String {
    if host.is_empty() {
        return "unknown".to_string();
    }
    let host = host.to_ascii_lowercase();
    if let Some(rest) = host.strip_prefix("www.") {
        rest.to_string()
    } else if let Some(rest) = host.strip_prefix("m.") {
        rest.to_string()
    } else {
        host
    }
}

/// Origin string (`scheme://host[:port]`) for storage-quota lookups.
/// Default ports are elided, matching what the browser reports.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let scheme = parsed.scheme();
    let mut origin = format!("{scheme}://{host}");
    if let Some(port) = parsed.port() {
        let default = match scheme {
            "https" => 443,
            "http" => 80,
            _ => 0,
        };
        if port != default {
            origin.push_str(&format!(":{port}"));
        }
    }
    Some(origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_www_and_m_prefixes() {
        assert_eq!(derive_host("https://www.a.test/x").as_deref(), Some("a.test"));
        assert_eq!(derive_host("https://m.b.test/y").as_deref(), Some("b.test"));
        assert_eq!(derive_host("https://Example.com/").as_deref(), Some("example.com"));
    }

    #[test]
    fn does_not_strip_inner_labels() {
        assert_eq!(
            derive_host("https://api.example.com/v1").as_deref(),
            Some("api.example.com")
        );
        // Only one prefix label is removed.
        assert_eq!(
            derive_host("https://www.m.example.com/").as_deref(),
            Some("m.example.com")
        );
    }

    #[test]
    fn rejects_internal_and_non_http_schemes() {
        assert_eq!(derive_host("chrome://settings"), None);
        assert_eq!(derive_host("devtools://devtools/bundled"), None);
        assert_eq!(derive_host("about:blank"), None);
        assert_eq!(derive_host("chrome-extension://abcdef/page.html"), None);
        assert_eq!(derive_host("ftp://files.test/"), None);
        assert_eq!(derive_host("not a url"), None);
    }

    #[test]
    fn origin_elides_default_ports() {
        assert_eq!(
            origin_of("https://example.com:443/x").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            origin_of("http://localhost:8080/x").as_deref(),
            Some("http://localhost:8080")
        );
    }
}
