//! Endpoint URL handling shared by the HTTP-based channels.

use anyhow::{bail, Context, Result};
use url::Url;

/// Parses a channel endpoint, falling back to `fallback` when `raw` is blank.
///
/// The endpoint must carry both a scheme and a host.
pub fn parse_endpoint(name: &str, raw: &str, fallback: &str) -> Result<Url> {
    let mut endpoint = raw.trim();
    if endpoint.is_empty() {
        endpoint = fallback.trim();
    }
    if endpoint.is_empty() {
        bail!("{} endpoint is required", name);
    }
    let parsed =
        Url::parse(endpoint).with_context(|| format!("parsing {} endpoint", name))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        bail!("{} endpoint must include scheme and host", name);
    }
    Ok(parsed)
}

/// Ensures the endpoint path ends with `segment`, appending it if missing.
pub fn ensure_endpoint_path(url: &mut Url, segment: &str) {
    let trimmed = url.path().trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        url.set_path(&format!("/{}", segment));
    } else if trimmed.ends_with(&format!("/{}", segment)) {
        url.set_path(&trimmed);
    } else {
        url.set_path(&format!("{}/{}", trimmed, segment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_uses_fallback() {
        let url = parse_endpoint("bark", "  ", "https://api.day.app").unwrap();
        assert_eq!(url.as_str(), "https://api.day.app/");
    }

    #[test]
    fn test_parse_endpoint_requires_value() {
        let err = parse_endpoint("gotify", "", "").unwrap_err();
        assert_eq!(err.to_string(), "gotify endpoint is required");
    }

    #[test]
    fn test_parse_endpoint_requires_host() {
        assert!(parse_endpoint("http", "not a url", "").is_err());
        let err = parse_endpoint("http", "mailto:someone@example.com", "").unwrap_err();
        assert_eq!(err.to_string(), "http endpoint must include scheme and host");
    }

    #[test]
    fn test_ensure_endpoint_path() {
        let mut url = Url::parse("https://push.example.com").unwrap();
        ensure_endpoint_path(&mut url, "push");
        assert_eq!(url.path(), "/push");

        let mut url = Url::parse("https://push.example.com/base/").unwrap();
        ensure_endpoint_path(&mut url, "push");
        assert_eq!(url.path(), "/base/push");

        let mut url = Url::parse("https://push.example.com/base/push/").unwrap();
        ensure_endpoint_path(&mut url, "push");
        assert_eq!(url.path(), "/base/push");
    }
}
