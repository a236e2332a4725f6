//! Route prefix resolution.

use axum::http::uri::InvalidUri;
use axum::http::Uri;

/// Compute the effective route prefix from `--web.route-prefix` and the
/// path of `--web.external-url`.
///
/// An empty configured prefix falls back to the external URL path. `"/"`
/// means no prefix. Anything else is normalized to start, but not end,
/// with a single `/`.
pub fn resolve_route_prefix(configured: &str, external_url_path: &str) -> String {
    let prefix = if configured.is_empty() {
        external_url_path
    } else {
        configured
    };

    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("/{trimmed}")
}

/// Path component of an external URL. An empty URL has an empty path.
pub fn external_url_path(external_url: &str) -> Result<String, InvalidUri> {
    if external_url.is_empty() {
        return Ok(String::new());
    }
    let uri: Uri = external_url.parse()?;
    Ok(uri.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_falls_back_to_external_path() {
        assert_eq!(resolve_route_prefix("", "/relay"), "/relay");
        assert_eq!(
            resolve_route_prefix("", "/relay/"),
            resolve_route_prefix("/relay/", "/ignored")
        );
    }

    #[test]
    fn configured_prefix_wins() {
        assert_eq!(resolve_route_prefix("/api", "/relay"), "/api");
    }

    #[test]
    fn root_means_no_prefix() {
        assert_eq!(resolve_route_prefix("/", "/relay"), "");
        assert_eq!(resolve_route_prefix("", "/"), "");
        assert_eq!(resolve_route_prefix("", ""), "");
    }

    #[test]
    fn normalizes_slashes() {
        assert_eq!(resolve_route_prefix("foo/", ""), "/foo");
        assert_eq!(resolve_route_prefix("foo", ""), "/foo");
        assert_eq!(resolve_route_prefix("//foo/bar//", ""), "/foo/bar");
        assert_eq!(resolve_route_prefix("//", ""), "");
    }

    #[test]
    fn fallback_matches_configured_for_many_paths() {
        for path in ["/", "/a", "/a/", "a/b", "/a/b/"] {
            assert_eq!(
                resolve_route_prefix("", path),
                resolve_route_prefix(path, "/anything"),
                "path {path:?}"
            );
        }
    }

    #[test]
    fn external_url_paths() {
        assert_eq!(external_url_path("").unwrap(), "");
        assert_eq!(
            external_url_path("https://example.com/relay/").unwrap(),
            "/relay/"
        );
        assert_eq!(
            resolve_route_prefix("", &external_url_path("http://example.com").unwrap()),
            ""
        );
        assert!(external_url_path("http://exa mple.com").is_err());
    }
}
