//! Route classification and request forwarding helpers
//!
//! Classification is an ordered first-match rule list rather than nested
//! conditionals: static-asset paths go through a dedicated forwarding path
//! that preserves the backend's declared content type. A single generic
//! proxy rule previously caused asset requests to receive the backend's
//! HTML fallback page instead of the real file.

use axum::http::{HeaderMap, Method};

use crate::session::BackendAddr;

/// How a proxied path is forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// `/static/*`: content-type must come through unmodified
    Static,
    /// Everything else: generic API/app forwarding
    Dynamic,
}

/// Ordered route rules, first match wins
const ROUTE_RULES: &[(&str, RouteClass)] = &[("static", RouteClass::Static)];

/// Classify the backend-relative path (prefix and token already stripped)
pub fn classify(rest: &str) -> RouteClass {
    let rest = rest.trim_start_matches('/');
    for (head, class) in ROUTE_RULES {
        if rest == *head || rest.starts_with(&format!("{head}/")) {
            return *class;
        }
    }
    RouteClass::Dynamic
}

/// Safe methods never count as user activity
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Build the outbound URL: gateway prefix and token stripped, original
/// query preserved, token re-appended as a query parameter
pub fn forward_url(backend: &BackendAddr, rest: &str, query: Option<&str>, token: &str) -> String {
    let rest = rest.trim_start_matches('/');
    let base = format!("http://{}:{}/{}", backend.host, backend.port, rest);
    match query {
        Some(q) if !q.is_empty() => format!("{base}?{q}&token={token}"),
        _ => format!("{base}?token={token}"),
    }
}

/// Headers that must not be forwarded hop to hop
fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "host" | "connection" | "transfer-encoding" | "content-length" | "keep-alive" | "upgrade"
    )
}

/// Copy client headers onto the outbound request, injecting the token as a
/// bearer credential and setting the forwarding headers
///
/// The backend may rely on either the query parameter or the Authorization
/// header depending on how it was invoked, so both carry the token.
pub fn apply_forward_headers(
    mut req: reqwest::RequestBuilder,
    headers: &HeaderMap,
    token: &str,
    client_addr: &str,
    proto: &str,
    backend: &BackendAddr,
) -> reqwest::RequestBuilder {
    for (key, value) in headers.iter() {
        if is_hop_by_hop(key.as_str()) {
            continue;
        }
        // Credential and forwarding headers are set below, not copied
        if matches!(
            key.as_str(),
            "authorization" | "x-forwarded-for" | "x-forwarded-proto"
        ) {
            continue;
        }
        req = req.header(key.as_str(), value.as_bytes().to_vec());
    }

    // Append this hop to an inbound chain from an upstream proxy instead of
    // replacing it
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|chain| !chain.is_empty())
    {
        Some(chain) => format!("{chain}, {client_addr}"),
        None => client_addr.to_string(),
    };

    req.header("Authorization", format!("Bearer {token}"))
        .header("Host", backend.to_string())
        .header("X-Forwarded-For", forwarded_for)
        .header("X-Forwarded-Proto", proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn backend() -> BackendAddr {
        BackendAddr {
            host: "10.0.0.5".to_string(),
            port: 12345,
        }
    }

    #[test]
    fn test_classify_static_vs_dynamic() {
        assert_eq!(classify("static/app.js"), RouteClass::Static);
        assert_eq!(classify("/static/app.js"), RouteClass::Static);
        assert_eq!(classify("static"), RouteClass::Static);
        assert_eq!(classify("api/data"), RouteClass::Dynamic);
        assert_eq!(classify(""), RouteClass::Dynamic);
        // Prefix must be a path segment, not a substring
        assert_eq!(classify("staticfiles/app.js"), RouteClass::Dynamic);
    }

    #[test]
    fn test_forward_url_api_route() {
        assert_eq!(
            forward_url(&backend(), "api/data", None, "T"),
            "http://10.0.0.5:12345/api/data?token=T"
        );
    }

    #[test]
    fn test_forward_url_static_route() {
        assert_eq!(
            forward_url(&backend(), "static/app.js", None, "T"),
            "http://10.0.0.5:12345/static/app.js?token=T"
        );
    }

    #[test]
    fn test_forward_url_preserves_query() {
        assert_eq!(
            forward_url(&backend(), "api/data", Some("page=2"), "T"),
            "http://10.0.0.5:12345/api/data?page=2&token=T"
        );
    }

    #[test]
    fn test_forward_url_root() {
        assert_eq!(
            forward_url(&backend(), "", None, "T"),
            "http://10.0.0.5:12345/?token=T"
        );
    }

    #[test]
    fn test_safe_methods() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::DELETE));
    }

    #[tokio::test]
    async fn test_forward_headers_inject_token_and_strip_hop_by_hop() {
        let client = reqwest::Client::new();
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("authorization", HeaderValue::from_static("Bearer stale"));

        let req = apply_forward_headers(
            client.get("http://10.0.0.5:12345/api/data"),
            &headers,
            "T",
            "192.0.2.1",
            "https",
            &backend(),
        )
        .build()
        .unwrap();

        let out = req.headers();
        assert_eq!(out.get("accept").unwrap(), "application/json");
        assert_eq!(out.get("authorization").unwrap(), "Bearer T");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "192.0.2.1");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
        assert!(out.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_forwarded_for_appends_to_inbound_chain() {
        let client = reqwest::Client::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 198.51.100.2"),
        );
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

        let req = apply_forward_headers(
            client.get("http://10.0.0.5:12345/api/data"),
            &headers,
            "T",
            "192.0.2.1",
            "https",
            &backend(),
        )
        .build()
        .unwrap();

        let out = req.headers();
        assert_eq!(
            out.get("x-forwarded-for").unwrap(),
            "203.0.113.7, 198.51.100.2, 192.0.2.1"
        );
        // Single gateway-owned value, not the inbound one plus ours
        let protos: Vec<_> = out.get_all("x-forwarded-proto").iter().collect();
        assert_eq!(protos, vec!["https"]);
    }
}
