//! Header sanity checks.
//!
//! Rejects requests with malformed headers:
//! - missing, placeholder, short or non-printable User-Agent
//! - Accept header outside the plain media-range charset
//!
//! Also strips incidental query strings with a permanent redirect.

use super::{Next, Stage};
use crate::request::{Request, Response};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::info;

/// Anything outside lowercase letters, digits and `;=.,/* -+`.
static ACCEPT_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9;=.,/* \-+]").expect("valid regex: accept charset"));

/// Rejects malformed headers and canonicalizes query strings.
pub struct HeaderSanityFilter {
    /// Shortest acceptable User-Agent
    min_user_agent_length: usize,
    /// Paths on which query strings are meaningful
    query_exempt_prefixes: Vec<String>,
}

impl HeaderSanityFilter {
    /// Create a new header filter.
    pub fn new(min_user_agent_length: usize, query_exempt_prefixes: Vec<String>) -> Self {
        Self {
            min_user_agent_length,
            query_exempt_prefixes,
        }
    }

    /// Whether a User-Agent value is acceptable.
    pub fn user_agent_ok(&self, ua: &str) -> bool {
        !(ua.is_empty()
            || ua == "-"
            || ua.len() < self.min_user_agent_length
            || ua.bytes().any(|b| !(0x20..=0x7e).contains(&b)))
    }

    /// Whether an Accept value is acceptable.
    pub fn accept_ok(accept: &str) -> bool {
        !ACCEPT_DISALLOWED.is_match(accept)
    }

    fn query_exempt(&self, path: &str) -> bool {
        self.query_exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

impl Default for HeaderSanityFilter {
    fn default() -> Self {
        Self::new(11, vec!["/order/".to_string()])
    }
}

#[async_trait]
impl Stage for HeaderSanityFilter {
    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        if request.is_allowed_bot() {
            return next.run(request).await;
        }

        let ua = request.user_agent().unwrap_or_default();
        if !self.user_agent_ok(ua) {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                user_agent = ?ua,
                "Bad User-Agent header rejected"
            );
            return Response::text(400, "Bad request headers");
        }

        let accept = request.header("accept").unwrap_or_default();
        if !Self::accept_ok(accept) {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                accept = ?accept,
                user_agent = %ua,
                "Bad Accept header rejected"
            );
            return Response::text(400, "Bad request headers");
        }

        let has_query = request.query.as_deref().is_some_and(|q| !q.is_empty());
        if has_query && !self.query_exempt(&request.path) {
            return Response::redirect(301, request.path.clone());
        }

        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "header_sanity_filter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{run_stage, RecordingEndpoint};

    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    fn request(path: &str, ua: Option<&str>, accept: Option<&str>) -> Request {
        let mut builder = Request::builder("GET", path, "198.51.100.30".parse().unwrap());
        if let Some(ua) = ua {
            builder = builder.user_agent(ua);
        }
        if let Some(accept) = accept {
            builder = builder.header("accept", accept);
        }
        builder.build()
    }

    #[test]
    fn test_user_agent_rules() {
        let filter = HeaderSanityFilter::default();
        assert!(filter.user_agent_ok(FIREFOX));
        assert!(filter.user_agent_ok("Mozilla/5.0"));
        assert!(!filter.user_agent_ok(""));
        assert!(!filter.user_agent_ok("-"));
        assert!(!filter.user_agent_ok("curl/8.4.0"));
        assert!(!filter.user_agent_ok("Mozilla/5.0 \u{00e9}"));
        assert!(!filter.user_agent_ok("Mozilla/5.0\tTab"));
    }

    #[test]
    fn test_accept_rules() {
        assert!(HeaderSanityFilter::accept_ok(""));
        assert!(HeaderSanityFilter::accept_ok("*/*"));
        assert!(HeaderSanityFilter::accept_ok(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
        ));
        assert!(!HeaderSanityFilter::accept_ok("Text/HTML"));
        assert!(!HeaderSanityFilter::accept_ok("text/html<script>"));
        assert!(!HeaderSanityFilter::accept_ok("text/html_x"));
    }

    #[tokio::test]
    async fn test_bad_user_agent_rejected() {
        let endpoint = RecordingEndpoint::default();
        let response =
            run_stage(&HeaderSanityFilter::default(), request("/", Some("-"), None), &endpoint).await;
        assert_eq!(response.status, 400);
        assert_eq!(response.body, "Bad request headers");

        let response =
            run_stage(&HeaderSanityFilter::default(), request("/", None, None), &endpoint).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_bad_accept_rejected() {
        let endpoint = RecordingEndpoint::default();
        let response = run_stage(
            &HeaderSanityFilter::default(),
            request("/", Some(FIREFOX), Some("TEXT/HTML")),
            &endpoint,
        )
        .await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_query_string_canonicalized() {
        let endpoint = RecordingEndpoint::default();
        let response = run_stage(
            &HeaderSanityFilter::default(),
            request("/page?utm_source=feed", Some(FIREFOX), Some("text/html")),
            &endpoint,
        )
        .await;

        assert_eq!(response.status, 301);
        assert_eq!(response.header("Location"), Some("/page"));
        assert!(endpoint.last().is_none());
    }

    #[tokio::test]
    async fn test_exempt_path_keeps_query() {
        let endpoint = RecordingEndpoint::default();
        let response = run_stage(
            &HeaderSanityFilter::default(),
            request("/order/42?step=2", Some(FIREFOX), Some("text/html")),
            &endpoint,
        )
        .await;

        assert_eq!(response.status, 200);
        assert_eq!(endpoint.last().unwrap().query.as_deref(), Some("step=2"));
    }

    #[tokio::test]
    async fn test_allowed_bot_skips() {
        let endpoint = RecordingEndpoint::default();
        let mut req = request("/page?x=1", Some("-"), Some("BAD"));
        req.mark_allowed_bot();

        let response = run_stage(&HeaderSanityFilter::default(), req, &endpoint).await;
        assert_eq!(response.status, 200);
    }
}
