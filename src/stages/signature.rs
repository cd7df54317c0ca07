//! Known-bad client signatures.

use super::{Next, Stage};
use crate::request::{Request, Response};
use async_trait::async_trait;
use regex::RegexSet;
use tracing::info;

/// User-Agent fragments of hostile crawlers, HTTP libraries, scanners and
/// headless browsers. Case-sensitive; `^` anchors a prefix.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    "^WordPress",
    "^WinHTTP",
    "^CRAZYWEBCRAWLER",
    "^okhttp",
    "AhrefsBot",
    "^Twitterbot",
    "^Python-urllib",
    "^python-requests",
    "^amppari",
    "RPT-HTTPClient",
    "OpenHoseBot",
    "^WebTarantula",
    "MSIECrawler",
    "^WeBoX",
    "^WebZIP",
    "^WordChampBot",
    r"^Y!TunnelPro",
    "Snacktory",
    "NetcraftSurveyAgent",
    " Daumoa",
    "^Natasha",
    "linkdexbot",
    "sqlmap",
    "PhantomJS",
    "MJ12bot",
    "TelegramBot",
    "SeznamBot",
    "coccocbot-web",
    "admantx-",
    "^SentiBot",
    "Qwantify",
    "^WNMCrawler",
    "Headless",
    "(?i)nikto",
    "(?i)nessus",
    "(?i)masscan",
    "(?i)zgrab",
    "(?i)gobuster",
    "(?i)nuclei",
];

/// Rejects requests whose User-Agent matches the deny list.
pub struct SignatureFilter {
    patterns: RegexSet,
}

impl SignatureFilter {
    /// Compile the default deny list plus `extra` patterns.
    pub fn new(extra: &[String]) -> anyhow::Result<Self> {
        let patterns = RegexSet::new(
            DEFAULT_DENY_PATTERNS
                .iter()
                .copied()
                .chain(extra.iter().map(String::as_str)),
        )?;
        Ok(Self { patterns })
    }

    /// First deny pattern the User-Agent matches.
    pub fn matched(&self, ua: &str) -> Option<&str> {
        self.patterns
            .matches(ua)
            .iter()
            .next()
            .map(|i| self.patterns.patterns()[i].as_str())
    }
}

#[async_trait]
impl Stage for SignatureFilter {
    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        if request.is_allowed_bot() {
            return next.run(request).await;
        }

        let ua = request.user_agent().unwrap_or_default();
        if let Some(pattern) = self.matched(ua) {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                user_agent = %ua,
                pattern = %pattern,
                "Bad bot rejected"
            );
            return Response::text(403, "Bad bot rejected");
        }

        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "signature_filter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{run_stage, RecordingEndpoint};

    fn filter() -> SignatureFilter {
        SignatureFilter::new(&[]).unwrap()
    }

    fn request(ua: &str) -> Request {
        Request::builder("GET", "/page", "198.51.100.20".parse().unwrap())
            .user_agent(ua)
            .build()
    }

    #[test]
    fn test_builtin_patterns_compile() {
        for pattern in DEFAULT_DENY_PATTERNS {
            assert!(regex::Regex::new(pattern).is_ok(), "{pattern}");
        }
        assert_eq!(filter().patterns.len(), DEFAULT_DENY_PATTERNS.len());
    }

    #[test]
    fn test_matches() {
        let f = filter();
        assert_eq!(f.matched("sqlmap/1.0"), Some("sqlmap"));
        assert_eq!(f.matched("python-requests/2.31.0"), Some("^python-requests"));
        assert!(f.matched("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) HeadlessChrome/120.0.0.0 Safari/537.36").is_some());
        assert!(f.matched("Mozilla/5.0 (compatible; AhrefsBot/7.0; +http://ahrefs.com/robot/)").is_some());
        assert!(f.matched("Nuclei - Open-source project (github.com/projectdiscovery/nuclei)").is_some());

        // Prefix anchors only match at the start
        assert!(f.matched("Mozilla/5.0 okhttp/4.9").is_none());
        assert!(f.matched("okhttp/4.9.3").is_some());

        assert!(f.matched("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0").is_none());
    }

    #[test]
    fn test_extra_patterns() {
        let f = SignatureFilter::new(&["^EvilCorpCrawler".to_string()]).unwrap();
        assert_eq!(f.matched("EvilCorpCrawler/3"), Some("^EvilCorpCrawler"));
        assert!(SignatureFilter::new(&["(".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_bot() {
        let endpoint = RecordingEndpoint::default();
        let response = run_stage(&filter(), request("sqlmap/1.0"), &endpoint).await;

        assert_eq!(response.status, 403);
        assert_eq!(response.body, "Bad bot rejected");
        assert!(endpoint.last().is_none());
    }

    #[tokio::test]
    async fn test_allowed_bot_skips() {
        let endpoint = RecordingEndpoint::default();
        let mut req = request("sqlmap/1.0");
        req.mark_allowed_bot();

        let response = run_stage(&filter(), req, &endpoint).await;
        assert_eq!(response.status, 200);
    }
}
