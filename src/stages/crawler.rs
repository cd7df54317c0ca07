//! Search-engine crawler verification.
//!
//! Identifies requests claiming to come from a known crawler operator and
//! confirms the claim with forward-confirmed reverse DNS:
//! - exact User-Agent strings and evergreen patterns per operator
//! - PTR hostname under the operator's domain
//! - hostname resolving back to the client address

use super::{Next, Stage};
use crate::dns::{forward_confirm, Confirmation, DnsResolver};
use crate::request::{Request, Response};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identity of one crawler operator.
pub struct CrawlerSignature {
    /// Operator's crawler name (e.g., "Googlebot")
    pub name: String,
    /// User-Agent strings matched exactly
    pub exact_agents: HashSet<String>,
    /// User-Agent patterns
    pub agent_patterns: Vec<Regex>,
    /// Pattern the reverse DNS hostname must match
    pub host_pattern: Regex,
}

impl CrawlerSignature {
    /// Compile a signature.
    pub fn new(
        name: impl Into<String>,
        exact_agents: &[&str],
        agent_patterns: &[&str],
        host_pattern: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.into(),
            exact_agents: exact_agents.iter().map(|s| s.to_string()).collect(),
            agent_patterns: agent_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            host_pattern: Regex::new(host_pattern)?,
        })
    }

    /// Whether the User-Agent claims this operator.
    pub fn claims(&self, ua: &str) -> bool {
        self.exact_agents.contains(ua) || self.agent_patterns.iter().any(|p| p.is_match(ua))
    }

    /// Search-engine A.
    pub fn googlebot() -> anyhow::Result<Self> {
        Self::new(
            "Googlebot",
            &[
                "APIs-Google (+https://developers.google.com/webmasters/APIs-Google.html)",
                "Mediapartners-Google",
                "Mozilla/5.0 (Linux; Android 5.0; SM-G920A) AppleWebKit (KHTML, like Gecko) Chrome Mobile Safari (compatible; AdsBot-Google-Mobile; +http://www.google.com/mobile/adsbot.html)",
                "Mozilla/5.0 (iPhone; CPU iPhone OS 9_1 like Mac OS X) AppleWebKit/601.1.46 (KHTML, like Gecko) Version/9.0 Mobile/13B143 Safari/601.1 (compatible; AdsBot-Google-Mobile; +http://www.google.com/mobile/adsbot.html)",
                "AdsBot-Google (+http://www.google.com/adsbot.html)",
                "Googlebot-Image/1.0",
                "Googlebot-News",
                "Googlebot-Video/1.0",
                "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
                "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; Googlebot/2.1; +http://www.google.com/bot.html) Safari/537.36",
                "Googlebot/2.1 (+http://www.google.com/bot.html)",
                "AdsBot-Google-Mobile-Apps",
                "FeedFetcher-Google; (+http://www.google.com/feedfetcher.html)",
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2272.118 Safari/537.36 (compatible; Google-Read-Aloud; +https://support.google.com/webmasters/answer/1061943)",
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/49.0.2623.75 Safari/537.36 Google Favicon",
                "Mozilla/5.0 (Linux; Android 8.0; Pixel 2 Build/OPD3.170816.012; DuplexWeb-Google/1.0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/74.0.3729.131 Mobile Safari/537.36",
            ],
            &[
                r"^Mozilla/5\.0 AppleWebKit/537\.36 \(KHTML, like Gecko; compatible; Googlebot/2\.1; \+http://www\.google\.com/bot\.html\) Chrome/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ Safari/537\.36$",
                r"^Mozilla/5\.0 \(Linux; Android 6\.0\.1; Nexus 5X Build/MMB29P\) AppleWebKit/537\.36 \(KHTML, like Gecko\) Chrome/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ Mobile Safari/537\.36 \(compatible; Googlebot/2\.1; \+http://www\.google\.com/bot\.html\)$",
                r" \(compatible; Mediapartners-Google/2\.1; \+http://www\.google\.com/bot\.html\)$",
                r" GoogleAdSenseInfeed\)",
            ],
            r"(?i)^.+\.google(bot)?\.com$",
        )
    }

    /// Search-engine B.
    pub fn bingbot() -> anyhow::Result<Self> {
        Self::new(
            "Bingbot",
            &[
                "Mozilla/5.0 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
                "Mozilla/5.0 (compatible; adidxbot/2.0; +http://www.bing.com/bingbot.htm)",
                "Mozilla/5.0 (iPhone; CPU iPhone OS 7_0 like Mac OS X) AppleWebKit/537.51.1 (KHTML, like Gecko) Version/7.0 Mobile/11A465 Safari/9537.53 (compatible; adidxbot/2.0; +http://www.bing.com/bingbot.htm)",
                "Mozilla/5.0 (iPhone; CPU iPhone OS 7_0 like Mac OS X) AppleWebKit/537.51.1 (KHTML, like Gecko) Version/7.0 Mobile/11A465 Safari/9537.53 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
                "Mozilla/5.0 (Windows Phone 8.1; ARM; Trident/7.0; Touch; rv:11.0; IEMobile/11.0; NOKIA; Lumia 530) like Gecko (compatible; adidxbot/2.0; +http://www.bing.com/bingbot.htm)",
                "Mozilla/5.0 (Windows Phone 8.1; ARM; Trident/7.0; Touch; rv:11.0; IEMobile/11.0; NOKIA; Lumia 530) like Gecko (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
                "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/534+ (KHTML, like Gecko) BingPreview/1.0b",
                "Mozilla/5.0 (Windows Phone 8.1; ARM; Trident/7.0; Touch; rv:11.0; IEMobile/11.0; NOKIA; Lumia 530) like Gecko BingPreview/1.0b",
            ],
            &[
                r"^Mozilla/5\.0 AppleWebKit/537\.36 \(KHTML, like Gecko; compatible; bingbot/2\.0; \+http://www\.bing\.com/bingbot\.htm\) Chrome/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ Safari/537\.36$",
                r"^Mozilla/5\.0 AppleWebKit/537\.36 \(KHTML, like Gecko; compatible; bingbot/2\.0; \+http://www\.bing\.com/bingbot\.htm\) Chrome/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ Safari/537\.36 Edg/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+$",
                r"^Mozilla/5\.0 \(Linux; Android 6\.0\.1; Nexus 5X Build/MMB29P\) AppleWebKit/537\.36 \(KHTML, like Gecko\) Chrome/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ Mobile Safari/537\.36 \(compatible; bingbot/2\.0; \+http://www\.bing\.com/bingbot\.htm\)$",
                r"^Mozilla/5\.0 \(Linux; Android 6\.0\.1; Nexus 5X Build/MMB29P\) AppleWebKit/537\.36 \(KHTML, like Gecko\) Chrome/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ Mobile Safari/537\.36 Edg/[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+ \(compatible; bingbot/2\.0; \+http://www\.bing\.com/bingbot\.htm\)$",
            ],
            r"(?i)^.+\.search\.msn\.com$",
        )
    }

    /// Recognized operators in priority order.
    pub fn defaults() -> anyhow::Result<Vec<Self>> {
        Ok(vec![Self::googlebot()?, Self::bingbot()?])
    }
}

/// Classifies claimed crawlers as genuine or spoofed.
pub struct CrawlerVerifier {
    signatures: Vec<CrawlerSignature>,
    resolver: Arc<dyn DnsResolver>,
    /// Recognize crawlers at all; when off, claimed crawlers are ordinary traffic
    enabled: bool,
    /// Timeout for each DNS lookup
    dns_timeout: Duration,
}

impl CrawlerVerifier {
    /// Create a verifier over `signatures`, checked in order.
    pub fn new(
        signatures: Vec<CrawlerSignature>,
        resolver: Arc<dyn DnsResolver>,
        enabled: bool,
        dns_timeout: Duration,
    ) -> Self {
        Self {
            signatures,
            resolver,
            enabled,
            dns_timeout,
        }
    }

    /// First operator whose signature the User-Agent claims.
    pub fn claimed(&self, ua: &str) -> Option<&CrawlerSignature> {
        self.signatures.iter().find(|s| s.claims(ua))
    }
}

#[async_trait]
impl Stage for CrawlerVerifier {
    async fn handle(&self, mut request: Request, next: Next<'_>) -> Response {
        if !self.enabled {
            return next.run(request).await;
        }

        let Some(signature) = request.user_agent().and_then(|ua| self.claimed(ua)) else {
            return next.run(request).await;
        };

        let outcome = forward_confirm(
            self.resolver.as_ref(),
            request.client_ip,
            &signature.host_pattern,
            self.dns_timeout,
        )
        .await;

        match outcome {
            Confirmation::Confirmed(host) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    client_ip = %request.client_ip,
                    crawler = %signature.name,
                    host = %host,
                    "Crawler identity confirmed"
                );
            }
            failed => {
                warn!(
                    correlation_id = %request.correlation_id,
                    client_ip = %request.client_ip,
                    outcome = ?failed,
                    "Fake {} rejected",
                    signature.name
                );
                return Response::text(403, "Fake bot rejected");
            }
        }

        request.mark_allowed_bot();
        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "crawler_verifier"
    }
}
