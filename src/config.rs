//! Configuration types for the request validator.

use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Placeholder pepper shipped in the default configuration.
pub const PLACEHOLDER_PEPPER: &str = "change-me-in-production";

/// Main configuration for the request validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Secrets consumed by the origin proof and challenge stages
    pub secrets: SecretsConfig,

    /// Crawler identity verification
    pub crawler: CrawlerConfig,

    /// Origin proof cookie
    pub origin: OriginConfig,

    /// Deny-list signatures
    pub signatures: SignatureConfig,

    /// Header sanity rules
    pub headers: HeaderConfig,

    /// Transport protocol rules
    pub protocol: ProtocolConfig,

    /// Allowed HTTP methods
    pub methods: MethodConfig,

    /// Human verification gate
    pub challenge: ChallengeConfig,

    /// In-process rate/session store
    pub store: StoreConfig,
}

impl ValidatorConfig {
    /// Load configuration from a JSON or YAML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secrets.cookie_pepper.is_empty() {
            bail!("secrets.cookie_pepper must not be empty");
        }
        if self.secrets.cookie_pepper == PLACEHOLDER_PEPPER {
            bail!("secrets.cookie_pepper is still the shipped placeholder");
        }
        if self.crawler.dns_timeout_ms == 0 {
            bail!("crawler.dns_timeout_ms must be greater than zero");
        }
        if self.challenge.provider_timeout_ms == 0 {
            bail!("challenge.provider_timeout_ms must be greater than zero");
        }
        if self.methods.allowed.is_empty() {
            bail!("methods.allowed must list at least one method");
        }
        for pattern in &self.signatures.extra_patterns {
            Regex::new(pattern).with_context(|| format!("invalid deny pattern {pattern:?}"))?;
        }
        for range in &self.challenge.known_bot_ranges {
            range
                .parse::<ipnet::IpNet>()
                .with_context(|| format!("invalid CIDR range {range:?}"))?;
        }
        Ok(())
    }
}

/// Secrets sourced from the deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Pepper mixed into the origin proof token
    pub cookie_pepper: String,

    /// Public site key of the verification provider
    pub captcha_site_key: String,

    /// Secret key of the verification provider
    pub captcha_secret_key: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            cookie_pepper: PLACEHOLDER_PEPPER.to_string(),
            captcha_site_key: String::new(),
            captcha_secret_key: String::new(),
        }
    }
}

/// Crawler verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Admit crawlers whose identity forward-confirmed reverse DNS proves;
    /// when off, claimed crawlers are treated as ordinary traffic
    pub enabled: bool,

    /// Timeout for each DNS lookup in milliseconds
    pub dns_timeout_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dns_timeout_ms: 300,
        }
    }
}

/// Origin proof cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Cookie carrying the origin proof token
    pub cookie_name: String,

    /// Cookie lifetime in seconds
    pub max_age_seconds: u64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            cookie_name: "request_key".to_string(),
            max_age_seconds: 86_400,
        }
    }
}

/// Deny-list settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Additional user-agent regexes to reject
    pub extra_patterns: Vec<String>,
}

/// Header sanity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Shortest acceptable User-Agent
    pub min_user_agent_length: usize,

    /// Path prefixes on which query strings are kept
    pub query_exempt_prefixes: Vec<String>,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            min_user_agent_length: 11,
            query_exempt_prefixes: vec!["/order/".to_string()],
        }
    }
}

/// Transport protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Application protocol required on encrypted connections
    pub expected_protocol: String,

    /// TLS versions rejected on encrypted connections
    pub deprecated_tls_versions: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            expected_protocol: "HTTP/2.0".to_string(),
            deprecated_tls_versions: ["SSLv2", "SSLv3", "TLSv1", "TLSv1.1", "TLSv1.2"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

/// Method restriction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    /// Methods admitted on ordinary paths
    pub allowed: Vec<String>,

    /// Paths that additionally accept `POST` (challenge submissions)
    pub submission_paths: Vec<String>,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            allowed: vec!["GET".to_string(), "HEAD".to_string()],
            submission_paths: vec![DEFAULT_VERIFY_PATH.to_string()],
        }
    }
}

const DEFAULT_VERIFY_PATH: &str = "/api/captcha-verify";

/// Human verification gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Endpoint receiving challenge submissions
    pub verify_path: String,

    /// Body field carrying the client's challenge response
    pub response_field: String,

    /// Provider verification endpoint
    pub verify_url: String,

    /// Timeout for the provider call in milliseconds
    pub provider_timeout_ms: u64,

    /// A pass younger than this skips the gate entirely
    pub pass_grace_seconds: u64,

    /// A pass older than this makes the daily threshold apply
    pub daily_pass_age_seconds: u64,

    /// Requests per hour before challenging
    pub hourly_threshold: u64,

    /// Requests per day before challenging
    pub daily_threshold: u64,

    /// Known proxy or bot ranges (CIDR notation)
    pub known_bot_ranges: Vec<String>,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            verify_path: DEFAULT_VERIFY_PATH.to_string(),
            response_field: "h-captcha-response".to_string(),
            verify_url: "https://hcaptcha.com/siteverify".to_string(),
            provider_timeout_ms: 500,
            pass_grace_seconds: 14 * 3600,
            daily_pass_age_seconds: 24 * 3600,
            hourly_threshold: 150,
            daily_threshold: 1200,
            known_bot_ranges: vec![],
        }
    }
}

/// In-process store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum client addresses tracked
    pub max_clients: usize,

    /// How long a challenge pass is remembered
    pub pass_ttl_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_clients: 100_000,
            pass_ttl_seconds: 25 * 3600,
        }
    }
}
