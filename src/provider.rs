//! Human verification provider client.

use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure talking to the verification provider.
///
/// Callers treat every variant as a failed verification; the distinction is
/// only for logs.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider answered HTTP {0}")]
    Status(u16),
    #[error("provider response is not a JSON object: {0}")]
    Malformed(String),
}

/// Provider verdict for one submitted challenge response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    /// Whether the provider accepted the response
    pub success: bool,
    /// Error codes reported by the provider
    pub error_codes: Vec<String>,
}

impl VerificationResult {
    /// Parse a provider response body.
    ///
    /// `success` is accepted as boolean `true` or the string `"true"`; any
    /// other value, or its absence, is a rejection.
    pub fn from_json(body: &[u8]) -> Result<Self, VerifyError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(VerifyError::Malformed("top-level value is not an object".to_string()));
        };

        let success = match fields.get("success") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        };

        let error_codes = fields
            .get("error-codes")
            .and_then(Value::as_array)
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            success,
            error_codes,
        })
    }
}

/// Verifies challenge responses submitted by clients.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// Ask the provider whether `response` is a valid solution from `remote_ip`.
    async fn verify(&self, response: &str, remote_ip: IpAddr)
        -> Result<VerificationResult, VerifyError>;
}

/// hCaptcha `siteverify` client.
pub struct HCaptchaVerifier {
    client: reqwest::Client,
    verify_url: String,
    site_key: String,
    secret_key: String,
}

impl HCaptchaVerifier {
    /// Create a client with a bounded request timeout.
    pub fn new(
        verify_url: impl Into<String>,
        site_key: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            verify_url: verify_url.into(),
            site_key: site_key.into(),
            secret_key: secret_key.into(),
        })
    }
}

#[async_trait]
impl CaptchaVerifier for HCaptchaVerifier {
    async fn verify(
        &self,
        response: &str,
        remote_ip: IpAddr,
    ) -> Result<VerificationResult, VerifyError> {
        let remote_ip = remote_ip.to_string();
        let form = [
            ("secret", self.secret_key.as_str()),
            ("response", response),
            ("remoteip", remote_ip.as_str()),
            ("sitekey", self.site_key.as_str()),
        ];

        let reply = self
            .client
            .post(&self.verify_url)
            .form(&form[..])
            .send()
            .await
            .map_err(transport_error)?;

        let status = reply.status();
        if !status.is_success() {
            return Err(VerifyError::Status(status.as_u16()));
        }

        let body = reply.bytes().await.map_err(transport_error)?;
        let result = VerificationResult::from_json(&body)?;
        debug!(
            success = result.success,
            error_codes = ?result.error_codes,
            "Provider verification complete"
        );
        Ok(result)
    }
}

fn transport_error(e: reqwest::Error) -> VerifyError {
    if e.is_timeout() {
        VerifyError::Timeout
    } else {
        VerifyError::Transport(e.to_string())
    }
}
