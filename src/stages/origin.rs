//! Origin proof cookie gate.
//!
//! Clients must return an address-bound token in a cookie before anything
//! expensive runs. A missing or wrong token is answered with a redirect that
//! sets the correct one, so every client pays a full round trip first.

use super::{Next, Stage};
use crate::request::{Request, Response};
use crate::token::OriginTokenIssuer;
use async_trait::async_trait;
use tracing::debug;

/// Enforces the origin proof cookie on non-crawler traffic.
pub struct OriginProofGate {
    issuer: OriginTokenIssuer,
    /// Cookie name for the token
    cookie_name: String,
    /// Cookie lifetime in seconds
    max_age_seconds: u64,
}

impl OriginProofGate {
    /// Create a new gate.
    pub fn new(
        issuer: OriginTokenIssuer,
        cookie_name: impl Into<String>,
        max_age_seconds: u64,
    ) -> Self {
        Self {
            issuer,
            cookie_name: cookie_name.into(),
            max_age_seconds,
        }
    }

    /// Build the `Set-Cookie` value carrying `token`.
    pub fn set_cookie_value(&self, token: &str, secure: bool) -> String {
        let mut cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie_name, token, self.max_age_seconds
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[async_trait]
impl Stage for OriginProofGate {
    async fn handle(&self, mut request: Request, next: Next<'_>) -> Response {
        if request.is_allowed_bot() {
            return next.run(request).await;
        }

        let presented = request.cookie(&self.cookie_name).unwrap_or_default();
        if !self.issuer.verify(request.client_ip, presented) {
            debug!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                had_cookie = !presented.is_empty(),
                "Origin proof missing or stale, reissuing"
            );
            let token = self.issuer.token_for(request.client_ip);
            return Response::redirect(307, request.uri())
                .with_header("Set-Cookie", self.set_cookie_value(&token, request.is_secure()));
        }

        let token = presented.to_string();
        request.set_request_token(token);
        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "origin_proof_gate"
    }
}
