//! Transport protocol gate.

use super::{Next, Stage};
use crate::request::{Request, Response};
use async_trait::async_trait;
use tracing::info;

/// Rejects encrypted requests on obsolete HTTP or TLS versions.
pub struct ProtocolGate {
    /// Application protocol required over TLS
    expected_protocol: String,
    /// Rejected TLS versions
    deprecated_tls_versions: Vec<String>,
}

impl ProtocolGate {
    /// Create a new protocol gate.
    pub fn new(expected_protocol: impl Into<String>, deprecated_tls_versions: Vec<String>) -> Self {
        Self {
            expected_protocol: expected_protocol.into(),
            deprecated_tls_versions,
        }
    }
}

#[async_trait]
impl Stage for ProtocolGate {
    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        if request.is_allowed_bot() || !request.is_secure() {
            return next.run(request).await;
        }

        if request.protocol != self.expected_protocol {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                protocol = %request.protocol,
                "Wrong protocol rejected"
            );
            return Response::text(505, "Bad HTTP protocol version");
        }

        let tls = request.tls_version.as_deref().unwrap_or("??");
        if self.deprecated_tls_versions.iter().any(|v| v == tls) {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                tls_version = %tls,
                "Old TLS version rejected"
            );
            return Response::text(505, "Bad TLS version");
        }

        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "protocol_gate"
    }
}
