//! HTTP method gate.

use super::{Next, Stage};
use crate::request::{Request, Response};
use async_trait::async_trait;
use tracing::info;

/// Restricts requests to read-only methods, whatever the client is.
pub struct MethodGate {
    /// Allowed methods (uppercase)
    allowed: Vec<String>,
    /// Paths that additionally accept `POST` submissions
    submission_paths: Vec<String>,
}

impl MethodGate {
    /// Create a new method gate.
    pub fn new(allowed: Vec<String>, submission_paths: Vec<String>) -> Self {
        Self {
            allowed: allowed.iter().map(|m| m.to_uppercase()).collect(),
            submission_paths,
        }
    }

    /// Whether `method` is admitted on `path`.
    pub fn admits(&self, method: &str, path: &str) -> bool {
        self.allowed.iter().any(|m| m == method)
            || (method == "POST" && self.submission_paths.iter().any(|p| p == path))
    }

    /// Rejection body: reason, NUL, then the allowed list for the HTTP layer.
    pub fn rejection_body(&self) -> String {
        format!("Request method is not allowed.\0{}", self.allowed.join(", "))
    }
}

impl Default for MethodGate {
    fn default() -> Self {
        Self::new(
            vec!["GET".to_string(), "HEAD".to_string()],
            vec!["/api/captcha-verify".to_string()],
        )
    }
}

#[async_trait]
impl Stage for MethodGate {
    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        if !self.admits(&request.method, &request.path) {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                method = %request.method,
                path = %request.path,
                "Method rejected"
            );
            return Response::text(405, self.rejection_body());
        }

        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "method_gate"
    }
}
