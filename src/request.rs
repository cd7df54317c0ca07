//! Request and response values flowing through the pipeline.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Facts derived by earlier stages.
///
/// Attributes only ever move from unset to set while a request is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttributes {
    /// Client is a crawler whose identity was confirmed via DNS
    pub allowed_bot: bool,
    /// Origin proof token presented by the client
    pub request_token: Option<String>,
    /// Client just passed human verification
    pub challenge_pass: bool,
}

/// Incoming request as seen by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method (uppercase)
    #[serde(deserialize_with = "uppercase")]
    pub method: String,
    /// URI scheme (`http` or `https`)
    pub scheme: String,
    /// Request path
    pub path: String,
    /// Raw query string without the leading `?`
    #[serde(default)]
    pub query: Option<String>,
    /// Request headers (lowercase keys)
    #[serde(default, deserialize_with = "lowercase_keys")]
    pub headers: HashMap<String, Vec<String>>,
    /// Cookies sent by the client
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    /// Form-encoded body parameters
    #[serde(default)]
    pub body_params: HashMap<String, String>,
    /// Client IP address
    pub client_ip: IpAddr,
    /// Negotiated application protocol (e.g. `HTTP/2.0`)
    #[serde(default)]
    pub protocol: String,
    /// Negotiated TLS version (e.g. `TLSv1.3`)
    #[serde(default)]
    pub tls_version: Option<String>,
    /// Correlation ID for the request
    #[serde(default)]
    pub correlation_id: String,
    #[serde(skip)]
    attributes: RequestAttributes,
}

fn uppercase<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(String::deserialize(deserializer)?.to_uppercase())
}

/// Header names differing only in case are merged, values kept in order.
fn lowercase_keys<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, Vec<String>>, D::Error> {
    let raw = HashMap::<String, Vec<String>>::deserialize(deserializer)?;
    let mut headers: HashMap<String, Vec<String>> = HashMap::with_capacity(raw.len());
    for (name, values) in raw {
        headers.entry(name.to_lowercase()).or_default().extend(values);
    }
    Ok(headers)
}

impl Request {
    /// Start building a request from a method, path and client address.
    pub fn builder(method: &str, path: &str, client_ip: IpAddr) -> RequestBuilder {
        RequestBuilder::new(method, path, client_ip)
    }

    /// Get a single header value (first if multiple).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Get the User-Agent header.
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Get a cookie value.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|s| s.as_str())
    }

    /// Get a body parameter.
    pub fn body_param(&self, name: &str) -> Option<&str> {
        self.body_params.get(name).map(|s| s.as_str())
    }

    /// Whether the request arrived over an encrypted connection.
    pub fn is_secure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("https")
    }

    /// Whether the method only retrieves.
    pub fn is_read_only(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "HEAD")
    }

    /// Path plus query string, as the client requested it.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Derived facts set so far.
    pub fn attributes(&self) -> &RequestAttributes {
        &self.attributes
    }

    /// Mark the client as a DNS-verified crawler.
    pub fn mark_allowed_bot(&mut self) {
        self.attributes.allowed_bot = true;
    }

    /// Record the origin proof token. An already recorded token is kept.
    pub fn set_request_token(&mut self, token: impl Into<String>) {
        if self.attributes.request_token.is_none() {
            self.attributes.request_token = Some(token.into());
        }
    }

    /// Mark that the client passed human verification on this request.
    pub fn mark_challenge_pass(&mut self) {
        self.attributes.challenge_pass = true;
    }

    /// Whether a verified crawler made this request.
    pub fn is_allowed_bot(&self) -> bool {
        self.attributes.allowed_bot
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    fn new(method: &str, path: &str, client_ip: IpAddr) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path.to_string(), None),
        };
        Self {
            request: Request {
                method: method.to_uppercase(),
                scheme: "https".to_string(),
                path,
                query,
                headers: HashMap::new(),
                cookies: HashMap::new(),
                body_params: HashMap::new(),
                client_ip,
                protocol: "HTTP/2.0".to_string(),
                tls_version: Some("TLSv1.3".to_string()),
                correlation_id: String::new(),
                attributes: RequestAttributes::default(),
            },
        }
    }

    /// Set the URI scheme.
    pub fn scheme(mut self, scheme: &str) -> Self {
        self.request.scheme = scheme.to_string();
        self
    }

    /// Add a header value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.request
            .headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    /// Set the User-Agent header.
    pub fn user_agent(self, ua: &str) -> Self {
        self.header("user-agent", ua)
    }

    /// Add a cookie.
    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.request.cookies.insert(name.to_string(), value.to_string());
        self
    }

    /// Add a body parameter.
    pub fn body_param(mut self, name: &str, value: &str) -> Self {
        self.request
            .body_params
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Set the negotiated application protocol.
    pub fn protocol(mut self, protocol: &str) -> Self {
        self.request.protocol = protocol.to_string();
        self
    }

    /// Set the negotiated TLS version.
    pub fn tls_version(mut self, version: Option<&str>) -> Self {
        self.request.tls_version = version.map(|v| v.to_string());
        self
    }

    /// Set the correlation ID.
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.request.correlation_id = id.to_string();
        self
    }

    /// Finish building.
    pub fn build(self) -> Request {
        self.request
    }
}

/// Terminal response produced by a stage or the protected endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers, in emission order
    pub headers: Vec<(String, String)>,
    /// Plain text body
    pub body: String,
}

impl Response {
    /// Create a plain text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![],
            body: body.into(),
        }
    }

    /// Create an empty redirect response.
    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self::text(status, "").with_header("Location", location)
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Get the first value of a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
