//! Forward-confirmed reverse DNS.
//!
//! A claimed crawler is genuine only when its address reverse-resolves to a
//! hostname under the operator's domain and that hostname resolves back to
//! the same address.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup failure.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Resolver used by crawler verification.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Reverse-resolve an address. An empty list means no PTR record.
    async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, DnsError>;

    /// Forward-resolve a hostname to its addresses.
    async fn forward(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Resolver backed by the system configuration via trust-dns.
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    /// Create a resolver with a per-query timeout and no retries.
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Self { resolver }
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(names) => Ok(names.iter().map(|name| name.to_string()).collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(vec![]),
            Err(e) => Err(DnsError::Lookup(e.to_string())),
        }
    }

    async fn forward(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(ips) => Ok(ips.iter().collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(vec![]),
            Err(e) => Err(DnsError::Lookup(e.to_string())),
        }
    }
}

/// Fixed PTR and A/AAAA tables, for tests and air-gapped setups.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    ptr: HashMap<IpAddr, Vec<String>>,
    addrs: HashMap<String, Vec<IpAddr>>,
    failing: bool,
}

impl StaticResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PTR record.
    pub fn with_ptr(mut self, ip: IpAddr, host: &str) -> Self {
        self.ptr.entry(ip).or_default().push(host.to_string());
        self
    }

    /// Add an address record.
    pub fn with_addr(mut self, host: &str, ip: IpAddr) -> Self {
        self.addrs
            .entry(host.to_lowercase())
            .or_default()
            .push(ip);
        self
    }

    /// Make every lookup fail.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        if self.failing {
            return Err(DnsError::Lookup("SERVFAIL".to_string()));
        }
        Ok(self.ptr.get(&ip).cloned().unwrap_or_default())
    }

    async fn forward(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if self.failing {
            return Err(DnsError::Lookup("SERVFAIL".to_string()));
        }
        Ok(self
            .addrs
            .get(&host.to_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

/// Outcome of forward-confirmed reverse DNS.
#[derive(Debug)]
pub enum Confirmation {
    /// Hostname verified in both directions
    Confirmed(String),
    /// Address has no PTR record
    NoPtr,
    /// No PTR hostname is under the required domain
    HostMismatch(Vec<String>),
    /// Hostname does not resolve back to the address
    ForwardMismatch(String),
    /// A lookup errored or timed out
    Failed(DnsError),
}

impl Confirmation {
    /// Whether the identity was confirmed.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Confirmation::Confirmed(_))
    }
}

/// Run forward-confirmed reverse DNS for `ip` against `host_pattern`.
///
/// `host_pattern` is matched against the lowercased hostname with the
/// trailing root dot removed. Each lookup is bounded by `timeout`.
pub async fn forward_confirm(
    resolver: &dyn DnsResolver,
    ip: IpAddr,
    host_pattern: &Regex,
    timeout: Duration,
) -> Confirmation {
    let names = match tokio::time::timeout(timeout, resolver.reverse(ip)).await {
        Ok(Ok(names)) => names,
        Ok(Err(e)) => return Confirmation::Failed(e),
        Err(_) => return Confirmation::Failed(DnsError::Timeout(timeout)),
    };

    let ip_literal = ip.to_string();
    let hosts: Vec<String> = names
        .iter()
        .map(|n| n.trim_end_matches('.').to_lowercase())
        .filter(|h| !h.is_empty() && *h != ip_literal)
        .collect();
    if hosts.is_empty() {
        return Confirmation::NoPtr;
    }

    let Some(host) = hosts.iter().find(|h| host_pattern.is_match(h)) else {
        return Confirmation::HostMismatch(hosts);
    };

    match tokio::time::timeout(timeout, resolver.forward(host)).await {
        Ok(Ok(addrs)) if addrs.contains(&ip) => Confirmation::Confirmed(host.clone()),
        Ok(Ok(_)) => Confirmation::ForwardMismatch(host.clone()),
        Ok(Err(e)) => Confirmation::Failed(e),
        Err(_) => Confirmation::Failed(DnsError::Timeout(timeout)),
    }
}
