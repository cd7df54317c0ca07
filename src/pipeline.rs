//! Assembly of the admission chain.
//!
//! The chain order is explicit: stages run exactly in the order they were
//! added to the [`PipelineBuilder`], and the endpoint runs last.

use crate::config::ValidatorConfig;
use crate::dns::{DnsResolver, TrustDnsResolver};
use crate::provider::{CaptchaVerifier, HCaptchaVerifier};
use crate::request::{Request, Response};
use crate::stages::challenge::ChallengePolicy;
use crate::stages::{
    ChallengeGate, CrawlerSignature, CrawlerVerifier, Endpoint, HeaderSanityFilter, MethodGate,
    Next, OriginProofGate, ProtocolGate, SignatureFilter, Stage,
};
use crate::store::{IpReputation, MemoryRateStore, RateStore, StaticIpReputation};
use crate::token::OriginTokenIssuer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// An ordered chain of stages in front of an endpoint.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    endpoint: Arc<dyn Endpoint>,
}

impl Pipeline {
    /// Start building a chain in front of `endpoint`.
    pub fn builder(endpoint: Arc<dyn Endpoint>) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            endpoint,
        }
    }

    /// Run a request through every stage.
    pub async fn handle(&self, request: Request) -> Response {
        Next::new(&self.stages, self.endpoint.as_ref())
            .run(request)
            .await
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    endpoint: Arc<dyn Endpoint>,
}

impl PipelineBuilder {
    /// Append a stage after those already added.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Finish the chain; the endpoint runs after the last stage.
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            endpoint: self.endpoint,
        }
    }
}

/// External services the chain depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub dns: Arc<dyn DnsResolver>,
    pub store: Arc<dyn RateStore>,
    pub reputation: Arc<dyn IpReputation>,
    pub verifier: Arc<dyn CaptchaVerifier>,
}

impl Collaborators {
    /// Live adapters described by `config`.
    pub fn from_config(config: &ValidatorConfig) -> anyhow::Result<Self> {
        let dns = TrustDnsResolver::new(Duration::from_millis(config.crawler.dns_timeout_ms));
        let store = MemoryRateStore::new(
            config.store.max_clients,
            Duration::from_secs(config.store.pass_ttl_seconds),
        );
        let reputation = StaticIpReputation::new(config.challenge.known_bot_ranges.as_slice())?;
        let verifier = HCaptchaVerifier::new(
            config.challenge.verify_url.clone(),
            config.secrets.captcha_site_key.clone(),
            config.secrets.captcha_secret_key.clone(),
            Duration::from_millis(config.challenge.provider_timeout_ms),
        )?;

        Ok(Self {
            dns: Arc::new(dns),
            store: Arc::new(store),
            reputation: Arc::new(reputation),
            verifier: Arc::new(verifier),
        })
    }
}

/// The complete request validator.
///
/// Runs crawler verification, origin proof, signature, header, protocol and
/// method checks, then the challenge gate, in that order.
pub struct RequestValidator {
    pipeline: Pipeline,
}

impl RequestValidator {
    /// Build the validator from configuration and explicit collaborators.
    pub fn new(
        config: &ValidatorConfig,
        collaborators: Collaborators,
        endpoint: Arc<dyn Endpoint>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let crawler = CrawlerVerifier::new(
            CrawlerSignature::defaults()?,
            collaborators.dns,
            config.crawler.enabled,
            Duration::from_millis(config.crawler.dns_timeout_ms),
        );
        let origin = OriginProofGate::new(
            OriginTokenIssuer::new(&config.secrets.cookie_pepper),
            config.origin.cookie_name.clone(),
            config.origin.max_age_seconds,
        );
        let signatures = SignatureFilter::new(&config.signatures.extra_patterns)?;
        let headers = HeaderSanityFilter::new(
            config.headers.min_user_agent_length,
            config.headers.query_exempt_prefixes.clone(),
        );
        let protocol = ProtocolGate::new(
            config.protocol.expected_protocol.clone(),
            config.protocol.deprecated_tls_versions.clone(),
        );
        let methods = MethodGate::new(
            config.methods.allowed.clone(),
            config.methods.submission_paths.clone(),
        );
        let challenge = ChallengeGate::new(
            ChallengePolicy::from(&config.challenge),
            collaborators.store,
            collaborators.reputation,
            collaborators.verifier,
        );

        let pipeline = Pipeline::builder(endpoint)
            .stage(crawler)
            .stage(origin)
            .stage(signatures)
            .stage(headers)
            .stage(protocol)
            .stage(methods)
            .stage(challenge)
            .build();

        info!(stages = ?pipeline.stage_names(), "Request validator initialized");

        Ok(Self { pipeline })
    }

    /// Build the validator with live adapters.
    pub fn from_config(config: &ValidatorConfig, endpoint: Arc<dyn Endpoint>) -> anyhow::Result<Self> {
        let collaborators = Collaborators::from_config(config)?;
        Self::new(config, collaborators, endpoint)
    }

    /// Validate a request, forwarding it to the endpoint if admitted.
    pub async fn handle(&self, request: Request) -> Response {
        let correlation_id = request.correlation_id.clone();
        let response = self.pipeline.handle(request).await;
        debug!(
            correlation_id = %correlation_id,
            status = response.status,
            "Request processed"
        );
        response
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }
}
