//! Validation stages.
//!
//! Each stage either answers the request itself or hands it to the rest of
//! the chain through [`Next`].

pub mod challenge;
pub mod crawler;
pub mod headers;
pub mod method;
pub mod origin;
pub mod protocol;
pub mod signature;

pub use challenge::ChallengeGate;
pub use crawler::{CrawlerSignature, CrawlerVerifier};
pub use headers::HeaderSanityFilter;
pub use method::MethodGate;
pub use origin::OriginProofGate;
pub use protocol::ProtocolGate;
pub use signature::SignatureFilter;

use crate::request::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// One link of the admission chain.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Answer the request or forward it with `next.run(request)`.
    async fn handle(&self, request: Request, next: Next<'_>) -> Response;

    /// Get the stage name.
    fn name(&self) -> &'static str;
}

/// The protected application behind the chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Serve an admitted request.
    async fn handle(&self, request: Request) -> Response;
}

/// Remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Create a chain over `stages` ending in `endpoint`.
    pub fn new(stages: &'a [Arc<dyn Stage>], endpoint: &'a dyn Endpoint) -> Self {
        Self { stages, endpoint }
    }

    /// Run the next stage, or the endpoint once every stage forwarded.
    pub async fn run(self, request: Request) -> Response {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    endpoint: self.endpoint,
                };
                stage.handle(request, next).await
            }
            None => self.endpoint.handle(request).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Endpoint that answers 200 and keeps the last request it saw.
    #[derive(Default)]
    pub struct RecordingEndpoint {
        pub seen: Mutex<Option<Request>>,
    }

    impl RecordingEndpoint {
        pub fn last(&self) -> Option<Request> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        async fn handle(&self, request: Request) -> Response {
            *self.seen.lock().unwrap() = Some(request);
            Response::text(200, "OK")
        }
    }

    /// Run a single stage in front of `endpoint`.
    pub async fn run_stage(
        stage: &dyn Stage,
        request: Request,
        endpoint: &RecordingEndpoint,
    ) -> Response {
        stage.handle(request, Next::new(&[], endpoint)).await
    }
}
