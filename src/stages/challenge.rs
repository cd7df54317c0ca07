//! Rate-adaptive human verification gate.
//!
//! Handles challenge submissions on the verification endpoint and, for every
//! other request, decides from the client's rate history and reputation
//! whether a challenge must be solved first.

use super::{Next, Stage};
use crate::config::ChallengeConfig;
use crate::provider::{CaptchaVerifier, VerifyError};
use crate::request::{Request, Response};
use crate::store::{IpReputation, RateStore, RateWindow};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const KNOWN_BOT_IP: &str = "Known bot IP";
const HIGH_TRAFFIC: &str = "High traffic from your IP";
const EXPIRED_SESSION: &str = "Expired session";

/// Thresholds deciding when a client must be challenged.
#[derive(Debug, Clone)]
pub struct ChallengePolicy {
    /// Endpoint receiving challenge submissions
    pub verify_path: String,
    /// Body field carrying the challenge response
    pub response_field: String,
    /// A pass younger than this skips the gate
    pub pass_grace: Duration,
    /// A pass older than this makes the daily threshold apply
    pub daily_pass_age: Duration,
    /// Requests per hour before challenging
    pub hourly_threshold: u64,
    /// Requests per day before challenging
    pub daily_threshold: u64,
    /// Upper bound on the provider call
    pub provider_timeout: Duration,
}

impl From<&ChallengeConfig> for ChallengePolicy {
    fn from(config: &ChallengeConfig) -> Self {
        Self {
            verify_path: config.verify_path.clone(),
            response_field: config.response_field.clone(),
            pass_grace: Duration::from_secs(config.pass_grace_seconds),
            daily_pass_age: Duration::from_secs(config.daily_pass_age_seconds),
            hourly_threshold: config.hourly_threshold,
            daily_threshold: config.daily_threshold,
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
        }
    }
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self::from(&ChallengeConfig::default())
    }
}

impl ChallengePolicy {
    /// Whether the counters alone warrant a challenge.
    pub fn is_high_traffic(&self, window: &RateWindow, pass_age: Duration) -> bool {
        window.hourly > self.hourly_threshold
            || (pass_age > self.daily_pass_age && window.daily > self.daily_threshold)
    }
}

/// Interposes human verification for suspicious clients.
pub struct ChallengeGate {
    policy: ChallengePolicy,
    store: Arc<dyn RateStore>,
    reputation: Arc<dyn IpReputation>,
    verifier: Arc<dyn CaptchaVerifier>,
}

impl ChallengeGate {
    /// Create a new challenge gate.
    pub fn new(
        policy: ChallengePolicy,
        store: Arc<dyn RateStore>,
        reputation: Arc<dyn IpReputation>,
        verifier: Arc<dyn CaptchaVerifier>,
    ) -> Self {
        Self {
            policy,
            store,
            reputation,
            verifier,
        }
    }

    fn is_submission(&self, request: &Request) -> bool {
        request.method == "POST" && request.path == self.policy.verify_path
    }

    async fn handle_submission(&self, mut request: Request, next: Next<'_>) -> Response {
        let answer = request
            .body_param(&self.policy.response_field)
            .unwrap_or_default()
            .to_string();
        if answer.is_empty() {
            return Response::text(401, "Missing CAPTCHA response");
        }

        match self.verify(&answer, request.client_ip).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    correlation_id = %request.correlation_id,
                    client_ip = %request.client_ip,
                    "CAPTCHA response rejected by provider"
                );
                return Response::text(403, "Invalid CAPTCHA response");
            }
            Err(e) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    client_ip = %request.client_ip,
                    error = %e,
                    "CAPTCHA verification failed"
                );
                return Response::text(403, "Invalid CAPTCHA response");
            }
        }

        if let Err(e) = self.store.record_challenge_pass(request.client_ip).await {
            warn!(client_ip = %request.client_ip, error = %e, "Failed to record challenge pass");
        }
        request.mark_challenge_pass();
        next.run(request).await
    }

    async fn verify(&self, answer: &str, ip: IpAddr) -> Result<bool, VerifyError> {
        match tokio::time::timeout(self.policy.provider_timeout, self.verifier.verify(answer, ip))
            .await
        {
            Ok(result) => result.map(|r| r.success),
            Err(_) => Err(VerifyError::Timeout),
        }
    }

    /// Reason to challenge the client, if any.
    ///
    /// GETs are counted by the same store call that reads the counters, and
    /// the decision uses the counts from before this request.
    async fn challenge_reason(&self, request: &Request, now: SystemTime) -> Option<&'static str> {
        let count = request.method == "GET";
        let window = match self.store.observe(request.client_ip, count).await {
            Ok(window) => window,
            Err(e) => {
                warn!(client_ip = %request.client_ip, error = %e, "Rate store unavailable, challenging");
                return Some(HIGH_TRAFFIC);
            }
        };

        let pass_age = window.pass_age(now);
        if pass_age < self.policy.pass_grace {
            return None;
        }

        if self.reputation.is_known_proxy_or_bot(request.client_ip).await {
            return Some(KNOWN_BOT_IP);
        }

        if self.policy.is_high_traffic(&window, pass_age) {
            debug!(
                client_ip = %request.client_ip,
                hourly = window.hourly,
                daily = window.daily,
                "Traffic over threshold"
            );
            return Some(HIGH_TRAFFIC);
        }

        None
    }
}

#[async_trait]
impl Stage for ChallengeGate {
    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        if self.is_submission(&request) {
            return self.handle_submission(request, next).await;
        }

        if request.is_allowed_bot() {
            return next.run(request).await;
        }

        if let Some(reason) = self.challenge_reason(&request, SystemTime::now()).await {
            info!(
                correlation_id = %request.correlation_id,
                client_ip = %request.client_ip,
                method = %request.method,
                reason = %reason,
                "Challenging client"
            );
            let body = if request.is_read_only() {
                reason
            } else {
                EXPIRED_SESSION
            };
            return Response::text(401, body);
        }

        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "challenge_gate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::VerificationResult;
    use crate::stages::testing::{run_stage, RecordingEndpoint};
    use crate::store::{MemoryRateStore, StaticIpReputation, StoreError};
    use std::sync::Mutex;

    /// Store returning a fixed window and recording writes.
    #[derive(Default)]
    struct FixedStore {
        window: RateWindow,
        recorded: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl RateStore for FixedStore {
        async fn observe(&self, _ip: IpAddr, count: bool) -> Result<RateWindow, StoreError> {
            if count {
                self.recorded.lock().unwrap().push("request");
            }
            Ok(self.window)
        }

        async fn record_challenge_pass(&self, _ip: IpAddr) -> Result<(), StoreError> {
            self.recorded.lock().unwrap().push("pass");
            Ok(())
        }
    }

    /// In-memory store behind a simulated network round trip.
    struct RemoteStore {
        inner: MemoryRateStore,
    }

    #[async_trait]
    impl RateStore for RemoteStore {
        async fn observe(&self, ip: IpAddr, count: bool) -> Result<RateWindow, StoreError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let window = self.inner.observe(ip, count).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
            window
        }

        async fn record_challenge_pass(&self, ip: IpAddr) -> Result<(), StoreError> {
            self.inner.record_challenge_pass(ip).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl RateStore for BrokenStore {
        async fn observe(&self, _ip: IpAddr, _count: bool) -> Result<RateWindow, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn record_challenge_pass(&self, _ip: IpAddr) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Provider accepting exactly one answer.
    struct ScriptedProvider {
        accept: &'static str,
    }

    #[async_trait]
    impl CaptchaVerifier for ScriptedProvider {
        async fn verify(
            &self,
            response: &str,
            _remote_ip: IpAddr,
        ) -> Result<VerificationResult, VerifyError> {
            Ok(VerificationResult {
                success: response == self.accept,
                error_codes: vec![],
            })
        }
    }

    struct DownProvider;

    #[async_trait]
    impl CaptchaVerifier for DownProvider {
        async fn verify(
            &self,
            _response: &str,
            _remote_ip: IpAddr,
        ) -> Result<VerificationResult, VerifyError> {
            Err(VerifyError::Transport("connection reset".to_string()))
        }
    }

    struct HangingProvider;

    #[async_trait]
    impl CaptchaVerifier for HangingProvider {
        async fn verify(
            &self,
            _response: &str,
            _remote_ip: IpAddr,
        ) -> Result<VerificationResult, VerifyError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(VerificationResult {
                success: true,
                error_codes: vec![],
            })
        }
    }

    fn gate_with(
        store: Arc<dyn RateStore>,
        reputation: StaticIpReputation,
        verifier: Arc<dyn CaptchaVerifier>,
    ) -> ChallengeGate {
        ChallengeGate::new(ChallengePolicy::default(), store, Arc::new(reputation), verifier)
    }

    fn gate(store: Arc<dyn RateStore>) -> ChallengeGate {
        gate_with(
            store,
            StaticIpReputation::default(),
            Arc::new(ScriptedProvider { accept: "good" }),
        )
    }

    fn window(hourly: u64, daily: u64, pass_age: Option<Duration>) -> RateWindow {
        RateWindow {
            hourly,
            daily,
            last_pass: pass_age.map(|age| SystemTime::now() - age),
        }
    }

    fn request(method: &str, path: &str) -> Request {
        Request::builder(method, path, "203.0.113.77".parse().unwrap()).build()
    }

    fn submission(answer: &str) -> Request {
        Request::builder("POST", "/api/captcha-verify", "203.0.113.77".parse().unwrap())
            .body_param("h-captcha-response", answer)
            .build()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_high_traffic_policy() {
        let policy = ChallengePolicy::default();
        assert!(!policy.is_high_traffic(&window(150, 150, None), Duration::MAX));
        assert!(policy.is_high_traffic(&window(151, 151, None), Duration::MAX));
        assert!(policy.is_high_traffic(&window(10, 1201, None), Duration::MAX));
        assert!(!policy.is_high_traffic(&window(10, 1201, None), 20 * HOUR));
        assert!(!policy.is_high_traffic(&window(10, 1200, None), Duration::MAX));
    }

    #[tokio::test]
    async fn test_quiet_client_passes_and_is_counted() {
        let store = Arc::new(FixedStore::default());
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate(store.clone()), request("GET", "/page"), &endpoint).await;

        assert_eq!(response.status, 200);
        assert_eq!(*store.recorded.lock().unwrap(), vec!["request"]);
    }

    #[tokio::test]
    async fn test_head_is_not_counted() {
        let store = Arc::new(FixedStore::default());
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate(store.clone()), request("HEAD", "/page"), &endpoint).await;

        assert_eq!(response.status, 200);
        assert!(store.recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_high_hourly_traffic_challenged() {
        let store = Arc::new(FixedStore {
            window: window(151, 151, None),
            ..Default::default()
        });
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate(store.clone()), request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 401);
        assert_eq!(response.body, "High traffic from your IP");
        // Counted in the same store call as the read
        assert_eq!(*store.recorded.lock().unwrap(), vec!["request"]);

        let response = run_stage(&gate(store), request("POST", "/page"), &endpoint).await;
        assert_eq!(response.status, 401);
        assert_eq!(response.body, "Expired session");
        assert!(endpoint.last().is_none());
    }

    #[tokio::test]
    async fn test_daily_threshold_needs_old_pass() {
        let endpoint = RecordingEndpoint::default();

        let stale = Arc::new(FixedStore {
            window: window(10, 1500, Some(30 * HOUR)),
            ..Default::default()
        });
        let response = run_stage(&gate(stale), request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 401);

        let recent = Arc::new(FixedStore {
            window: window(10, 1500, Some(20 * HOUR)),
            ..Default::default()
        });
        let response = run_stage(&gate(recent), request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_recent_pass_skips_all_checks() {
        let store = Arc::new(FixedStore {
            window: window(10_000, 10_000, Some(HOUR)),
            ..Default::default()
        });
        let reputation = StaticIpReputation::new(&["203.0.113.0/24"]).unwrap();
        let gate = gate_with(store, reputation, Arc::new(DownProvider));
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate, request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_known_bot_ip_challenged() {
        let reputation = StaticIpReputation::new(&["203.0.113.0/24"]).unwrap();
        let gate = gate_with(
            Arc::new(FixedStore::default()),
            reputation,
            Arc::new(DownProvider),
        );
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate, request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 401);
        assert_eq!(response.body, "Known bot IP");
    }

    #[tokio::test]
    async fn test_allowed_bot_skips() {
        let store = Arc::new(FixedStore {
            window: window(10_000, 10_000, None),
            ..Default::default()
        });
        let endpoint = RecordingEndpoint::default();
        let mut req = request("GET", "/page");
        req.mark_allowed_bot();

        let response = run_stage(&gate(store), req, &endpoint).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_store_outage_challenges() {
        let endpoint = RecordingEndpoint::default();
        let response = run_stage(&gate(Arc::new(BrokenStore)), request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn test_submission_missing_answer() {
        let store = Arc::new(FixedStore::default());
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate(store.clone()), submission(""), &endpoint).await;
        assert_eq!(response.status, 401);
        assert_eq!(response.body, "Missing CAPTCHA response");

        let bare = request("POST", "/api/captcha-verify");
        let response = run_stage(&gate(store), bare, &endpoint).await;
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn test_submission_accepted() {
        let store = Arc::new(FixedStore {
            window: window(10_000, 10_000, None),
            ..Default::default()
        });
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate(store.clone()), submission("good"), &endpoint).await;

        assert_eq!(response.status, 200);
        assert!(endpoint.last().unwrap().attributes().challenge_pass);
        assert_eq!(*store.recorded.lock().unwrap(), vec!["pass"]);
    }

    #[tokio::test]
    async fn test_submission_rejected() {
        let store = Arc::new(FixedStore::default());
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate(store.clone()), submission("bad"), &endpoint).await;

        assert_eq!(response.status, 403);
        assert_eq!(response.body, "Invalid CAPTCHA response");
        assert!(store.recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_is_rejection() {
        let gate = gate_with(
            Arc::new(FixedStore::default()),
            StaticIpReputation::default(),
            Arc::new(DownProvider),
        );
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate, submission("good"), &endpoint).await;
        assert_eq!(response.status, 403);
        assert_eq!(response.body, "Invalid CAPTCHA response");
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_is_rejection() {
        let gate = gate_with(
            Arc::new(FixedStore::default()),
            StaticIpReputation::default(),
            Arc::new(HangingProvider),
        );
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate, submission("good"), &endpoint).await;
        assert_eq!(response.status, 403);
    }

    #[tokio::test]
    async fn test_pass_recorded_in_memory_store_clears_challenge() {
        let store = Arc::new(MemoryRateStore::default());
        let ip: IpAddr = "203.0.113.77".parse().unwrap();
        for _ in 0..151 {
            store.observe(ip, true).await.unwrap();
        }
        let gate = gate(store);
        let endpoint = RecordingEndpoint::default();

        let response = run_stage(&gate, request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 401);

        let response = run_stage(&gate, submission("good"), &endpoint).await;
        assert_eq!(response.status, 200);

        let response = run_stage(&gate, request("GET", "/page"), &endpoint).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_burst_cannot_exceed_threshold() {
        let client: IpAddr = "203.0.113.77".parse().unwrap();
        let store = Arc::new(RemoteStore {
            inner: MemoryRateStore::default(),
        });
        for _ in 0..150 {
            store.observe(client, true).await.unwrap();
        }
        let gate = Arc::new(gate(store.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let gate = gate.clone();
            tasks.spawn(async move {
                let endpoint = RecordingEndpoint::default();
                run_stage(gate.as_ref(), request("GET", "/page"), &endpoint)
                    .await
                    .status
            });
        }

        let mut admitted = 0;
        while let Some(status) = tasks.join_next().await {
            if status.unwrap() == 200 {
                admitted += 1;
            }
        }

        // Only the request that saw exactly 150 stays within the threshold
        assert_eq!(admitted, 1);
        assert_eq!(store.observe(client, false).await.unwrap().hourly, 200);
    }
}
