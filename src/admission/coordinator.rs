//! Per-request admission decisions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::outcome::{BoundaryResponse, Decision, Rejection};
use super::request::RequestMetadata;
use super::routes::RouteTable;
use crate::apikey::ApiKeyRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::{EnvLookup, RateLimiterConfig, WardenConfig};
use crate::error::{Result, WardenError};
use crate::guard::{DdosGuard, IpAccessList};
use crate::ratelimit::{
    AdmissionAlgorithm, AtomicStore, DistributedLimiter, EffectiveLimit, LocalWindowLimiter,
    PartitionKey, PolicyHint, PolicyResolver, PolicyType, RedisStore, RequestContext,
};

/// How often closed local windows are swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Runs every check a request goes through and produces one [`Decision`].
///
/// Order: access lists, the global switch, abuse tracking, key derivation,
/// limit resolution, API-key overrides and finally the admission algorithm.
/// Abuse tracking precedes rate accounting so a banned source never consumes
/// budget, and the whitelist bypasses abuse tracking.
pub struct AdmissionCoordinator {
    config: Arc<RateLimiterConfig>,
    resolver: PolicyResolver,
    access: Arc<IpAccessList>,
    ddos: Arc<DdosGuard>,
    api_keys: Arc<ApiKeyRegistry>,
    routes: Arc<RouteTable>,
    algorithm: Arc<dyn AdmissionAlgorithm>,
    local: Option<Arc<LocalWindowLimiter>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdmissionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionCoordinator")
            .field("algorithm", &self.algorithm.name())
            .field("ddos", &self.ddos)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl AdmissionCoordinator {
    /// Build every component from configuration.
    ///
    /// Distributed mode requires `store`; local mode ignores it.
    pub fn from_config(
        config: &WardenConfig,
        env: EnvLookup,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn AtomicStore>>,
    ) -> Result<Self> {
        let rl = Arc::new(config.rate_limiter.clone());

        let local = (!rl.enable_distributed)
            .then(|| Arc::new(LocalWindowLimiter::new(clock.clone())));
        let algorithm: Arc<dyn AdmissionAlgorithm> = match &local {
            Some(local) => local.clone(),
            None => {
                let store = store.ok_or_else(|| {
                    WardenError::Config("distributed mode requires a shared store".to_string())
                })?;
                Arc::new(DistributedLimiter::new(store, clock.clone()))
            }
        };

        info!(
            algorithm = algorithm.name(),
            enabled = rl.enabled,
            ip_filtering = rl.enable_ip_filtering,
            "Admission coordinator initialized"
        );

        Ok(Self {
            resolver: PolicyResolver::new(rl.clone(), env),
            access: Arc::new(IpAccessList::from_lists(
                &rl.whitelisted_ips,
                &rl.blacklisted_ips,
            )),
            ddos: Arc::new(DdosGuard::new(&rl.ddos, clock.clone())),
            api_keys: Arc::new(ApiKeyRegistry::new(clock.clone())),
            routes: Arc::new(RouteTable::new()),
            algorithm,
            local,
            clock,
            config: rl,
        })
    }

    /// Build from configuration against the system clock, connecting to the
    /// shared store when distributed mode is on.
    pub async fn connect(config: &WardenConfig, env: EnvLookup) -> Result<Self> {
        let store: Option<Arc<dyn AtomicStore>> = if config.rate_limiter.enable_distributed {
            Some(Arc::new(RedisStore::connect(&config.redis).await?))
        } else {
            None
        };
        Self::from_config(config, env, SystemClock::shared(), store)
    }

    /// Start the periodic DDoS counter reset and, in local mode, window
    /// eviction. Tasks stop once the coordinator is dropped.
    pub fn start_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.ddos.spawn_reset_task()];
        if let Some(local) = &self.local {
            tasks.push(local.spawn_eviction_task(EVICTION_INTERVAL));
        }
        tasks
    }

    /// Decide on one request.
    ///
    /// `Err` is only returned when the shared store fails; callers choose
    /// whether to fail open or closed. [`check`](Self::check) fails open.
    #[instrument(skip_all, fields(client = %client, endpoint = %endpoint, policy = %policy))]
    pub async fn decide(
        &self,
        client: &str,
        endpoint: &str,
        policy: PolicyType,
        ctx: &RequestContext,
        hint: &PolicyHint,
    ) -> Result<Decision> {
        trace!("Admission check");

        if let Some(decision) = self.screen(client, endpoint) {
            return Ok(decision);
        }

        if !self.config.enabled {
            return Ok(Decision::Admit);
        }

        if policy.is_ip_derived() && hint.ddos_protection && !self.ddos.track_request(client) {
            warn!(client = %client, endpoint = %endpoint, "Request blocked by DDoS protection");
            return Ok(Decision::Reject(Rejection::banned(
                self.ddos.ban_duration_seconds(),
            )));
        }

        let mut key = PartitionKey::derive(client, endpoint, policy, ctx);

        let effective = self.resolver.resolve(endpoint, hint);
        if !effective.enabled {
            return Ok(Decision::Admit);
        }
        let EffectiveLimit {
            mut limit,
            time_window_seconds: mut window,
            ..
        } = effective;

        if policy == PolicyType::ApiKeyBased {
            if let Some(record) = ctx.api_key().and_then(|secret| self.api_keys.active(secret)) {
                debug!(
                    owner = %record.owner,
                    limit = record.limit,
                    window = record.time_window_seconds,
                    "Applying API key limits"
                );
                limit = record.limit;
                window = record.time_window_seconds;
                key = PartitionKey::api_key(&record.secret, endpoint);
            }
        }

        if self.algorithm.allow(key.as_str(), limit, window).await? {
            return Ok(Decision::Admit);
        }

        let wait = self.algorithm.wait_time_seconds(key.as_str()).await;
        warn!(
            client = %client,
            endpoint = %endpoint,
            key = %key,
            limit = limit,
            window = window,
            wait = wait,
            "Rate limit exceeded"
        );
        Ok(Decision::Reject(Rejection::rate_limited(policy, wait)))
    }

    /// Decide on a request using its registered route policy. Unexpected
    /// failures admit the request.
    pub async fn check(&self, request: &RequestMetadata) -> Decision {
        let client = request.client_address();
        let endpoint = request.path.as_str();
        let hint = self
            .routes
            .hint(endpoint)
            .unwrap_or_else(PolicyHint::unregistered);

        if !hint.applies_to_method(Some(request.method.as_str())) {
            return self.screen(client, endpoint).unwrap_or(Decision::Admit);
        }

        match self
            .decide(client, endpoint, hint.policy_type, &request.context(), &hint)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(client = %client, endpoint = %endpoint, error = %e, "Admission check failed, letting request through");
                Decision::Admit
            }
        }
    }

    /// [`check`](Self::check), rendered as the response to send instead of
    /// the request, or `None` to pass it through.
    pub async fn respond(&self, request: &RequestMetadata) -> Option<BoundaryResponse> {
        let decision = self.check(request).await;
        decision.into_response(self.clock.now().timestamp_millis())
    }

    /// Access-list screening; `Some` when the lists decide the request.
    fn screen(&self, client: &str, endpoint: &str) -> Option<Decision> {
        if !self.config.enable_ip_filtering {
            return None;
        }
        if self.access.is_blacklisted(client) {
            warn!(client = %client, endpoint = %endpoint, "Request from blacklisted address blocked");
            return Some(Decision::Deny);
        }
        if self.access.is_whitelisted(client) {
            debug!(client = %client, endpoint = %endpoint, "Whitelisted address bypassing rate limiting");
            return Some(Decision::Admit);
        }
        None
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn access_list(&self) -> &Arc<IpAccessList> {
        &self.access
    }

    pub fn ddos_guard(&self) -> &Arc<DdosGuard> {
        &self.ddos
    }

    pub fn api_keys(&self) -> &Arc<ApiKeyRegistry> {
        &self.api_keys
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Name of the active admission algorithm.
    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::{empty_env, map_env, EndpointLimit};
    use crate::ratelimit::InMemoryStore;
    use async_trait::async_trait;

    fn coordinator_with(config: WardenConfig) -> (AdmissionCoordinator, MockClock) {
        let clock = MockClock::at_epoch_secs(1_700_000_000);
        let coordinator =
            AdmissionCoordinator::from_config(&config, empty_env(), Arc::new(clock.clone()), None)
                .unwrap();
        (coordinator, clock)
    }

    fn filtering_config() -> WardenConfig {
        let mut config = WardenConfig::default();
        config.rate_limiter.enable_ip_filtering = true;
        config.rate_limiter.whitelisted_ips = vec!["10.0.0.1".to_string()];
        config.rate_limiter.blacklisted_ips = vec!["6.6.6.6".to_string()];
        config
    }

    fn ip_hint(limit: u64, window: u64) -> PolicyHint {
        PolicyHint::new(PolicyType::IpBased, limit, window)
    }

    #[tokio::test]
    async fn test_blacklist_denies() {
        let (coordinator, _clock) = coordinator_with(filtering_config());
        let decision = coordinator
            .decide("6.6.6.6", "/api", PolicyType::IpBased, &RequestContext::new(), &ip_hint(5, 10))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_limits_and_ddos() {
        let mut config = filtering_config();
        config.rate_limiter.ddos.threshold = 1;
        let (coordinator, _clock) = coordinator_with(config);

        for _ in 0..10 {
            let decision = coordinator
                .decide("10.0.0.1", "/api", PolicyType::IpBased, &RequestContext::new(), &ip_hint(1, 10))
                .await
                .unwrap();
            assert!(decision.is_admitted());
        }
        assert_eq!(coordinator.ddos_guard().request_count("10.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_lists_ignored_when_filtering_disabled() {
        let mut config = filtering_config();
        config.rate_limiter.enable_ip_filtering = false;
        let (coordinator, _clock) = coordinator_with(config);

        let decision = coordinator
            .decide("6.6.6.6", "/api", PolicyType::IpBased, &RequestContext::new(), &ip_hint(5, 10))
            .await
            .unwrap();
        assert!(decision.is_admitted());
    }

    #[tokio::test]
    async fn test_ddos_ban_precedes_rate_accounting() {
        let mut config = WardenConfig::default();
        config.rate_limiter.ddos.threshold = 2;
        config.rate_limiter.ddos.ban_duration_seconds = 120;
        let (coordinator, _clock) = coordinator_with(config);
        let ctx = RequestContext::new();
        let hint = ip_hint(100, 60);

        for _ in 0..2 {
            assert!(coordinator
                .decide("1.2.3.4", "/api", PolicyType::IpBased, &ctx, &hint)
                .await
                .unwrap()
                .is_admitted());
        }

        let decision = coordinator
            .decide("1.2.3.4", "/api", PolicyType::IpBased, &ctx, &hint)
            .await
            .unwrap();
        assert_eq!(decision.wait_seconds(), Some(120));

        let local = coordinator.local.as_ref().unwrap();
        assert_eq!(local.state("ip:1.2.3.4:/api").unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_ddos_skipped_when_hint_disables_it() {
        let mut config = WardenConfig::default();
        config.rate_limiter.ddos.threshold = 1;
        let (coordinator, _clock) = coordinator_with(config);
        let hint = ip_hint(100, 60).with_ddos_protection(false);

        for _ in 0..5 {
            assert!(coordinator
                .decide("1.2.3.4", "/api", PolicyType::IpBased, &RequestContext::new(), &hint)
                .await
                .unwrap()
                .is_admitted());
        }
    }

    #[tokio::test]
    async fn test_global_switch_admits_everything() {
        let mut config = WardenConfig::default();
        config.rate_limiter.enabled = false;
        let (coordinator, _clock) = coordinator_with(config);

        for _ in 0..5 {
            assert!(coordinator
                .decide("1.2.3.4", "/api", PolicyType::Global, &RequestContext::new(), &ip_hint(1, 60))
                .await
                .unwrap()
                .is_admitted());
        }
    }

    #[tokio::test]
    async fn test_disabled_endpoint_admits() {
        let mut config = WardenConfig::default();
        config.rate_limiter.endpoints.insert(
            "/health".to_string(),
            EndpointLimit {
                enabled: false,
                ..Default::default()
            },
        );
        let (coordinator, _clock) = coordinator_with(config);

        for _ in 0..5 {
            assert!(coordinator
                .decide("1.2.3.4", "/health", PolicyType::EndpointBased, &RequestContext::new(), &ip_hint(1, 60))
                .await
                .unwrap()
                .is_admitted());
        }
    }

    #[tokio::test]
    async fn test_api_key_limits_override_endpoint_policy() {
        let (coordinator, _clock) = coordinator_with(WardenConfig::default());
        let record = coordinator.api_keys().issue("acme", 2, 30, 0);
        let ctx = RequestContext::new().with_api_key(record.secret.clone());
        let hint = PolicyHint::new(PolicyType::ApiKeyBased, 100, 60);

        for _ in 0..2 {
            assert!(coordinator
                .decide("1.2.3.4", "/api", PolicyType::ApiKeyBased, &ctx, &hint)
                .await
                .unwrap()
                .is_admitted());
        }
        let decision = coordinator
            .decide("5.6.7.8", "/api", PolicyType::ApiKeyBased, &ctx, &hint)
            .await
            .unwrap();
        match decision {
            Decision::Reject(rejection) => {
                assert_eq!(rejection.wait_seconds, 30);
                assert!(rejection.message.starts_with("API key rate limit exceeded."));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_revoked_api_key_uses_endpoint_limits_on_key_partition() {
        let (coordinator, _clock) = coordinator_with(WardenConfig::default());
        let record = coordinator.api_keys().issue("acme", 1, 30, 0);
        coordinator.api_keys().revoke(&record.secret);
        let ctx = RequestContext::new().with_api_key(record.secret.clone());
        let hint = PolicyHint::new(PolicyType::ApiKeyBased, 3, 60);

        for _ in 0..3 {
            assert!(coordinator
                .decide("1.2.3.4", "/api", PolicyType::ApiKeyBased, &ctx, &hint)
                .await
                .unwrap()
                .is_admitted());
        }
        assert!(!coordinator
            .decide("1.2.3.4", "/api", PolicyType::ApiKeyBased, &ctx, &hint)
            .await
            .unwrap()
            .is_admitted());

        // The presented key still names the budget, whatever the address
        assert!(!coordinator
            .decide("5.6.7.8", "/api", PolicyType::ApiKeyBased, &ctx, &hint)
            .await
            .unwrap()
            .is_admitted());
        let local = coordinator.local.as_ref().unwrap();
        let key = format!("api-key:{}:/api", record.secret);
        assert_eq!(local.state(&key).unwrap().count, 5);
        assert!(local.state("ip:5.6.7.8:/api").is_none());
    }

    #[tokio::test]
    async fn test_env_override_applies_per_endpoint() {
        let clock = MockClock::at_epoch_secs(1_700_000_000);
        let env = map_env([("RATE_LIMITER_ENDPOINTS_API_LIMIT", "1")]);
        let coordinator = AdmissionCoordinator::from_config(
            &WardenConfig::default(),
            env,
            Arc::new(clock),
            None,
        )
        .unwrap();
        let ctx = RequestContext::new();

        assert!(coordinator
            .decide("1.2.3.4", "/api", PolicyType::Global, &ctx, &ip_hint(50, 60))
            .await
            .unwrap()
            .is_admitted());
        assert!(!coordinator
            .decide("1.2.3.4", "/api", PolicyType::Global, &ctx, &ip_hint(50, 60))
            .await
            .unwrap()
            .is_admitted());
    }

    #[test]
    fn test_distributed_requires_store() {
        let mut config = WardenConfig::default();
        config.rate_limiter.enable_distributed = true;
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at_epoch_secs(0));

        let err = AdmissionCoordinator::from_config(&config, empty_env(), clock.clone(), None)
            .unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));

        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let coordinator =
            AdmissionCoordinator::from_config(&config, empty_env(), clock, Some(store)).unwrap();
        assert_eq!(coordinator.algorithm_name(), "distributed");
    }

    struct FailingStore;

    #[async_trait]
    impl AtomicStore for FailingStore {
        async fn consume(&self, _: &str, _: u64, _: u64, _: i64) -> Result<bool> {
            Err(WardenError::Store(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }

        async fn ttl_seconds(&self, _: &str) -> Result<Option<u64>> {
            Ok(None)
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_from_decide_and_fails_open_in_check() {
        let mut config = WardenConfig::default();
        config.rate_limiter.enable_distributed = true;
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at_epoch_secs(0));
        let coordinator = AdmissionCoordinator::from_config(
            &config,
            empty_env(),
            clock,
            Some(Arc::new(FailingStore)),
        )
        .unwrap();

        let result = coordinator
            .decide("1.2.3.4", "/api", PolicyType::Global, &RequestContext::new(), &ip_hint(1, 10))
            .await;
        assert!(result.is_err());

        let request = RequestMetadata::new("1.2.3.4", "GET", "/api");
        assert!(coordinator.check(&request).await.is_admitted());
    }

    #[tokio::test]
    async fn test_check_skips_methods_outside_hint() {
        let (coordinator, _clock) = coordinator_with(filtering_config());
        coordinator.routes().register(
            "/api/orders",
            PolicyHint::new(PolicyType::IpBased, 1, 60).with_methods(["POST"]),
        );

        let get = RequestMetadata::new("1.2.3.4", "GET", "/api/orders");
        for _ in 0..3 {
            assert!(coordinator.check(&get).await.is_admitted());
        }

        let post = RequestMetadata::new("1.2.3.4", "POST", "/api/orders");
        assert!(coordinator.check(&post).await.is_admitted());
        assert!(!coordinator.check(&post).await.is_admitted());

        // Blacklisting still applies to unlimited methods
        let denied = RequestMetadata::new("6.6.6.6", "GET", "/api/orders");
        assert_eq!(coordinator.check(&denied).await, Decision::Deny);
    }

    #[tokio::test]
    async fn test_maintenance_tasks_per_mode() {
        let (coordinator, _clock) = coordinator_with(WardenConfig::default());
        let tasks = coordinator.start_maintenance();
        assert_eq!(tasks.len(), 2);
        tasks.iter().for_each(|t| t.abort());

        let mut config = WardenConfig::default();
        config.rate_limiter.enable_distributed = true;
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at_epoch_secs(0));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let distributed =
            AdmissionCoordinator::from_config(&config, empty_env(), clock, Some(store)).unwrap();
        let tasks = distributed.start_maintenance();
        assert_eq!(tasks.len(), 1);
        tasks.iter().for_each(|t| t.abort());
    }

    #[tokio::test]
    async fn test_unregistered_route_uses_defaults() {
        let mut config = WardenConfig::default();
        config.rate_limiter.default_limit = 2;
        config.rate_limiter.ddos.threshold = 1;
        let (coordinator, _clock) = coordinator_with(config);
        let request = RequestMetadata::new("1.2.3.4", "GET", "/unlisted");

        assert!(coordinator.check(&request).await.is_admitted());
        assert!(coordinator.check(&request).await.is_admitted());
        let decision = coordinator.check(&request).await;
        assert!(!decision.is_admitted());
        // Unregistered routes are not abuse-tracked
        assert!(!coordinator.ddos_guard().is_banned("1.2.3.4"));
    }
}
