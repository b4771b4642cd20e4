use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use flowgate_core::config::EngineConfig;
use flowgate_core::error::{FlowError, Result};
use flowgate_core::event::{EventBus, FlowEvent};
use flowgate_core::policy::{PolicyContext, PolicySet, PolicyVerdict};
use flowgate_core::traits::{FlowStore, PolicyEvaluator};
use flowgate_core::{Flow, Plan, PlanContext, PlanEntry};
use flowgate_stages::StageRegistry;

use crate::cache::{cache_key, PlanCache};

/// FlowPlanner: turns a flow and a request context into a plan.
///
/// Plans are looked up in the `PlanCache` first. A cached plan computed
/// against an older flow version is evicted and rebuilt. Every policy
/// failure mode (deny, evaluator error, evaluator timeout) stops planning
/// with `FlowError::FlowDenied`.
pub struct FlowPlanner {
    store: Arc<dyn FlowStore>,
    registry: Arc<StageRegistry>,
    evaluator: Arc<dyn PolicyEvaluator>,
    cache: Arc<PlanCache>,
    event_bus: Arc<EventBus>,
    policy_timeout: Duration,
    use_cache: bool,
}

impl FlowPlanner {
    pub fn new(
        store: Arc<dyn FlowStore>,
        registry: Arc<StageRegistry>,
        evaluator: Arc<dyn PolicyEvaluator>,
        cache: Arc<PlanCache>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            registry,
            evaluator,
            cache,
            event_bus,
            policy_timeout: Duration::from_secs(30),
            use_cache: true,
        }
    }

    /// Apply the `[engine]` settings the planner cares about.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.policy_timeout = Duration::from_secs(config.policy_timeout_secs);
        self.use_cache = config.use_cache;
        self
    }

    pub fn with_policy_timeout(mut self, timeout: Duration) -> Self {
        self.policy_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PlanCache> {
        &self.cache
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Plan `flow_slug` for `ctx`, reading and filling the cache.
    pub async fn plan(&self, flow_slug: &str, ctx: &PlanContext) -> Result<Arc<Plan>> {
        let flow = self.load_flow(flow_slug).await?;
        let key = cache_key(&flow.slug, ctx);

        if self.use_cache {
            if let Some(cached) = self.cache.get(&key).await {
                if cached.flow_version == flow.version {
                    debug!(flow = %flow.slug, key = %key, "Plan cache hit");
                    self.event_bus.publish(FlowEvent::PlanCacheHit {
                        flow: flow.slug.clone(),
                        key,
                    });
                    return Ok(cached);
                }
                let stale = FlowError::PlanStale { key: key.clone() };
                debug!(
                    flow = %flow.slug,
                    cached_version = cached.flow_version,
                    current_version = flow.version,
                    "{}", stale
                );
                let entries = self.cache.invalidate(&flow.slug).await;
                self.event_bus.publish(FlowEvent::PlanInvalidated {
                    flow: flow.slug.clone(),
                    entries,
                });
            }
        }

        let plan = Arc::new(self.build(&flow, key, ctx).await?);
        if self.use_cache {
            self.cache.put(plan.cache_key.clone(), plan.clone()).await;
        }
        Ok(plan)
    }

    /// Plan without touching the cache.
    pub async fn plan_uncached(&self, flow_slug: &str, ctx: &PlanContext) -> Result<Arc<Plan>> {
        let flow = self.load_flow(flow_slug).await?;
        let key = cache_key(&flow.slug, ctx);
        Ok(Arc::new(self.build(&flow, key, ctx).await?))
    }

    /// Number of cached plans for one flow.
    pub async fn cache_count(&self, flow_slug: &str) -> usize {
        self.cache.count_for_flow(flow_slug).await
    }

    /// Drop all cached plans of a flow.
    pub async fn invalidate(&self, flow_slug: &str) -> usize {
        let entries = self.cache.invalidate(flow_slug).await;
        self.event_bus.publish(FlowEvent::PlanInvalidated {
            flow: flow_slug.to_string(),
            entries,
        });
        entries
    }

    /// Evaluate a policy set with the planner's timeout applied.
    ///
    /// An empty set passes without consulting the evaluator. A timeout is
    /// reported as `FlowError::PolicyEvaluation`.
    pub async fn evaluate(&self, set: &PolicySet, request: &PolicyContext) -> Result<PolicyVerdict> {
        if set.active().is_empty() {
            return Ok(PolicyVerdict::allow());
        }
        match tokio::time::timeout(self.policy_timeout, self.evaluator.evaluate(set, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(FlowError::PolicyEvaluation(format!(
                "evaluation timed out after {}s",
                self.policy_timeout.as_secs()
            ))),
        }
    }

    async fn load_flow(&self, flow_slug: &str) -> Result<Flow> {
        self.store
            .flow(flow_slug)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_slug.to_string()))
    }

    fn deny(&self, flow: &Flow) -> FlowError {
        self.event_bus.publish(FlowEvent::FlowDenied {
            session: None,
            flow: flow.slug.clone(),
        });
        FlowError::FlowDenied {
            flow: flow.slug.clone(),
        }
    }

    async fn build(&self, flow: &Flow, key: String, ctx: &PlanContext) -> Result<Plan> {
        let request = ctx.to_map();

        // ── Flow gate ───────────────────────────────────────────
        match self.evaluate(&flow.policies, &request).await {
            Ok(verdict) if verdict.passing => {}
            Ok(_) => {
                info!(flow = %flow.slug, "Flow policies denied entry");
                return Err(self.deny(flow));
            }
            Err(e) => {
                warn!(flow = %flow.slug, error = %e, "Flow policy evaluation failed");
                return Err(self.deny(flow));
            }
        }

        // ── Bindings ────────────────────────────────────────────
        let mut bindings = self.store.bindings(&flow.slug).await?;
        bindings.sort_by_key(|b| b.sort_key());

        for binding in &bindings {
            self.registry.resolve(&binding.stage.kind)?.validate(&binding.stage)?;
        }

        let mut entries = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if binding.evaluate_on_plan {
                match self.evaluate(&binding.policies, &request).await {
                    Ok(verdict) if verdict.passing => {}
                    Ok(_) => {
                        debug!(flow = %flow.slug, stage = %binding.stage.name, "Stage excluded by policy");
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            flow = %flow.slug,
                            stage = %binding.stage.name,
                            error = %e,
                            "Binding policy evaluation failed"
                        );
                        return Err(self.deny(flow));
                    }
                }
            }
            entries.push(PlanEntry { binding });
        }

        let plan = Plan::new(&flow.slug, flow.version, key, entries, ctx.clone());
        info!(flow = %flow.slug, version = flow.version, stages = plan.len(), "Plan built");
        self.event_bus.publish(FlowEvent::PlanBuilt {
            flow: flow.slug.clone(),
            stages: plan.len(),
        });
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::policy::{Policy, PolicyKind};
    use flowgate_core::{FlowStageBinding, Stage};
    use flowgate_policy::PolicyEngine;
    use flowgate_store::{FlowAdmin, InMemoryFlowStore, SqliteFlowStore};
    use flowgate_test_utils::{login_flow, recording_binding, FailingEvaluator, RecordingEvaluator, RecordingStage};
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryFlowStore>,
        evaluator: Arc<RecordingEvaluator>,
        planner: FlowPlanner,
    }

    fn registry() -> Arc<StageRegistry> {
        let mut registry = StageRegistry::new();
        registry.register(RecordingStage::new());
        Arc::new(registry)
    }

    fn harness(flow: Flow, bindings: Vec<FlowStageBinding>) -> Harness {
        let store = Arc::new(InMemoryFlowStore::new());
        store.put_flow(&flow, &bindings).unwrap();
        let evaluator = Arc::new(RecordingEvaluator::new());
        let planner = FlowPlanner::new(
            store.clone(),
            registry(),
            evaluator.clone(),
            Arc::new(PlanCache::default()),
            Arc::new(EventBus::default()),
        );
        Harness {
            store,
            evaluator,
            planner,
        }
    }

    fn trusted() -> PlanContext {
        PlanContext::new().with_attribute("device", json!("trusted"))
    }

    #[tokio::test]
    async fn empty_flow_plans_empty() {
        let h = harness(Flow::new("empty", "Empty"), Vec::new());
        let plan = h.planner.plan("empty", &PlanContext::new()).await.unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn unknown_flow_is_not_found() {
        let h = harness(Flow::new("empty", "Empty"), Vec::new());
        let err = h.planner.plan("nope", &PlanContext::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound(slug) if slug == "nope"));
    }

    #[tokio::test]
    async fn trusted_device_skips_mfa() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let plan = h.planner.plan("login", &trusted()).await.unwrap();
        assert_eq!(plan.stage_names(), vec!["identification", "password"]);

        let untrusted = PlanContext::new().with_attribute("device", json!("laptop"));
        let plan = h.planner.plan("login", &untrusted).await.unwrap();
        assert_eq!(plan.stage_names(), vec!["identification", "password", "mfa"]);
    }

    #[tokio::test]
    async fn bindings_sorted_by_order_then_id() {
        let mut a = recording_binding("f", "a", 5);
        let mut b = recording_binding("f", "b", 5);
        let c = recording_binding("f", "c", -1);
        a.id = uuid_from(2);
        b.id = uuid_from(1);
        let h = harness(Flow::new("f", "F"), vec![a, b, c]);
        let plan = h.planner.plan("f", &PlanContext::new()).await.unwrap();
        assert_eq!(plan.stage_names(), vec!["c", "b", "a"]);
    }

    fn uuid_from(n: u128) -> uuid::Uuid {
        uuid::Uuid::from_u128(n)
    }

    #[tokio::test]
    async fn evaluate_on_plan_false_never_reaches_evaluator() {
        let binding = recording_binding("f", "late", 10)
            .evaluate_on_plan(false)
            .with_policies(PolicySet::single(Policy::deny("late-check")));
        let h = harness(Flow::new("f", "F"), vec![binding]);
        let plan = h.planner.plan("f", &PlanContext::new()).await.unwrap();
        assert_eq!(plan.stage_names(), vec!["late"]);
        assert!(!h.evaluator.saw("late-check"));
    }

    #[tokio::test]
    async fn unknown_stage_kind_is_fatal_before_policies() {
        let bad = FlowStageBinding::new("f", Stage::new("weird", "webauthn"), 10)
            .with_policies(PolicySet::single(Policy::allow("never-checked")));
        let h = harness(Flow::new("f", "F"), vec![bad]);
        let err = h.planner.plan("f", &PlanContext::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::UnknownStageKind(kind) if kind == "webauthn"));
        assert!(!h.evaluator.saw("never-checked"));
    }

    #[tokio::test]
    async fn invalid_stage_config_is_fatal_before_policies() {
        let mut registry = StageRegistry::with_builtins(Arc::new(InMemoryFlowStore::new()));
        registry.register(RecordingStage::new());
        let mfa = FlowStageBinding::new(
            "f",
            Stage::new("mfa", "authenticatorvalidate")
                .with_config(json!({"not_configured_action": "Deny"})),
            10,
        )
        .with_policies(PolicySet::single(Policy::allow("never-checked")));

        let store = Arc::new(InMemoryFlowStore::new());
        store.put_flow(&Flow::new("f", "F"), &[mfa]).unwrap();
        let evaluator = Arc::new(RecordingEvaluator::new());
        let planner = FlowPlanner::new(
            store,
            Arc::new(registry),
            evaluator.clone(),
            Arc::new(PlanCache::default()),
            Arc::new(EventBus::default()),
        );

        let err = planner.plan("f", &PlanContext::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidStageConfig { ref stage, .. } if stage == "mfa"));
        assert!(!err.is_denial());
        assert!(!evaluator.saw("never-checked"));
        assert_eq!(planner.cache_count("f").await, 0);
    }

    #[tokio::test]
    async fn flow_gate_denies() {
        let flow = Flow::new("f", "F").with_policies(PolicySet::single(Policy::deny("closed")));
        let h = harness(flow, vec![recording_binding("f", "a", 0)]);
        let mut rx = h.planner.event_bus().subscribe();
        let err = h.planner.plan("f", &PlanContext::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::FlowDenied { .. }));
        assert_eq!(h.planner.cache_count("f").await, 0);
        match rx.recv().await.unwrap() {
            FlowEvent::FlowDenied { session, flow } => {
                assert!(session.is_none());
                assert_eq!(flow, "f");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn evaluator_error_fails_closed() {
        let (flow, bindings) = login_flow();
        let store = Arc::new(InMemoryFlowStore::new());
        store.put_flow(&flow, &bindings).unwrap();
        let planner = FlowPlanner::new(
            store,
            registry(),
            Arc::new(FailingEvaluator),
            Arc::new(PlanCache::default()),
            Arc::new(EventBus::default()),
        );
        let err = planner.plan("login", &trusted()).await.unwrap_err();
        assert!(matches!(err, FlowError::FlowDenied { .. }));
        assert_eq!(planner.cache_count("login").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evaluator_timeout_fails_closed() {
        let slow = Policy::new(
            "slow",
            PolicyKind::Static {
                result: true,
                wait_secs: 120,
            },
        );
        let binding = recording_binding("f", "a", 0).with_policies(PolicySet::single(slow));
        let store = Arc::new(InMemoryFlowStore::new());
        store.put_flow(&Flow::new("f", "F"), &[binding]).unwrap();
        let planner = FlowPlanner::new(
            store,
            registry(),
            Arc::new(PolicyEngine::new()),
            Arc::new(PlanCache::default()),
            Arc::new(EventBus::default()),
        )
        .with_policy_timeout(Duration::from_secs(5));

        let err = planner.plan("f", &PlanContext::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::FlowDenied { .. }));
    }

    #[tokio::test]
    async fn cache_hit_returns_same_plan() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let first = h.planner.plan("login", &trusted()).await.unwrap();
        let calls = h.evaluator.calls();
        let second = h.planner.plan("login", &trusted()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id, second.id);
        assert_eq!(h.evaluator.calls(), calls);
        assert_eq!(h.planner.cache_count("login").await, 1);
    }

    #[tokio::test]
    async fn distinct_contexts_get_distinct_entries() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        h.planner.plan("login", &trusted()).await.unwrap();
        h.planner
            .plan("login", &PlanContext::new().with_attribute("device", json!("laptop")))
            .await
            .unwrap();
        assert_eq!(h.planner.cache_count("login").await, 2);
    }

    #[tokio::test]
    async fn version_bump_invalidates_cached_plan() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let first = h.planner.plan("login", &trusted()).await.unwrap();

        let extra = recording_binding("login", "consent", 40);
        h.store.add_binding(&extra).unwrap();

        let second = h.planner.plan("login", &trusted()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.flow_version, first.flow_version + 1);
        assert_eq!(second.stage_names(), vec!["identification", "password", "consent"]);
        assert_eq!(h.planner.cache_count("login").await, 1);
    }

    #[tokio::test]
    async fn recreated_flow_is_not_served_an_old_plan() {
        let store = Arc::new(SqliteFlowStore::in_memory().unwrap());
        let flow = Flow::new("login", "Login");
        store
            .put_flow(&flow, &[recording_binding("login", "old-stage", 10)])
            .unwrap();
        let planner = FlowPlanner::new(
            store.clone(),
            registry(),
            Arc::new(PolicyEngine::new()),
            Arc::new(PlanCache::default()),
            Arc::new(EventBus::default()),
        );
        let first = planner.plan("login", &PlanContext::new()).await.unwrap();
        assert_eq!(first.stage_names(), vec!["old-stage"]);

        store.delete_flow("login").unwrap();
        store
            .put_flow(&flow, &[recording_binding("login", "new-stage", 10)])
            .unwrap();

        let second = planner.plan("login", &PlanContext::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(second.flow_version, first.flow_version);
        assert_eq!(second.stage_names(), vec!["new-stage"]);
    }

    #[tokio::test]
    async fn uncached_plans_leave_cache_alone() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let a = h.planner.plan_uncached("login", &trusted()).await.unwrap();
        let b = h.planner.plan_uncached("login", &trusted()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(h.planner.cache_count("login").await, 0);
    }

    #[tokio::test]
    async fn disabled_cache_rebuilds_every_time() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let config = EngineConfig {
            use_cache: false,
            ..EngineConfig::default()
        };
        let planner = h.planner.with_config(&config);
        let a = planner.plan("login", &trusted()).await.unwrap();
        let b = planner.plan("login", &trusted()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(planner.cache_count("login").await, 0);
    }

    #[tokio::test]
    async fn invalidate_drops_flow_namespace() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        h.planner.plan("login", &trusted()).await.unwrap();
        assert_eq!(h.planner.invalidate("login").await, 1);
        assert_eq!(h.planner.cache_count("login").await, 0);
    }
}
