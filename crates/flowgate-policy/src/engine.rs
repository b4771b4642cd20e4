use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use flowgate_core::error::{FlowError, Result};
use flowgate_core::policy::{
    PolicyBinding, PolicyContext, PolicyKind, PolicyResult, PolicySet, PolicyVerdict,
};
use flowgate_core::traits::PolicyEvaluator;

use crate::expression::evaluate_expression;

/// Default policy evaluator.
///
/// Bindings of a set run concurrently, each bounded by its binding's
/// `timeout_secs`. A timeout or a broken policy fails the whole evaluation
/// with `FlowError::PolicyEvaluation`; callers treat that as deny.
pub struct PolicyEngine {
    /// Upper bound applied on top of per-binding timeouts.
    max_timeout: Option<Duration>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self { max_timeout: None }
    }

    /// Cap every binding's timeout at `max`.
    pub fn with_max_timeout(max: Duration) -> Self {
        Self {
            max_timeout: Some(max),
        }
    }

    fn timeout_for(&self, binding: &PolicyBinding) -> Duration {
        let own = Duration::from_secs(binding.timeout_secs);
        match self.max_timeout {
            Some(max) if max < own => max,
            _ => own,
        }
    }

    /// Evaluate one binding, applying its timeout and `negate` flag.
    async fn evaluate_binding(
        &self,
        binding: &PolicyBinding,
        request: &PolicyContext,
    ) -> Result<PolicyResult> {
        let timeout = self.timeout_for(binding);
        let name = binding.policy.name.as_str();

        let raw = match tokio::time::timeout(timeout, run_policy(&binding.policy.kind, request)).await
        {
            Ok(result) => result.map_err(|message| {
                FlowError::PolicyEvaluation(format!("policy '{}': {}", name, message))
            })?,
            Err(_) => {
                warn!(policy = %name, timeout_secs = timeout.as_secs(), "Policy timed out");
                return Err(FlowError::PolicyEvaluation(format!(
                    "policy '{}' timed out after {}s",
                    name,
                    timeout.as_secs()
                )));
            }
        };

        let passing = raw != binding.negate;
        debug!(policy = %name, passing, negate = binding.negate, "Policy evaluated");
        Ok(PolicyResult::new(name, passing))
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEvaluator for PolicyEngine {
    fn evaluate<'a>(
        &'a self,
        set: &'a PolicySet,
        request: &'a PolicyContext,
    ) -> BoxFuture<'a, Result<PolicyVerdict>> {
        Box::pin(async move {
            let active = set.active();
            if active.is_empty() {
                return Ok(PolicyVerdict::allow());
            }

            let outcomes = join_all(
                active
                    .iter()
                    .map(|binding| self.evaluate_binding(binding, request)),
            )
            .await;

            let results = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
            Ok(PolicyVerdict::aggregate(set.mode, results))
        })
    }
}

/// Run a single policy rule. `Err` carries a description of what broke.
async fn run_policy(
    kind: &PolicyKind,
    request: &PolicyContext,
) -> std::result::Result<bool, String> {
    match kind {
        PolicyKind::Static { result, wait_secs } => {
            if *wait_secs > 0 {
                tokio::time::sleep(Duration::from_secs(*wait_secs)).await;
            }
            Ok(*result)
        }
        PolicyKind::Expression { expr } => {
            evaluate_expression(expr, request).map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::policy::{Policy, PolicyEngineMode};
    use serde_json::json;

    fn request(pairs: &[(&str, serde_json::Value)]) -> PolicyContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn empty_set_passes() {
        let engine = PolicyEngine::new();
        let verdict = engine
            .evaluate(&PolicySet::default(), &PolicyContext::new())
            .await
            .unwrap();
        assert!(verdict.passing);
        assert!(verdict.results.is_empty());
    }

    #[tokio::test]
    async fn all_mode_requires_every_policy() {
        let engine = PolicyEngine::new();
        let set = PolicySet::new(PolicyEngineMode::All)
            .with(PolicyBinding::new(Policy::allow("yes")))
            .with(PolicyBinding::new(Policy::deny("no")));
        let verdict = engine.evaluate(&set, &PolicyContext::new()).await.unwrap();
        assert!(!verdict.passing);
        assert_eq!(verdict.results.len(), 2);
    }

    #[tokio::test]
    async fn any_mode_needs_one() {
        let engine = PolicyEngine::new();
        let set = PolicySet::new(PolicyEngineMode::Any)
            .with(PolicyBinding::new(Policy::allow("yes")))
            .with(PolicyBinding::new(Policy::deny("no")));
        let verdict = engine.evaluate(&set, &PolicyContext::new()).await.unwrap();
        assert!(verdict.passing);
    }

    #[tokio::test]
    async fn negate_inverts_result() {
        let engine = PolicyEngine::new();
        let set = PolicySet::default().with(PolicyBinding::new(Policy::deny("no")).negated());
        let verdict = engine.evaluate(&set, &PolicyContext::new()).await.unwrap();
        assert!(verdict.passing);
    }

    #[tokio::test]
    async fn expression_policy_reads_request() {
        let engine = PolicyEngine::new();
        let set = PolicySet::single(Policy::expression(
            "untrusted-device",
            r#"device != "trusted""#,
        ));
        let trusted = request(&[("device", json!("trusted"))]);
        let untrusted = request(&[("device", json!("laptop"))]);
        assert!(!engine.evaluate(&set, &trusted).await.unwrap().passing);
        assert!(engine.evaluate(&set, &untrusted).await.unwrap().passing);
    }

    #[tokio::test]
    async fn broken_expression_is_an_error() {
        let engine = PolicyEngine::new();
        let set = PolicySet::single(Policy::expression("broken", "what even"));
        let err = engine
            .evaluate(&set, &PolicyContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PolicyEvaluation(_)));
        assert!(err.is_denial());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_policy_times_out() {
        let engine = PolicyEngine::new();
        let slow = Policy::new(
            "slow",
            PolicyKind::Static {
                result: true,
                wait_secs: 10,
            },
        );
        let set = PolicySet::default().with(PolicyBinding::new(slow).with_timeout(1));
        let err = engine
            .evaluate(&set, &PolicyContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn max_timeout_caps_binding_timeout() {
        let engine = PolicyEngine::with_max_timeout(Duration::from_secs(2));
        let slow = Policy::new(
            "slow",
            PolicyKind::Static {
                result: true,
                wait_secs: 5,
            },
        );
        // binding allows 30s, the engine cap of 2s wins
        let set = PolicySet::single(slow);
        assert!(engine.evaluate(&set, &PolicyContext::new()).await.is_err());
    }
}
