use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use flowgate_core::config::EngineConfig;
use flowgate_core::error::{FlowError, Result};
use flowgate_core::event::FlowEvent;
use flowgate_core::{Challenge, ExecutionContext, ExecutionStatus, StageResult};

use crate::planner::FlowPlanner;

/// Message shown for every denied or expired execution. It deliberately
/// says nothing about which policy stopped the flow.
pub const FLOW_CANNOT_CONTINUE: &str = "Flow cannot continue.";

const FLOW_FAILED: &str = "Flow could not be completed.";
const FLOW_ABORTED: &str = "Flow was aborted.";
/// Shown when a stage errored internally; the stage is offered again and the
/// error counts as an attempt.
const STAGE_ERROR: &str = "Something went wrong. Please try again.";

/// What the client sees after a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// The current stage wants input.
    Challenge { challenge: Challenge },
    /// Every stage finished; `data` is what the stages produced.
    Completed {
        data: HashMap<String, serde_json::Value>,
    },
    /// The execution ended without completing.
    Stopped {
        status: ExecutionStatus,
        message: String,
    },
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Challenge { .. })
    }
}

/// FlowExecutor: walks an execution through its plan.
///
/// ```text
/// Pending ─start─▶ InProgress ─submit…─▶ Completed
///                      │
///                      ├─▶ Denied   (re-evaluated policy no longer passes)
///                      ├─▶ Failed   (stage failure or retry limit)
///                      ├─▶ Aborted  (abort)
///                      └─▶ Expired  (idle past session timeout)
/// ```
///
/// Terminal states are final. The executor owns no per-session state; the
/// caller hands in the `ExecutionContext` for every call.
pub struct FlowExecutor {
    planner: Arc<FlowPlanner>,
    max_stage_retries: u32,
    session_timeout: chrono::Duration,
}

impl FlowExecutor {
    pub fn new(planner: Arc<FlowPlanner>, config: &EngineConfig) -> Self {
        Self {
            planner,
            max_stage_retries: config.max_stage_retries,
            session_timeout: chrono::Duration::seconds(config.session_timeout_secs as i64),
        }
    }

    pub fn planner(&self) -> &Arc<FlowPlanner> {
        &self.planner
    }

    /// Plan the flow and present the first stage.
    pub async fn start(&self, ctx: &mut ExecutionContext) -> Result<Outcome> {
        if ctx.status != ExecutionStatus::Pending {
            return Err(invalid_transition("start", ctx.status));
        }
        if self.expire_if_idle(ctx) {
            return Ok(terminal_outcome(ctx));
        }

        let plan = match self.planner.plan(&ctx.flow_slug, &ctx.request).await {
            Ok(plan) => plan,
            Err(e) if e.is_denial() => {
                ctx.status = ExecutionStatus::Denied;
                ctx.touch();
                info!(session = %ctx.session_id, flow = %ctx.flow_slug, "Flow denied at planning");
                return Ok(terminal_outcome(ctx));
            }
            Err(e) => return Err(e),
        };

        debug!(session = %ctx.session_id, flow = %ctx.flow_slug, stages = plan.len(), "Execution started");
        ctx.plan = Some(plan);
        ctx.cursor = 0;
        ctx.attempts = 0;
        ctx.status = ExecutionStatus::InProgress;
        self.enter(ctx).await
    }

    /// Process client input for the current stage.
    pub async fn submit(
        &self,
        ctx: &mut ExecutionContext,
        input: serde_json::Value,
    ) -> Result<Outcome> {
        if ctx.is_terminal() {
            return Ok(terminal_outcome(ctx));
        }
        if ctx.status == ExecutionStatus::Pending {
            return Err(invalid_transition("submit", ctx.status));
        }
        if self.expire_if_idle(ctx) {
            return Ok(terminal_outcome(ctx));
        }

        let Some(entry) = ctx.current_entry().cloned() else {
            return Ok(self.complete(ctx));
        };
        let stage = entry.stage();
        let behavior = self.planner.registry().resolve(&stage.kind)?;

        let result = match behavior.process(stage, ctx, input).await {
            Ok(result) => result,
            Err(e) => {
                let error = FlowError::StageProcessing {
                    stage: stage.name.clone(),
                    message: e.to_string(),
                };
                warn!(session = %ctx.session_id, error = %error, "Stage processing error");
                StageResult::invalid(STAGE_ERROR)
            }
        };
        ctx.touch();

        match result {
            StageResult::Complete { data } => {
                debug!(session = %ctx.session_id, stage = %stage.name, "Stage completed");
                self.publish(FlowEvent::StageCompleted {
                    session: ctx.session_id.clone(),
                    stage: stage.name.clone(),
                });
                ctx.merge(data);
                ctx.cursor += 1;
                ctx.attempts = 0;
                self.enter(ctx).await
            }
            StageResult::Invalid { errors } => {
                ctx.attempts += 1;
                self.publish(FlowEvent::StageInvalid {
                    session: ctx.session_id.clone(),
                    stage: stage.name.clone(),
                    attempts: ctx.attempts,
                });
                if ctx.attempts > self.max_stage_retries {
                    warn!(
                        session = %ctx.session_id,
                        stage = %stage.name,
                        attempts = ctx.attempts,
                        "Stage retry limit exceeded"
                    );
                    return Ok(self.fail(ctx));
                }
                let mut challenge = behavior.present(stage, ctx).await?;
                challenge.errors = errors;
                Ok(Outcome::Challenge { challenge })
            }
            StageResult::Fail { reason } => {
                info!(session = %ctx.session_id, stage = %stage.name, reason = %reason, "Stage failed");
                Ok(self.fail(ctx))
            }
        }
    }

    /// Present the current stage again without changing state.
    pub async fn current(&self, ctx: &mut ExecutionContext) -> Result<Outcome> {
        if ctx.is_terminal() {
            return Ok(terminal_outcome(ctx));
        }
        if ctx.status == ExecutionStatus::Pending {
            return Err(invalid_transition("present", ctx.status));
        }
        if self.expire_if_idle(ctx) {
            return Ok(terminal_outcome(ctx));
        }
        let Some(entry) = ctx.current_entry().cloned() else {
            return Ok(self.complete(ctx));
        };
        let behavior = self.planner.registry().resolve(&entry.stage().kind)?;
        let challenge = behavior.present(entry.stage(), ctx).await?;
        Ok(Outcome::Challenge { challenge })
    }

    /// Abort the execution. Aborting a finished execution changes nothing.
    pub fn abort(&self, ctx: &mut ExecutionContext) -> Outcome {
        if !ctx.is_terminal() {
            ctx.status = ExecutionStatus::Aborted;
            ctx.touch();
            info!(session = %ctx.session_id, flow = %ctx.flow_slug, "Execution aborted");
            self.publish(FlowEvent::FlowAborted {
                session: ctx.session_id.clone(),
                flow: ctx.flow_slug.clone(),
            });
        }
        terminal_outcome(ctx)
    }

    /// Move onto the stage under the cursor: re-check its policies if the
    /// binding asks for it, then present it.
    async fn enter(&self, ctx: &mut ExecutionContext) -> Result<Outcome> {
        let Some(entry) = ctx.current_entry().cloned() else {
            return Ok(self.complete(ctx));
        };
        let stage = entry.stage();

        if entry.re_evaluate() {
            let passing = match self.planner.evaluate(&entry.binding.policies, &ctx.view()).await {
                Ok(verdict) => verdict.passing,
                Err(e) => {
                    warn!(session = %ctx.session_id, stage = %stage.name, error = %e, "Policy re-evaluation failed");
                    false
                }
            };
            if !passing {
                info!(session = %ctx.session_id, stage = %stage.name, "Stage denied on re-evaluation");
                ctx.status = ExecutionStatus::Denied;
                self.publish(FlowEvent::FlowDenied {
                    session: Some(ctx.session_id.clone()),
                    flow: ctx.flow_slug.clone(),
                });
                return Ok(terminal_outcome(ctx));
            }
        }

        let behavior = self.planner.registry().resolve(&stage.kind)?;
        let challenge = behavior.present(stage, ctx).await?;
        ctx.touch();
        self.publish(FlowEvent::StagePresented {
            session: ctx.session_id.clone(),
            stage: stage.name.clone(),
        });
        Ok(Outcome::Challenge { challenge })
    }

    fn complete(&self, ctx: &mut ExecutionContext) -> Outcome {
        ctx.status = ExecutionStatus::Completed;
        ctx.touch();
        info!(session = %ctx.session_id, flow = %ctx.flow_slug, "Flow completed");
        self.publish(FlowEvent::FlowCompleted {
            session: ctx.session_id.clone(),
            flow: ctx.flow_slug.clone(),
        });
        terminal_outcome(ctx)
    }

    fn fail(&self, ctx: &mut ExecutionContext) -> Outcome {
        ctx.status = ExecutionStatus::Failed;
        self.publish(FlowEvent::FlowFailed {
            session: ctx.session_id.clone(),
            flow: ctx.flow_slug.clone(),
        });
        terminal_outcome(ctx)
    }

    fn expire_if_idle(&self, ctx: &mut ExecutionContext) -> bool {
        if ctx.is_terminal() || !ctx.idle_longer_than(self.session_timeout, Utc::now()) {
            return false;
        }
        ctx.status = ExecutionStatus::Expired;
        info!(session = %ctx.session_id, flow = %ctx.flow_slug, "Execution expired");
        self.publish(FlowEvent::FlowExpired {
            session: ctx.session_id.clone(),
            flow: ctx.flow_slug.clone(),
        });
        true
    }

    fn publish(&self, event: FlowEvent) {
        self.planner.event_bus().publish(event);
    }
}

fn invalid_transition(action: &str, status: ExecutionStatus) -> FlowError {
    FlowError::InvalidTransition {
        action: action.to_string(),
        status: status.to_string(),
    }
}

/// Outcome for an execution that has stopped.
fn terminal_outcome(ctx: &ExecutionContext) -> Outcome {
    let message = match ctx.status {
        ExecutionStatus::Completed => {
            return Outcome::Completed {
                data: ctx.data.clone(),
            }
        }
        ExecutionStatus::Denied | ExecutionStatus::Expired => FLOW_CANNOT_CONTINUE,
        ExecutionStatus::Failed => FLOW_FAILED,
        ExecutionStatus::Aborted => FLOW_ABORTED,
        // not terminal; callers never get here
        ExecutionStatus::Pending | ExecutionStatus::InProgress => FLOW_CANNOT_CONTINUE,
    };
    Outcome::Stopped {
        status: ctx.status,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::event::EventBus;
    use flowgate_core::policy::{Policy, PolicySet};
    use flowgate_core::{Flow, FlowStageBinding, PlanContext, SessionId};
    use flowgate_stages::StageRegistry;
    use flowgate_store::{FlowAdmin, InMemoryFlowStore};
    use flowgate_test_utils::{login_flow, recording_binding, RecordingEvaluator, RecordingStage};
    use serde_json::json;

    use crate::cache::PlanCache;

    struct Harness {
        stage: RecordingStage,
        evaluator: Arc<RecordingEvaluator>,
        executor: FlowExecutor,
    }

    fn harness(flow: Flow, bindings: Vec<FlowStageBinding>) -> Harness {
        let store = Arc::new(InMemoryFlowStore::new());
        store.put_flow(&flow, &bindings).unwrap();
        let stage = RecordingStage::new();
        let mut registry = StageRegistry::new();
        registry.register(stage.clone());
        let evaluator = Arc::new(RecordingEvaluator::new());
        let planner = FlowPlanner::new(
            store,
            Arc::new(registry),
            evaluator.clone(),
            Arc::new(PlanCache::default()),
            Arc::new(EventBus::default()),
        );
        let executor = FlowExecutor::new(Arc::new(planner), &EngineConfig::default());
        Harness {
            stage,
            evaluator,
            executor,
        }
    }

    fn execution(flow: &str, request: PlanContext) -> ExecutionContext {
        ExecutionContext::new(SessionId::new(), flow, request)
    }

    fn stage_name(outcome: &Outcome) -> &str {
        match outcome {
            Outcome::Challenge { challenge } => &challenge.stage,
            other => panic!("expected a challenge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_plan_completes_immediately() {
        let h = harness(Flow::new("empty", "Empty"), Vec::new());
        let mut ctx = execution("empty", PlanContext::new());
        let outcome = h.executor.start(&mut ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed { .. }));
        assert_eq!(ctx.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn trusted_login_completes_in_two_advances() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let mut ctx = execution("login", PlanContext::new().with_attribute("device", json!("trusted")));

        let first = h.executor.start(&mut ctx).await.unwrap();
        assert_eq!(stage_name(&first), "identification");

        let second = h.executor.submit(&mut ctx, json!({"user": "alice"})).await.unwrap();
        assert_eq!(stage_name(&second), "password");

        let done = h.executor.submit(&mut ctx, json!({})).await.unwrap();
        match done {
            Outcome::Completed { data } => assert_eq!(data["user"], json!("alice")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(h.stage.presented(), vec!["identification", "password"]);
    }

    #[tokio::test]
    async fn re_evaluation_denies_before_present() {
        let guarded = recording_binding("f", "mfa-bypass", 20)
            .re_evaluate_policies(true)
            .with_policies(PolicySet::single(Policy::expression(
                "trusted-only",
                r#"device == "trusted""#,
            )));
        let h = harness(
            Flow::new("f", "F"),
            vec![recording_binding("f", "identification", 10), guarded],
        );
        let mut ctx = execution("f", PlanContext::new().with_attribute("device", json!("trusted")));

        h.executor.start(&mut ctx).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::InProgress);

        let outcome = h
            .executor
            .submit(&mut ctx, json!({"device": "untrusted"}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Stopped {
                status: ExecutionStatus::Denied,
                message: FLOW_CANNOT_CONTINUE.to_string(),
            }
        );
        assert_eq!(ctx.status, ExecutionStatus::Denied);
        assert_eq!(h.stage.presented(), vec!["identification"]);
        // once at planning, once at the pre-check
        assert_eq!(h.evaluator.seen(), vec!["trusted-only", "trusted-only"]);
    }

    #[tokio::test]
    async fn re_evaluation_applies_to_first_stage() {
        let guarded = recording_binding("f", "only", 0)
            .evaluate_on_plan(false)
            .re_evaluate_policies(true)
            .with_policies(PolicySet::single(Policy::deny("closed")));
        let h = harness(Flow::new("f", "F"), vec![guarded]);
        let mut ctx = execution("f", PlanContext::new());
        let outcome = h.executor.start(&mut ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Stopped { status: ExecutionStatus::Denied, .. }));
        assert!(h.stage.presented().is_empty());
    }

    #[tokio::test]
    async fn stage_errors_count_against_retries() {
        let h = harness(Flow::new("f", "F"), vec![recording_binding("f", "lookup", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();

        let retries = EngineConfig::default().max_stage_retries;
        for attempt in 1..=retries {
            match h.executor.submit(&mut ctx, json!("error")).await.unwrap() {
                Outcome::Challenge { challenge } => {
                    assert_eq!(challenge.stage, "lookup");
                    assert_eq!(challenge.errors, vec![STAGE_ERROR.to_string()]);
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
            assert_eq!(ctx.attempts, attempt);
        }

        let outcome = h.executor.submit(&mut ctx, json!("error")).await.unwrap();
        assert!(matches!(outcome, Outcome::Stopped { status: ExecutionStatus::Failed, .. }));
        assert_eq!(ctx.status, ExecutionStatus::Failed);
        let rendered = serde_json::to_string(&outcome).unwrap();
        assert!(!rendered.contains("backend unavailable"));
    }

    #[tokio::test]
    async fn denial_at_planning_is_opaque() {
        let flow = Flow::new("f", "F").with_policies(PolicySet::single(Policy::deny("secret-rule")));
        let h = harness(flow, vec![recording_binding("f", "a", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        let outcome = h.executor.start(&mut ctx).await.unwrap();
        let rendered = serde_json::to_string(&outcome).unwrap();
        assert!(!rendered.contains("secret-rule"));
        assert!(rendered.contains(FLOW_CANNOT_CONTINUE));
        assert_eq!(ctx.status, ExecutionStatus::Denied);
    }

    #[tokio::test]
    async fn invalid_input_re_presents_until_retry_limit() {
        let h = harness(Flow::new("f", "F"), vec![recording_binding("f", "a", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();

        for attempt in 1..=3 {
            match h.executor.submit(&mut ctx, json!("fail")).await.unwrap() {
                Outcome::Challenge { challenge } => {
                    assert_eq!(challenge.stage, "a");
                    assert_eq!(challenge.errors.len(), 1);
                }
                other => panic!("attempt {}: unexpected {:?}", attempt, other),
            }
            assert_eq!(ctx.attempts, attempt);
            assert_eq!(ctx.cursor, 0);
        }

        let outcome = h.executor.submit(&mut ctx, json!("fail")).await.unwrap();
        assert!(matches!(outcome, Outcome::Stopped { status: ExecutionStatus::Failed, .. }));
    }

    #[tokio::test]
    async fn successful_submit_resets_attempts() {
        let h = harness(
            Flow::new("f", "F"),
            vec![recording_binding("f", "a", 0), recording_binding("f", "b", 1)],
        );
        let mut ctx = execution("f", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();
        h.executor.submit(&mut ctx, json!("fail")).await.unwrap();
        assert_eq!(ctx.attempts, 1);
        h.executor.submit(&mut ctx, json!({})).await.unwrap();
        assert_eq!(ctx.attempts, 0);
        assert_eq!(ctx.cursor, 1);
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let h = harness(Flow::new("f", "F"), vec![recording_binding("f", "a", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();

        let aborted = h.executor.abort(&mut ctx);
        assert!(aborted.is_terminal());
        assert_eq!(ctx.status, ExecutionStatus::Aborted);

        // further calls return the same terminal outcome
        assert_eq!(h.executor.submit(&mut ctx, json!({})).await.unwrap(), aborted);
        assert_eq!(h.executor.abort(&mut ctx), aborted);
        assert_eq!(ctx.status, ExecutionStatus::Aborted);
        assert!(h.executor.start(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn abort_after_completion_is_a_no_op() {
        let h = harness(Flow::new("empty", "Empty"), Vec::new());
        let mut ctx = execution("empty", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();
        h.executor.abort(&mut ctx);
        assert_eq!(ctx.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let h = harness(Flow::new("f", "F"), vec![recording_binding("f", "a", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        let err = h.executor.submit(&mut ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn idle_execution_expires() {
        let h = harness(Flow::new("f", "F"), vec![recording_binding("f", "a", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();
        ctx.last_active = Utc::now() - chrono::Duration::hours(1);

        let outcome = h.executor.submit(&mut ctx, json!({})).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Stopped {
                status: ExecutionStatus::Expired,
                message: FLOW_CANNOT_CONTINUE.to_string(),
            }
        );
        assert_eq!(ctx.cursor, 0);
    }

    #[tokio::test]
    async fn current_re_presents_without_advancing() {
        let h = harness(Flow::new("f", "F"), vec![recording_binding("f", "a", 0)]);
        let mut ctx = execution("f", PlanContext::new());
        h.executor.start(&mut ctx).await.unwrap();
        let again = h.executor.current(&mut ctx).await.unwrap();
        assert_eq!(stage_name(&again), "a");
        assert_eq!(ctx.cursor, 0);
        assert_eq!(ctx.status, ExecutionStatus::InProgress);
    }

    #[tokio::test]
    async fn executions_share_plan_but_not_cursor() {
        let (flow, bindings) = login_flow();
        let h = harness(flow, bindings);
        let request = PlanContext::new().with_attribute("device", json!("trusted"));
        let mut a = execution("login", request.clone());
        let mut b = execution("login", request);

        h.executor.start(&mut a).await.unwrap();
        h.executor.start(&mut b).await.unwrap();
        h.executor.submit(&mut a, json!({})).await.unwrap();

        assert!(Arc::ptr_eq(a.plan.as_ref().unwrap(), b.plan.as_ref().unwrap()));
        assert_eq!(a.cursor, 1);
        assert_eq!(b.cursor, 0);
    }
}
