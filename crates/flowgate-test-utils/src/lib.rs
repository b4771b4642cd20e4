//! Shared test doubles and fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use flowgate_core::error::{FlowError, Result};
use flowgate_core::policy::{Policy, PolicyContext, PolicySet, PolicyVerdict};
use flowgate_core::traits::{PolicyEvaluator, StageBehavior, UserDirectory};
use flowgate_core::{
    Challenge, ExecutionContext, Flow, FlowStageBinding, Stage, StageResult, User,
};
use flowgate_policy::PolicyEngine;

// ── StaticDirectory ─────────────────────────────────────────────

/// In-memory user directory with plaintext passwords.
#[derive(Default, Clone)]
pub struct StaticDirectory {
    users: HashMap<String, User>,
}

impl StaticDirectory {
    pub fn with_user(mut self, username: &str, email: Option<&str>, password: &str) -> Self {
        self.users.insert(
            username.to_string(),
            User {
                id: format!("id-{}", username),
                username: username.to_string(),
                email: email.map(str::to_string),
                password_hash: password.to_string(),
                active: true,
                attributes: HashMap::new(),
            },
        );
        self
    }

    pub fn with_inactive_user(self, username: &str) -> Self {
        let mut dir = self.with_user(username, None, "");
        if let Some(u) = dir.users.get_mut(username) {
            u.active = false;
        }
        dir
    }

    pub fn with_attribute(mut self, username: &str, key: &str, value: serde_json::Value) -> Self {
        if let Some(u) = self.users.get_mut(username) {
            u.attributes.insert(key.to_string(), value);
        }
        self
    }
}

impl UserDirectory for StaticDirectory {
    fn find_user(&self, identifier: &str) -> BoxFuture<'_, Result<Option<User>>> {
        let found = self
            .users
            .values()
            .find(|u| u.username == identifier || u.email.as_deref() == Some(identifier))
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> BoxFuture<'_, Result<Option<User>>> {
        let found = self
            .users
            .get(username)
            .filter(|u| u.active && u.password_hash == password)
            .cloned();
        Box::pin(async move { Ok(found) })
    }
}

// ── RecordingEvaluator ──────────────────────────────────────────

/// Real policy engine that records the name of every policy it was asked
/// to evaluate.
#[derive(Default)]
pub struct RecordingEvaluator {
    inner: PolicyEngine,
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl RecordingEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all policies evaluated so far, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn saw(&self, policy: &str) -> bool {
        self.seen().iter().any(|p| p == policy)
    }

    /// Number of `evaluate` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PolicyEvaluator for RecordingEvaluator {
    fn evaluate<'a>(
        &'a self,
        set: &'a PolicySet,
        request: &'a PolicyContext,
    ) -> BoxFuture<'a, Result<PolicyVerdict>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .extend(set.bindings.iter().map(|b| b.policy.name.clone()));
        self.inner.evaluate(set, request)
    }
}

// ── FailingEvaluator ────────────────────────────────────────────

/// Evaluator that errors for every non-empty set.
#[derive(Default)]
pub struct FailingEvaluator;

impl PolicyEvaluator for FailingEvaluator {
    fn evaluate<'a>(
        &'a self,
        set: &'a PolicySet,
        _request: &'a PolicyContext,
    ) -> BoxFuture<'a, Result<PolicyVerdict>> {
        Box::pin(async move {
            if set.is_empty() {
                return Ok(PolicyVerdict::allow());
            }
            Err(FlowError::PolicyEvaluation("evaluator unavailable".into()))
        })
    }
}

// ── RecordingStage ──────────────────────────────────────────────

/// Stage that records every `present` call and completes by writing its
/// input object into the execution context. Input `"fail"` makes it
/// invalid and `"error"` makes `process` return an error, so retry handling
/// can be exercised.
#[derive(Clone, Default)]
pub struct RecordingStage {
    presented: Arc<Mutex<Vec<String>>>,
}

impl RecordingStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of stages presented so far.
    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().unwrap().clone()
    }
}

impl StageBehavior for RecordingStage {
    fn type_name(&self) -> &'static str {
        "RecordingStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Recording Stage"
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        self.presented.lock().unwrap().push(stage.name.clone());
        Box::pin(async move { Ok(Challenge::new("flowgate-stage-recording", &stage.name)) })
    }

    fn process<'a>(
        &'a self,
        _stage: &'a Stage,
        _ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            match input {
                serde_json::Value::String(s) if s == "fail" => {
                    Ok(StageResult::invalid("recording stage rejected input"))
                }
                serde_json::Value::String(s) if s == "error" => {
                    Err(FlowError::Database("backend unavailable".into()))
                }
                serde_json::Value::Object(map) => Ok(StageResult::Complete {
                    data: map.into_iter().collect(),
                }),
                _ => Ok(StageResult::complete()),
            }
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Binding of a `recording` stage with an optional policy set.
pub fn recording_binding(flow: &str, name: &str, order: i32) -> FlowStageBinding {
    FlowStageBinding::new(flow, Stage::new(name, "recording"), order)
}

/// The `login` flow: identification (10), password (20) and an MFA stage
/// (30) that is skipped for trusted devices. All stages are `recording`.
pub fn login_flow() -> (Flow, Vec<FlowStageBinding>) {
    let flow = Flow::new("login", "Login");
    let bindings = vec![
        recording_binding("login", "identification", 10)
            .with_policies(PolicySet::single(Policy::allow("always-allow"))),
        recording_binding("login", "password", 20)
            .with_policies(PolicySet::single(Policy::allow("always-allow"))),
        recording_binding("login", "mfa", 30).with_policies(PolicySet::single(
            Policy::expression("deny-if-trusted-device", r#"not device == "trusted""#),
        )),
    ];
    (flow, bindings)
}
