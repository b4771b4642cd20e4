use futures::future::BoxFuture;

use flowgate_core::error::Result;
use flowgate_core::traits::StageBehavior;
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::component;

// ── DenyStage ───────────────────────────────────────────────────

/// Stops the flow. Useful behind a policy that selects who may not continue.
pub struct DenyStage;

impl StageBehavior for DenyStage {
    fn type_name(&self) -> &'static str {
        "DenyStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Deny Stage"
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move {
            Ok(Challenge::new(component("deny"), &stage.name).with_title("Permission denied"))
        })
    }

    fn process<'a>(
        &'a self,
        _stage: &'a Stage,
        _ctx: &'a ExecutionContext,
        _input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move { Ok(StageResult::fail("Permission denied")) })
    }
}

// ── DummyStage ──────────────────────────────────────────────────

/// Completes on any input.
pub struct DummyStage;

impl StageBehavior for DummyStage {
    fn type_name(&self) -> &'static str {
        "DummyStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Dummy Stage"
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move { Ok(Challenge::new(component("dummy"), &stage.name)) })
    }

    fn process<'a>(
        &'a self,
        _stage: &'a Stage,
        _ctx: &'a ExecutionContext,
        _input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move { Ok(StageResult::complete()) })
    }
}
