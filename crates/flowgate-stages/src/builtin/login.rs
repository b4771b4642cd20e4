use std::collections::HashMap;

use futures::future::BoxFuture;

use flowgate_core::error::Result;
use flowgate_core::traits::StageBehavior;
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::{component, pending_user};

/// Context key set once the pending user is logged in.
pub const AUTHENTICATED: &str = "authenticated";

/// Logs the pending user in. Needs no input.
pub struct UserLoginStage;

impl StageBehavior for UserLoginStage {
    fn type_name(&self) -> &'static str {
        "UserLoginStage"
    }

    fn verbose_name(&self) -> &'static str {
        "User Login Stage"
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move { Ok(Challenge::new(component("userlogin"), &stage.name)) })
    }

    fn process<'a>(
        &'a self,
        _stage: &'a Stage,
        ctx: &'a ExecutionContext,
        _input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            let Some(user) = pending_user(ctx) else {
                return Ok(StageResult::fail("No pending user."));
            };
            Ok(StageResult::Complete {
                data: HashMap::from([
                    (AUTHENTICATED.to_string(), serde_json::Value::Bool(true)),
                    (
                        "authenticated_user".to_string(),
                        serde_json::Value::String(user),
                    ),
                ]),
            })
        })
    }
}
