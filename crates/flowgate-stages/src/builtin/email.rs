use futures::future::BoxFuture;

use flowgate_core::error::Result;
use flowgate_core::traits::StageBehavior;
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::{component, input_str};

/// Context key holding the one-time token sent to the user.
pub const EMAIL_TOKEN: &str = "email_token";
/// Context key set after the token was confirmed.
pub const EMAIL_VERIFIED: &str = "email_verified";

/// Confirms the user received the one-time token mailed to them.
///
/// Delivery is outside the engine: whoever sends the mail places the token
/// in the request attributes (or an earlier stage writes it) under
/// `email_token`.
pub struct EmailVerifyStage;

impl StageBehavior for EmailVerifyStage {
    fn type_name(&self) -> &'static str {
        "EmailVerifyStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Email Verification Stage"
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move {
            Ok(Challenge::new(component("emailverify"), &stage.name)
                .with_title("Check your email")
                .with_fields(&["token"]))
        })
    }

    fn process<'a>(
        &'a self,
        _stage: &'a Stage,
        ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            let Some(expected) = ctx.get_str(EMAIL_TOKEN) else {
                return Ok(StageResult::fail("No verification token was issued."));
            };
            match input_str(&input, "token") {
                Some(token) if token.trim() == expected => Ok(StageResult::complete_with(
                    EMAIL_VERIFIED,
                    serde_json::Value::Bool(true),
                )),
                _ => Ok(StageResult::invalid("Invalid or expired token.")),
            }
        })
    }
}
