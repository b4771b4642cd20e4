use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use flowgate_core::error::Result;
use flowgate_core::traits::{StageBehavior, UserDirectory};
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::{component, input_str, pending_user};

/// Context key recording how the user authenticated.
pub const AUTH_METHOD: &str = "auth_method";

/// Verifies the pending user's password.
pub struct PasswordStage {
    directory: Arc<dyn UserDirectory>,
}

impl PasswordStage {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }
}

impl StageBehavior for PasswordStage {
    fn type_name(&self) -> &'static str {
        "PasswordStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Password Stage"
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move {
            let mut challenge = Challenge::new(component("password"), &stage.name)
                .with_title("Password")
                .with_fields(&["password"]);
            if let Some(user) = pending_user(ctx) {
                challenge = challenge.with_extra(serde_json::json!({ "pending_user": user }));
            }
            Ok(challenge)
        })
    }

    fn process<'a>(
        &'a self,
        stage: &'a Stage,
        ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            let Some(username) = pending_user(ctx) else {
                warn!(stage = %stage.name, "Password stage reached without a pending user");
                return Ok(StageResult::fail("No pending user."));
            };
            let Some(password) = input_str(&input, "password") else {
                return Ok(StageResult::invalid("This field is required."));
            };

            match self.directory.authenticate(&username, &password).await? {
                Some(_) => Ok(StageResult::Complete {
                    data: HashMap::from([(
                        AUTH_METHOD.to_string(),
                        serde_json::Value::String("password".into()),
                    )]),
                }),
                None => {
                    debug!(stage = %stage.name, "Password rejected");
                    Ok(StageResult::invalid("Invalid password"))
                }
            }
        })
    }
}
