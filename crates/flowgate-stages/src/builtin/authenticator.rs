use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use flowgate_core::error::Result;
use flowgate_core::traits::{StageBehavior, UserDirectory};
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::{component, input_str, parse_config, pending_user};

/// User attribute holding the code of the user's static authenticator.
pub const DEVICE_CODE_ATTRIBUTE: &str = "totp_code";
/// Context key set once a second factor was verified.
pub const MFA_VERIFIED: &str = "mfa_verified";

/// What to do when the user has no authenticator configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NotConfiguredAction {
    #[default]
    Skip,
    Deny,
}

#[derive(Debug, Default, Deserialize)]
struct AuthenticatorConfig {
    #[serde(default)]
    not_configured_action: NotConfiguredAction,
}

/// Validates a second factor against the pending user's authenticator.
pub struct AuthenticatorValidateStage {
    directory: Arc<dyn UserDirectory>,
}

impl AuthenticatorValidateStage {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    async fn device_code(&self, username: &str) -> Result<Option<String>> {
        Ok(self.directory.find_user(username).await?.and_then(|u| {
            u.attributes
                .get(DEVICE_CODE_ATTRIBUTE)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }))
    }
}

impl StageBehavior for AuthenticatorValidateStage {
    fn type_name(&self) -> &'static str {
        "AuthenticatorValidateStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Authenticator Validation Stage"
    }

    fn validate(&self, stage: &Stage) -> Result<()> {
        parse_config::<AuthenticatorConfig>(stage).map(|_| ())
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move {
            Ok(Challenge::new(component("authenticatorvalidate"), &stage.name)
                .with_title("Enter the code from your authenticator")
                .with_fields(&["code"]))
        })
    }

    fn process<'a>(
        &'a self,
        stage: &'a Stage,
        ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            let config: AuthenticatorConfig = parse_config(stage)?;

            let Some(username) = pending_user(ctx) else {
                return Ok(StageResult::fail("No pending user."));
            };
            let Some(expected) = self.device_code(&username).await? else {
                return Ok(match config.not_configured_action {
                    NotConfiguredAction::Skip => StageResult::complete(),
                    NotConfiguredAction::Deny => {
                        StageResult::fail("No authenticator configured.")
                    }
                });
            };

            match input_str(&input, "code") {
                Some(code) if code.trim() == expected => Ok(StageResult::Complete {
                    data: HashMap::from([(MFA_VERIFIED.to_string(), serde_json::Value::Bool(true))]),
                }),
                Some(_) => Ok(StageResult::invalid("Invalid code")),
                None => Ok(StageResult::invalid("This field is required.")),
            }
        })
    }
}
