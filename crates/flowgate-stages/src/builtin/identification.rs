use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flowgate_core::context::PENDING_USER;
use flowgate_core::error::Result;
use flowgate_core::traits::{StageBehavior, UserDirectory};
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::{component, input_str, invalid_config, parse_config};

/// Generic message for unknown or disabled users, so the stage does not
/// reveal which accounts exist.
const FAILED_MESSAGE: &str = "Failed to authenticate.";

#[derive(Debug, Deserialize)]
struct IdentificationConfig {
    /// Which user fields may be used to identify: `username`, `email`.
    #[serde(default = "default_user_fields")]
    user_fields: Vec<String>,
}

fn default_user_fields() -> Vec<String> {
    vec!["username".to_string(), "email".to_string()]
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            user_fields: default_user_fields(),
        }
    }
}

impl IdentificationConfig {
    fn from_stage(stage: &Stage) -> Result<Self> {
        let config: Self = parse_config(stage)?;
        if config.user_fields.is_empty() {
            return Err(invalid_config(stage, "user_fields must not be empty"));
        }
        if let Some(field) = config
            .user_fields
            .iter()
            .find(|f| !matches!(f.as_str(), "username" | "email"))
        {
            return Err(invalid_config(stage, format!("unknown user field '{}'", field)));
        }
        Ok(config)
    }

    fn allows(&self, field: &str) -> bool {
        self.user_fields.iter().any(|f| f == field)
    }
}

/// Asks for a username or email and records the matching user as
/// `pending_user`.
pub struct IdentificationStage {
    directory: Arc<dyn UserDirectory>,
}

impl IdentificationStage {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }
}

impl StageBehavior for IdentificationStage {
    fn type_name(&self) -> &'static str {
        "IdentificationStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Identification Stage"
    }

    fn validate(&self, stage: &Stage) -> Result<()> {
        IdentificationConfig::from_stage(stage).map(|_| ())
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move {
            let config = IdentificationConfig::from_stage(stage)?;
            Ok(Challenge::new(component("identification"), &stage.name)
                .with_title("Log in")
                .with_fields(&["uid_field"])
                .with_extra(serde_json::json!({ "user_fields": config.user_fields })))
        })
    }

    fn process<'a>(
        &'a self,
        stage: &'a Stage,
        _ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            let Some(uid) = input_str(&input, "uid_field") else {
                return Ok(StageResult::invalid("This field is required."));
            };
            let uid = uid.trim();
            let config = IdentificationConfig::from_stage(stage)?;

            let Some(user) = self.directory.find_user(uid).await? else {
                debug!(stage = %stage.name, "No user matched identifier");
                return Ok(StageResult::invalid(FAILED_MESSAGE));
            };

            let by_username = user.username == uid && config.allows("username");
            let by_email = user.email.as_deref() == Some(uid) && config.allows("email");
            if !(by_username || by_email) || !user.active {
                return Ok(StageResult::invalid(FAILED_MESSAGE));
            }

            Ok(StageResult::Complete {
                data: HashMap::from([(
                    PENDING_USER.to_string(),
                    serde_json::Value::String(user.username),
                )]),
            })
        })
    }
}
