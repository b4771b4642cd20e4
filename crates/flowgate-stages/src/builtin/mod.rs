//! Built-in stage kinds.
//!
//! Each stage reads its input as a JSON object; a bare JSON string is
//! accepted as the value of the stage's primary field.

pub mod authenticator;
pub mod consent;
pub mod control;
pub mod email;
pub mod identification;
pub mod login;
pub mod password;

use serde::de::DeserializeOwned;

use flowgate_core::context::PENDING_USER;
use flowgate_core::error::{FlowError, Result};
use flowgate_core::{ExecutionContext, Stage};

/// UI component name for a stage type identifier.
pub(crate) fn component(identifier: &str) -> String {
    format!("flowgate-stage-{}", identifier)
}

/// Read `field` from stage input, accepting a bare string as well.
pub(crate) fn input_str(input: &serde_json::Value, field: &str) -> Option<String> {
    match input {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
    .filter(|s| !s.is_empty())
}

/// Parse a stage's config. An absent config yields the defaults; anything
/// that does not deserialize is an `InvalidStageConfig` error.
pub(crate) fn parse_config<T: DeserializeOwned + Default>(stage: &Stage) -> Result<T> {
    if stage.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(stage.config.clone()).map_err(|e| invalid_config(stage, e))
}

pub(crate) fn invalid_config(stage: &Stage, message: impl std::fmt::Display) -> FlowError {
    FlowError::InvalidStageConfig {
        stage: stage.name.clone(),
        message: message.to_string(),
    }
}

/// The user the flow is currently authenticating, if identified.
pub(crate) fn pending_user(ctx: &ExecutionContext) -> Option<String> {
    ctx.get_str(PENDING_USER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        retries: u32,
    }

    #[test]
    fn parse_config_defaults_and_rejects() {
        let stage = Stage::new("s", "dummy");
        assert_eq!(parse_config::<Sample>(&stage).unwrap(), Sample::default());

        let stage = Stage::new("s", "dummy").with_config(json!({"retries": 2}));
        assert_eq!(parse_config::<Sample>(&stage).unwrap().retries, 2);

        let stage = Stage::new("s", "dummy").with_config(json!({"retries": "many"}));
        match parse_config::<Sample>(&stage) {
            Err(FlowError::InvalidStageConfig { stage, .. }) => assert_eq!(stage, "s"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn input_str_accepts_object_and_bare_string() {
        assert_eq!(
            input_str(&json!({"password": " hunter2"}), "password").as_deref(),
            Some(" hunter2")
        );
        assert_eq!(input_str(&json!("alice"), "uid_field").as_deref(), Some("alice"));
        assert_eq!(input_str(&json!({"other": "x"}), "password"), None);
        assert_eq!(input_str(&json!({"password": ""}), "password"), None);
        assert_eq!(input_str(&json!(42), "password"), None);
    }
}
