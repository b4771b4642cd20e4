use futures::future::BoxFuture;

use flowgate_core::error::Result;
use flowgate_core::traits::StageBehavior;
use flowgate_core::{Challenge, ExecutionContext, Stage, StageResult};

use super::{component, invalid_config};

/// Context key set when the user gave consent.
pub const CONSENT_GIVEN: &str = "consent_given";

const DEFAULT_TEXT: &str = "Do you want to continue?";

/// Shows the configured consent text and requires explicit agreement.
pub struct ConsentStage;

impl ConsentStage {
    fn text(stage: &Stage) -> String {
        stage
            .config
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_TEXT)
            .to_string()
    }
}

impl StageBehavior for ConsentStage {
    fn type_name(&self) -> &'static str {
        "ConsentStage"
    }

    fn verbose_name(&self) -> &'static str {
        "Consent Stage"
    }

    fn validate(&self, stage: &Stage) -> Result<()> {
        match stage.config.get("text") {
            Some(text) if !text.is_string() => Err(invalid_config(stage, "text must be a string")),
            _ => Ok(()),
        }
    }

    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>> {
        Box::pin(async move {
            let mut extra = serde_json::json!({ "text": Self::text(stage) });
            if let Some(app) = &ctx.request.application {
                extra["application"] = serde_json::Value::String(app.clone());
            }
            Ok(Challenge::new(component("consent"), &stage.name)
                .with_title("Consent")
                .with_fields(&["consent"])
                .with_extra(extra))
        })
    }

    fn process<'a>(
        &'a self,
        _stage: &'a Stage,
        _ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            let given = match &input {
                serde_json::Value::Bool(b) => *b,
                other => other.get("consent").and_then(|v| v.as_bool()).unwrap_or(false),
            };
            if given {
                Ok(StageResult::complete_with(
                    CONSENT_GIVEN,
                    serde_json::Value::Bool(true),
                ))
            } else {
                Ok(StageResult::invalid("Consent is required to continue."))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::{PlanContext, SessionId};
    use serde_json::json;

    #[tokio::test]
    async fn shows_configured_text_and_application() {
        let stage = Stage::new("consent", "consent").with_config(json!({"text": "Share your email?"}));
        let ctx = ExecutionContext::new(
            SessionId::new(),
            "authz",
            PlanContext::new().with_application("grafana"),
        );
        let challenge = ConsentStage.present(&stage, &ctx).await.unwrap();
        assert_eq!(challenge.extra["text"], "Share your email?");
        assert_eq!(challenge.extra["application"], "grafana");
    }

    #[tokio::test]
    async fn requires_explicit_consent() {
        let stage = Stage::new("consent", "consent");
        let ctx = ExecutionContext::new(SessionId::new(), "authz", PlanContext::new());
        assert!(matches!(
            ConsentStage.process(&stage, &ctx, json!({})).await.unwrap(),
            StageResult::Invalid { .. }
        ));
        assert!(matches!(
            ConsentStage.process(&stage, &ctx, json!({"consent": false})).await.unwrap(),
            StageResult::Invalid { .. }
        ));
        assert_eq!(
            ConsentStage.process(&stage, &ctx, json!(true)).await.unwrap(),
            StageResult::complete_with(CONSENT_GIVEN, json!(true))
        );
    }

    #[test]
    fn text_must_be_a_string() {
        let bad = Stage::new("consent", "consent").with_config(json!({"text": 42}));
        assert!(ConsentStage.validate(&bad).is_err());
        assert!(ConsentStage.validate(&Stage::new("consent", "consent")).is_ok());
    }
}
