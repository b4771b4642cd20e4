use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What a stage asks the client to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// UI component to render, e.g. `flowgate-stage-password`.
    pub component: String,
    /// Name of the stage instance presenting the challenge.
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Input fields the client is expected to submit.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Validation errors from the previous attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Stage-specific extras (consent text, user hint, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl Challenge {
    pub fn new(component: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            stage: stage.into(),
            title: None,
            fields: Vec::new(),
            errors: Vec::new(),
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Result of processing client input for a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    /// The stage is done; `data` is merged into the execution context.
    Complete {
        data: HashMap<String, serde_json::Value>,
    },
    /// Input was rejected; the stage is presented again.
    Invalid { errors: Vec<String> },
    /// The stage cannot succeed for this execution.
    Fail { reason: String },
}

impl StageResult {
    pub fn complete() -> Self {
        Self::Complete {
            data: HashMap::new(),
        }
    }

    pub fn complete_with(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Complete {
            data: HashMap::from([(key.into(), value)]),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self::Invalid {
            errors: vec![error.into()],
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }
}
