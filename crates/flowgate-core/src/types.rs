use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::PolicySet;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a flow is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDesignation {
    #[default]
    Authentication,
    Authorization,
    Invalidation,
    Enrollment,
    Unenrollment,
    Recovery,
    StageConfiguration,
}

impl fmt::Display for FlowDesignation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Invalidation => "invalidation",
            Self::Enrollment => "enrollment",
            Self::Unenrollment => "unenrollment",
            Self::Recovery => "recovery",
            Self::StageConfiguration => "stage_configuration",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FlowDesignation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "authentication" => Ok(Self::Authentication),
            "authorization" => Ok(Self::Authorization),
            "invalidation" => Ok(Self::Invalidation),
            "enrollment" => Ok(Self::Enrollment),
            "unenrollment" => Ok(Self::Unenrollment),
            "recovery" => Ok(Self::Recovery),
            "stage_configuration" => Ok(Self::StageConfiguration),
            other => Err(format!("unknown flow designation: {}", other)),
        }
    }
}

/// A named, ordered process composed of stages.
///
/// Flows are never mutated by the engine. Every administrative change to the
/// flow or to one of its bindings bumps `version`, which is what cached plans
/// are validated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub designation: FlowDesignation,
    /// Background asset reference shown by the UI.
    #[serde(default)]
    pub background: Option<String>,
    /// Policies gating entry into the flow itself.
    #[serde(default)]
    pub policies: PolicySet,
    #[serde(default)]
    pub version: u64,
}

impl Flow {
    pub fn new(slug: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            slug: slug.into(),
            title: name.clone(),
            name,
            designation: FlowDesignation::default(),
            background: None,
            policies: PolicySet::default(),
            version: 1,
        }
    }

    pub fn with_designation(mut self, designation: FlowDesignation) -> Self {
        self.designation = designation;
        self
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }
}

/// A stage template. The `kind` selects the behavior in the stage registry;
/// `config` is interpreted by that behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Stage {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: kind.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Binds a stage into a flow at a given position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStageBinding {
    pub id: Uuid,
    /// Slug of the flow this binding belongs to.
    pub target: String,
    pub stage: Stage,
    pub order: i32,
    /// Check this binding's policies while the plan is built.
    #[serde(default = "default_true")]
    pub evaluate_on_plan: bool,
    /// Check this binding's policies again right before the stage runs.
    #[serde(default)]
    pub re_evaluate_policies: bool,
    #[serde(default)]
    pub policies: PolicySet,
}

fn default_true() -> bool {
    true
}

impl FlowStageBinding {
    pub fn new(target: impl Into<String>, stage: Stage, order: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            stage,
            order,
            evaluate_on_plan: true,
            re_evaluate_policies: false,
            policies: PolicySet::default(),
        }
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    pub fn evaluate_on_plan(mut self, value: bool) -> Self {
        self.evaluate_on_plan = value;
        self
    }

    pub fn re_evaluate_policies(mut self, value: bool) -> Self {
        self.re_evaluate_policies = value;
        self
    }

    /// Total ordering key: `order`, then binding id.
    pub fn sort_key(&self) -> (i32, Uuid) {
        (self.order, self.id)
    }
}

/// A directory user, as seen by identification and password stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Argon2id hash in PHC string format.
    #[serde(default)]
    pub password_hash: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}
