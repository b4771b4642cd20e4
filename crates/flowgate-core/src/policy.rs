use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat key/value view of a request that policies are evaluated against.
pub type PolicyContext = HashMap<String, serde_json::Value>;

/// How the results of a policy set are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEngineMode {
    /// Every enabled binding must pass.
    #[default]
    All,
    /// At least one enabled binding must pass.
    Any,
}

impl fmt::Display for PolicyEngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// The rule a policy applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyKind {
    /// Fixed result, optionally after a delay.
    Static {
        result: bool,
        #[serde(default)]
        wait_secs: u64,
    },
    /// Expression evaluated against the request context.
    /// See `flowgate_policy::expression` for the grammar.
    Expression { expr: String },
}

/// A named rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub kind: PolicyKind,
}

impl Policy {
    pub fn new(name: impl Into<String>, kind: PolicyKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
        }
    }

    pub fn allow(name: impl Into<String>) -> Self {
        Self::new(
            name,
            PolicyKind::Static {
                result: true,
                wait_secs: 0,
            },
        )
    }

    pub fn deny(name: impl Into<String>) -> Self {
        Self::new(
            name,
            PolicyKind::Static {
                result: false,
                wait_secs: 0,
            },
        )
    }

    pub fn expression(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::new(name, PolicyKind::Expression { expr: expr.into() })
    }
}

/// A policy attached to a flow or binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub policy: Policy,
    #[serde(default)]
    pub order: i32,
    /// Invert the policy's result.
    #[serde(default)]
    pub negate: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-policy timeout in seconds. A timed-out policy does not pass.
    #[serde(default = "default_policy_timeout")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_policy_timeout() -> u64 {
    30
}

impl PolicyBinding {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            order: 0,
            negate: false,
            enabled: true,
            timeout_secs: default_policy_timeout(),
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// An ordered set of policy bindings plus the mode combining them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub mode: PolicyEngineMode,
    #[serde(default)]
    pub bindings: Vec<PolicyBinding>,
}

impl PolicySet {
    pub fn new(mode: PolicyEngineMode) -> Self {
        Self {
            mode,
            bindings: Vec::new(),
        }
    }

    /// A set of one policy.
    pub fn single(policy: Policy) -> Self {
        Self::default().with(PolicyBinding::new(policy))
    }

    pub fn with(mut self, binding: PolicyBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Whether no enabled binding remains (such sets always pass).
    pub fn is_empty(&self) -> bool {
        !self.bindings.iter().any(|b| b.enabled)
    }

    /// Enabled bindings in evaluation order.
    pub fn active(&self) -> Vec<&PolicyBinding> {
        let mut active: Vec<&PolicyBinding> = self.bindings.iter().filter(|b| b.enabled).collect();
        active.sort_by_key(|b| b.order);
        active
    }
}

/// Outcome of a single policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy: String,
    pub passing: bool,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl PolicyResult {
    pub fn new(policy: impl Into<String>, passing: bool) -> Self {
        Self {
            policy: policy.into(),
            passing,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// Aggregate outcome of a policy set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub passing: bool,
    pub results: Vec<PolicyResult>,
}

impl PolicyVerdict {
    /// Combine per-policy results according to `mode`.
    /// No results means nothing objected, so the verdict passes.
    pub fn aggregate(mode: PolicyEngineMode, results: Vec<PolicyResult>) -> Self {
        let passing = if results.is_empty() {
            true
        } else {
            match mode {
                PolicyEngineMode::All => results.iter().all(|r| r.passing),
                PolicyEngineMode::Any => results.iter().any(|r| r.passing),
            }
        };
        Self { passing, results }
    }

    pub fn allow() -> Self {
        Self {
            passing: true,
            results: Vec::new(),
        }
    }
}
