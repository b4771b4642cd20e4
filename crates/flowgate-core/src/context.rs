use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{Plan, PlanEntry};
use crate::types::SessionId;

/// Context key holding the user being authenticated.
pub const PENDING_USER: &str = "pending_user";
/// Context key holding the application the flow was entered for.
pub const APPLICATION: &str = "application";
/// Context key holding the client address.
pub const SOURCE_IP: &str = "source_ip";

/// Request context used to build a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanContext {
    #[serde(default)]
    pub pending_user: Option<String>,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    /// Anything else policies may look at (e.g. device trust).
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl PlanContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.pending_user = Some(user.into());
        self
    }

    pub fn with_application(mut self, app: impl Into<String>) -> Self {
        self.application = Some(app.into());
        self
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Flat key/value view handed to policies.
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map: HashMap<String, serde_json::Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(ref user) = self.pending_user {
            map.insert(PENDING_USER.to_string(), serde_json::Value::String(user.clone()));
        }
        if let Some(ref app) = self.application {
            map.insert(APPLICATION.to_string(), serde_json::Value::String(app.clone()));
        }
        if let Some(ref ip) = self.source_ip {
            map.insert(SOURCE_IP.to_string(), serde_json::Value::String(ip.clone()));
        }
        map
    }

    /// Canonical document of every field a plan-time policy can observe.
    /// Key order is stable, so equal contexts serialize identically.
    pub fn fingerprint_document(&self) -> serde_json::Value {
        serde_json::json!({
            "pending_user": self.pending_user,
            "application": self.application,
            "source_ip": self.source_ip,
            "attributes": self.attributes,
        })
    }
}

/// Lifecycle of one flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    /// A re-evaluated binding policy no longer passes.
    Denied,
    /// A stage gave up (retry limit exceeded or stage-defined failure).
    Failed,
    Aborted,
    Expired,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Denied => "denied",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Per-session state of a flow execution.
///
/// The plan body is shared; `cursor`, `attempts` and `data` belong to this
/// execution only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub session_id: SessionId,
    pub flow_slug: String,
    pub request: PlanContext,
    #[serde(default)]
    pub plan: Option<Arc<Plan>>,
    #[serde(default)]
    pub cursor: usize,
    /// Failed attempts at the current stage.
    #[serde(default)]
    pub attempts: u32,
    /// Data accumulated from completed stages.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(session_id: SessionId, flow_slug: impl Into<String>, request: PlanContext) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            flow_slug: flow_slug.into(),
            request,
            plan: None,
            cursor: 0,
            attempts: 0,
            data: HashMap::new(),
            status: ExecutionStatus::Pending,
            created_at: now,
            last_active: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Plan entry under the cursor, if any.
    pub fn current_entry(&self) -> Option<&PlanEntry> {
        self.plan.as_ref().and_then(|p| p.get(self.cursor))
    }

    /// Number of stages left, including the current one.
    pub fn remaining(&self) -> usize {
        self.plan
            .as_ref()
            .map(|p| p.len().saturating_sub(self.cursor))
            .unwrap_or(0)
    }

    /// The request context overlaid with everything stages wrote so far.
    pub fn view(&self) -> HashMap<String, serde_json::Value> {
        let mut map = self.request.to_map();
        for (k, v) in &self.data {
            map.insert(k.clone(), v.clone());
        }
        map
    }

    /// Look up a key in the current view.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data
            .get(key)
            .cloned()
            .or_else(|| self.request.to_map().remove(key))
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn merge(&mut self, updates: HashMap<String, serde_json::Value>) {
        self.data.extend(updates);
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Whether the execution has been idle longer than `timeout` at `now`.
    pub fn idle_longer_than(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_active) > timeout
    }
}
