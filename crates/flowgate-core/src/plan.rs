use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::PlanContext;
use crate::types::{FlowStageBinding, Stage};

/// One stage execution inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub binding: FlowStageBinding,
}

impl PlanEntry {
    pub fn stage(&self) -> &Stage {
        &self.binding.stage
    }

    pub fn re_evaluate(&self) -> bool {
        self.binding.re_evaluate_policies
    }
}

/// A resolved, policy-filtered, ordered list of stages for one request
/// context. Plans are immutable once built and shared behind `Arc`; each
/// execution walks its own cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub flow_slug: String,
    /// Flow version the plan was computed against.
    pub flow_version: u64,
    pub cache_key: String,
    pub entries: Vec<PlanEntry>,
    pub created_at: DateTime<Utc>,
    /// Snapshot of the request context used for planning.
    pub context: PlanContext,
}

impl Plan {
    pub fn new(
        flow_slug: impl Into<String>,
        flow_version: u64,
        cache_key: impl Into<String>,
        entries: Vec<PlanEntry>,
        context: PlanContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_slug: flow_slug.into(),
            flow_version,
            cache_key: cache_key.into(),
            entries,
            created_at: Utc::now(),
            context,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlanEntry> {
        self.entries.get(index)
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.stage().name.as_str()).collect()
    }
}
