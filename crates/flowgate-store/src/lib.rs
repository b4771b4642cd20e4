pub mod blueprint;
pub mod memory;
pub mod password;
pub mod sqlite;

pub use blueprint::{Blueprint, ImportSummary};
pub use memory::{InMemoryExecutionStore, InMemoryFlowStore};
pub use sqlite::{SqliteExecutionStore, SqliteFlowStore};

use std::collections::HashMap;

use flowgate_core::error::Result;
use flowgate_core::{Flow, FlowStageBinding};

/// Administrative write side of a flow store.
///
/// Every write that touches a flow or one of its bindings bumps the flow's
/// version, so plans cached against the previous version go stale. Versions
/// are never reissued for a slug, even after the flow was deleted.
pub trait FlowAdmin: Send + Sync {
    /// Insert or replace a flow together with its bindings. Returns the
    /// version the flow now has.
    fn put_flow(&self, flow: &Flow, bindings: &[FlowStageBinding]) -> Result<u64>;

    /// Delete a flow and its bindings. Returns whether the flow existed.
    fn delete_flow(&self, slug: &str) -> Result<bool>;

    /// Add a single binding to an existing flow. Returns the new flow version.
    fn add_binding(&self, binding: &FlowStageBinding) -> Result<u64>;

    /// Remove a binding by id. Returns the new version of the owning flow,
    /// or `None` if no such binding exists.
    fn remove_binding(&self, binding_id: &uuid::Uuid) -> Result<Option<u64>>;

    /// Insert or replace a directory user; `password` is hashed on write.
    fn put_user(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Result<()>;
}
