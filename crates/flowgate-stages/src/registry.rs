use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use flowgate_core::error::{FlowError, Result};
use flowgate_core::traits::{StageBehavior, UserDirectory};

use crate::builtin;

/// Stable identifier of a stage type: the lower-cased type name with
/// `stage` removed (`IdentificationStage` → `identification`).
pub fn stage_type_identifier(type_name: &str) -> String {
    type_name.to_lowercase().replace("stage", "")
}

/// Describes a registered stage type, for discovery by API layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTypeInfo {
    /// Routing identifier, e.g. `identification`.
    pub identifier: String,
    /// Concrete type name, e.g. `IdentificationStage`.
    pub type_name: String,
    pub verbose_name: String,
}

/// Registry of available stage kinds.
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn StageBehavior>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    /// Register a stage behavior under its type identifier.
    pub fn register(&mut self, behavior: impl StageBehavior) {
        let key = stage_type_identifier(behavior.type_name());
        self.stages.insert(key, Arc::new(behavior));
    }

    /// Unregister a stage kind.
    pub fn unregister(&mut self, kind: &str) -> bool {
        self.stages.remove(kind).is_some()
    }

    /// Get a stage behavior by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn StageBehavior>> {
        self.stages.get(kind).cloned()
    }

    /// Resolve a stage kind, failing for unknown kinds.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn StageBehavior>> {
        self.get(kind)
            .ok_or_else(|| FlowError::UnknownStageKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.stages.contains_key(kind)
    }

    /// Registered stage types, sorted by identifier.
    pub fn list(&self) -> Vec<StageTypeInfo> {
        let mut infos: Vec<StageTypeInfo> = self
            .stages
            .iter()
            .map(|(id, b)| StageTypeInfo {
                identifier: id.clone(),
                type_name: b.type_name().to_string(),
                verbose_name: b.verbose_name().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        infos
    }

    /// Create a registry with all built-in stages registered.
    pub fn with_builtins(directory: Arc<dyn UserDirectory>) -> Self {
        let mut registry = Self::new();

        // ── Identity ────────────────────────────────────────────
        registry.register(builtin::identification::IdentificationStage::new(
            directory.clone(),
        ));
        registry.register(builtin::password::PasswordStage::new(directory.clone()));
        registry.register(builtin::authenticator::AuthenticatorValidateStage::new(
            directory,
        ));
        registry.register(builtin::login::UserLoginStage);

        // ── Interaction ─────────────────────────────────────────
        registry.register(builtin::consent::ConsentStage);
        registry.register(builtin::email::EmailVerifyStage);

        // ── Control ─────────────────────────────────────────────
        registry.register(builtin::control::DenyStage);
        registry.register(builtin::control::DummyStage);

        registry
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
