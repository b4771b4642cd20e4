//! TOML blueprints: declarative flows, stages, policies and users.
//!
//! ```toml
//! [[policies]]
//! name = "trusted-device"
//! type = "expression"
//! expr = 'device == "trusted"'
//!
//! [[stages]]
//! name = "default-identification"
//! kind = "identification"
//!
//! [[flows]]
//! slug = "login"
//! name = "Login"
//!
//! [[flows.bindings]]
//! stage = "default-identification"
//! order = 10
//! policies = [{ policy = "trusted-device", negate = true }]
//! ```
//!
//! Policies and stages are referenced by name. Importing the same blueprint
//! twice replaces the flows and bumps their versions.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use flowgate_core::config::expand_env_vars;
use flowgate_core::error::{FlowError, Result};
use flowgate_core::policy::{Policy, PolicyBinding, PolicyEngineMode, PolicyKind, PolicySet};
use flowgate_core::{Flow, FlowDesignation, FlowStageBinding, Stage};

use crate::FlowAdmin;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub policies: Vec<PolicyDef>,
    #[serde(default)]
    pub stages: Vec<StageDef>,
    #[serde(default)]
    pub flows: Vec<FlowDef>,
    #[serde(default)]
    pub users: Vec<UserDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: PolicyKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A policy reference: either a bare name or a table with binding options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PolicyRef {
    Name(String),
    Detailed {
        policy: String,
        #[serde(default)]
        order: Option<i32>,
        #[serde(default)]
        negate: bool,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowDef {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub designation: FlowDesignation,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyRef>,
    #[serde(default)]
    pub policy_mode: PolicyEngineMode,
    #[serde(default)]
    pub bindings: Vec<BindingDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingDef {
    pub stage: String,
    pub order: i32,
    #[serde(default = "default_true")]
    pub evaluate_on_plan: bool,
    #[serde(default)]
    pub re_evaluate_policies: bool,
    #[serde(default)]
    pub policies: Vec<PolicyRef>,
    #[serde(default)]
    pub policy_mode: PolicyEngineMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserDef {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// What an import wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// `(slug, version)` of every flow written.
    pub flows: Vec<(String, u64)>,
    pub bindings: usize,
    pub users: usize,
}

impl Blueprint {
    /// Load a blueprint file, expanding `${ENV_VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Blueprint(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Blueprint(e.to_string()))
    }

    /// Resolve name references into flows and their bindings.
    ///
    /// Fails on references to undefined policies or stages and on duplicate
    /// names, before anything is written.
    pub fn resolve(&self) -> Result<Vec<(Flow, Vec<FlowStageBinding>)>> {
        let mut policies = HashMap::new();
        for def in &self.policies {
            let policy = Policy::new(&def.name, def.kind.clone());
            if policies.insert(def.name.as_str(), policy).is_some() {
                return Err(FlowError::Blueprint(format!("duplicate policy '{}'", def.name)));
            }
        }

        let mut stages = HashMap::new();
        for def in &self.stages {
            let stage = Stage::new(&def.name, &def.kind).with_config(def.config.clone());
            if stages.insert(def.name.as_str(), stage).is_some() {
                return Err(FlowError::Blueprint(format!("duplicate stage '{}'", def.name)));
            }
        }

        let mut resolved = Vec::with_capacity(self.flows.len());
        for def in &self.flows {
            let mut flow = Flow::new(&def.slug, &def.name)
                .with_designation(def.designation)
                .with_policies(policy_set(def.policy_mode, &def.policies, &policies)?);
            if let Some(ref title) = def.title {
                flow.title = title.clone();
            }
            flow.background = def.background.clone();

            let mut bindings = Vec::with_capacity(def.bindings.len());
            for b in &def.bindings {
                let stage = stages.get(b.stage.as_str()).cloned().ok_or_else(|| {
                    FlowError::Blueprint(format!(
                        "flow '{}' binds unknown stage '{}'",
                        def.slug, b.stage
                    ))
                })?;
                bindings.push(
                    FlowStageBinding::new(&def.slug, stage, b.order)
                        .evaluate_on_plan(b.evaluate_on_plan)
                        .re_evaluate_policies(b.re_evaluate_policies)
                        .with_policies(policy_set(b.policy_mode, &b.policies, &policies)?),
                );
            }
            resolved.push((flow, bindings));
        }
        Ok(resolved)
    }

    /// Write everything in the blueprint through `admin`.
    pub fn apply(&self, admin: &dyn FlowAdmin) -> Result<ImportSummary> {
        let resolved = self.resolve()?;
        let mut summary = ImportSummary::default();

        for (flow, bindings) in &resolved {
            let version = admin.put_flow(flow, bindings)?;
            info!(flow = %flow.slug, version, bindings = bindings.len(), "Flow imported");
            summary.flows.push((flow.slug.clone(), version));
            summary.bindings += bindings.len();
        }

        for user in &self.users {
            admin.put_user(
                &user.username,
                user.email.as_deref(),
                &user.password,
                user.attributes.clone(),
            )?;
            summary.users += 1;
        }
        Ok(summary)
    }
}

fn policy_set(
    mode: PolicyEngineMode,
    refs: &[PolicyRef],
    policies: &HashMap<&str, Policy>,
) -> Result<PolicySet> {
    let mut set = PolicySet::new(mode);
    for (index, r) in refs.iter().enumerate() {
        let (name, order, negate, enabled, timeout) = match r {
            PolicyRef::Name(name) => (name, None, false, true, None),
            PolicyRef::Detailed {
                policy,
                order,
                negate,
                enabled,
                timeout_secs,
            } => (policy, *order, *negate, *enabled, *timeout_secs),
        };
        let policy = policies
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| FlowError::Blueprint(format!("unknown policy '{}'", name)))?;

        let mut binding = PolicyBinding::new(policy);
        binding.order = order.unwrap_or(index as i32);
        binding.negate = negate;
        binding.enabled = enabled;
        if let Some(secs) = timeout {
            binding.timeout_secs = secs;
        }
        set = set.with(binding);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryFlowStore;
    use flowgate_core::traits::{FlowStore, UserDirectory};
    use std::io::Write;

    const LOGIN: &str = r#"
[[policies]]
name = "always-allow"
type = "static"
result = true

[[policies]]
name = "trusted-device"
type = "expression"
expr = 'device == "trusted"'

[[stages]]
name = "default-identification"
kind = "identification"
config = { user_fields = ["username", "email"] }

[[stages]]
name = "default-password"
kind = "password"

[[stages]]
name = "default-mfa"
kind = "authenticatorvalidate"

[[flows]]
slug = "login"
name = "Login"
title = "Welcome"
policies = ["always-allow"]

[[flows.bindings]]
stage = "default-identification"
order = 10

[[flows.bindings]]
stage = "default-password"
order = 20

[[flows.bindings]]
stage = "default-mfa"
order = 30
re_evaluate_policies = true
policies = [{ policy = "trusted-device", negate = true, timeout_secs = 5 }]

[[users]]
username = "alice"
email = "alice@example.com"
password = "hunter2"
attributes = { totp_code = "123456" }
"#;

    #[test]
    fn resolves_references() {
        let bp = Blueprint::parse(LOGIN).unwrap();
        let resolved = bp.resolve().unwrap();
        assert_eq!(resolved.len(), 1);

        let (flow, bindings) = &resolved[0];
        assert_eq!(flow.title, "Welcome");
        assert_eq!(flow.policies.bindings[0].policy.name, "always-allow");
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].stage.config["user_fields"][1], "email");

        let mfa = &bindings[2];
        assert!(mfa.re_evaluate_policies);
        assert!(mfa.evaluate_on_plan);
        let pb = &mfa.policies.bindings[0];
        assert!(pb.negate);
        assert_eq!(pb.timeout_secs, 5);
        assert!(matches!(pb.policy.kind, PolicyKind::Expression { .. }));
    }

    #[test]
    fn unknown_references_fail() {
        let bp = Blueprint::parse(
            r#"
[[flows]]
slug = "broken"
name = "Broken"

[[flows.bindings]]
stage = "nowhere"
order = 0
"#,
        )
        .unwrap();
        assert!(matches!(bp.resolve(), Err(FlowError::Blueprint(_))));

        let bp = Blueprint::parse(
            r#"
[[flows]]
slug = "broken"
name = "Broken"
policies = ["missing"]
"#,
        )
        .unwrap();
        let err = bp.resolve().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn duplicate_names_fail() {
        let bp = Blueprint::parse(
            r#"
[[stages]]
name = "a"
kind = "dummy"

[[stages]]
name = "a"
kind = "deny"
"#,
        )
        .unwrap();
        assert!(bp.resolve().is_err());
    }

    #[tokio::test]
    async fn import_and_reimport_bumps_version() {
        let store = InMemoryFlowStore::new();
        let bp = Blueprint::parse(LOGIN).unwrap();

        let first = bp.apply(&store).unwrap();
        assert_eq!(first.flows, vec![("login".to_string(), 1)]);
        assert_eq!(first.bindings, 3);
        assert_eq!(first.users, 1);

        let second = bp.apply(&store).unwrap();
        assert_eq!(second.flows, vec![("login".to_string(), 2)]);

        assert_eq!(store.flow("login").await.unwrap().unwrap().version, 2);
        assert!(store.authenticate("alice", "hunter2").await.unwrap().is_some());
    }

    #[test]
    fn load_expands_env_vars() {
        std::env::set_var("FLOWGATE_BP_TEST_SLUG", "env-login");
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[[flows]]\nslug = \"${{FLOWGATE_BP_TEST_SLUG}}\"\nname = \"Env\"").unwrap();

        let bp = Blueprint::load(f.path()).unwrap();
        assert_eq!(bp.flows[0].slug, "env-login");
        std::env::remove_var("FLOWGATE_BP_TEST_SLUG");
    }

    #[test]
    fn missing_file_is_a_blueprint_error() {
        let err = Blueprint::load(Path::new("/nonexistent/blueprint.toml")).unwrap_err();
        assert!(matches!(err, FlowError::Blueprint(_)));
    }
}
