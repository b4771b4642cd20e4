use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use futures::future::BoxFuture;
use uuid::Uuid;

use flowgate_core::error::{FlowError, Result};
use flowgate_core::traits::{ExecutionStore, FlowStore, UserDirectory};
use flowgate_core::{ExecutionContext, Flow, FlowStageBinding, SessionId, User};

use crate::password::{hash_password, verify_password};
use crate::FlowAdmin;

fn poisoned<E: std::fmt::Display>(e: E) -> FlowError {
    FlowError::Database(format!("lock poisoned: {}", e))
}

/// Flow store and user directory held entirely in memory.
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<HashMap<String, Flow>>,
    bindings: RwLock<HashMap<String, Vec<FlowStageBinding>>>,
    users: RwLock<HashMap<String, User>>,
    /// Highest version ever issued per slug; kept when a flow is deleted.
    issued: Mutex<HashMap<String, u64>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue_version(&self, slug: &str, floor: u64) -> Result<u64> {
        let mut issued = self.issued.lock().map_err(poisoned)?;
        let last = issued.entry(slug.to_string()).or_insert(0);
        *last = (*last + 1).max(floor);
        Ok(*last)
    }

    fn bump(&self, slug: &str) -> Result<u64> {
        let mut flows = self.flows.write().map_err(poisoned)?;
        let flow = flows
            .get_mut(slug)
            .ok_or_else(|| FlowError::FlowNotFound(slug.to_string()))?;
        flow.version = self.issue_version(slug, flow.version + 1)?;
        Ok(flow.version)
    }
}

impl FlowAdmin for InMemoryFlowStore {
    fn put_flow(&self, flow: &Flow, bindings: &[FlowStageBinding]) -> Result<u64> {
        let mut flows = self.flows.write().map_err(poisoned)?;
        let floor = match flows.get(&flow.slug) {
            Some(existing) => existing.version + 1,
            None => flow.version,
        };
        let version = self.issue_version(&flow.slug, floor)?;
        let mut stored = flow.clone();
        stored.version = version;
        flows.insert(flow.slug.clone(), stored);

        let owned = bindings
            .iter()
            .cloned()
            .map(|mut b| {
                b.target = flow.slug.clone();
                b
            })
            .collect();
        self.bindings
            .write()
            .map_err(poisoned)?
            .insert(flow.slug.clone(), owned);
        Ok(version)
    }

    fn delete_flow(&self, slug: &str) -> Result<bool> {
        let removed = self.flows.write().map_err(poisoned)?.remove(slug).is_some();
        self.bindings.write().map_err(poisoned)?.remove(slug);
        Ok(removed)
    }

    fn add_binding(&self, binding: &FlowStageBinding) -> Result<u64> {
        if !self.flows.read().map_err(poisoned)?.contains_key(&binding.target) {
            return Err(FlowError::FlowNotFound(binding.target.clone()));
        }
        self.bindings
            .write()
            .map_err(poisoned)?
            .entry(binding.target.clone())
            .or_default()
            .push(binding.clone());
        self.bump(&binding.target)
    }

    fn remove_binding(&self, binding_id: &Uuid) -> Result<Option<u64>> {
        let owner = {
            let mut bindings = self.bindings.write().map_err(poisoned)?;
            let mut owner = None;
            for (slug, list) in bindings.iter_mut() {
                if let Some(pos) = list.iter().position(|b| &b.id == binding_id) {
                    list.remove(pos);
                    owner = Some(slug.clone());
                    break;
                }
            }
            owner
        };
        match owner {
            Some(slug) => self.bump(&slug).map(Some),
            None => Ok(None),
        }
    }

    fn put_user(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let password_hash = hash_password(password)?;
        let mut users = self.users.write().map_err(poisoned)?;
        let id = users
            .get(username)
            .map(|u| u.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        users.insert(
            username.to_string(),
            User {
                id,
                username: username.to_string(),
                email: email.map(str::to_string),
                password_hash,
                active: true,
                attributes,
            },
        );
        Ok(())
    }
}

impl FlowStore for InMemoryFlowStore {
    fn flow(&self, slug: &str) -> BoxFuture<'_, Result<Option<Flow>>> {
        let slug = slug.to_string();
        Box::pin(async move { Ok(self.flows.read().map_err(poisoned)?.get(&slug).cloned()) })
    }

    fn bindings(&self, slug: &str) -> BoxFuture<'_, Result<Vec<FlowStageBinding>>> {
        let slug = slug.to_string();
        Box::pin(async move {
            Ok(self
                .bindings
                .read()
                .map_err(poisoned)?
                .get(&slug)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn flows(&self) -> BoxFuture<'_, Result<Vec<Flow>>> {
        Box::pin(async move {
            let mut flows: Vec<Flow> = self.flows.read().map_err(poisoned)?.values().cloned().collect();
            flows.sort_by(|a, b| a.slug.cmp(&b.slug));
            Ok(flows)
        })
    }
}

impl UserDirectory for InMemoryFlowStore {
    fn find_user(&self, identifier: &str) -> BoxFuture<'_, Result<Option<User>>> {
        let identifier = identifier.to_string();
        Box::pin(async move {
            let users = self.users.read().map_err(poisoned)?;
            Ok(users
                .values()
                .find(|u| u.username == identifier || u.email.as_deref() == Some(identifier.as_str()))
                .cloned())
        })
    }

    fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> BoxFuture<'_, Result<Option<User>>> {
        let username = username.to_string();
        let password = password.to_string();
        Box::pin(async move {
            let users = self.users.read().map_err(poisoned)?;
            Ok(users
                .get(&username)
                .filter(|u| u.active && verify_password(&password, &u.password_hash))
                .cloned())
        })
    }
}

/// Execution store held in memory; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: Mutex<HashMap<SessionId, ExecutionContext>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save(&self, ctx: &ExecutionContext) -> BoxFuture<'_, Result<()>> {
        let ctx = ctx.clone();
        Box::pin(async move {
            self.executions
                .lock()
                .map_err(poisoned)?
                .insert(ctx.session_id.clone(), ctx);
            Ok(())
        })
    }

    fn load(&self, session: &SessionId) -> BoxFuture<'_, Result<Option<ExecutionContext>>> {
        let session = session.clone();
        Box::pin(async move { Ok(self.executions.lock().map_err(poisoned)?.get(&session).cloned()) })
    }

    fn delete(&self, session: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let session = session.clone();
        Box::pin(async move { Ok(self.executions.lock().map_err(poisoned)?.remove(&session).is_some()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::{PlanContext, Stage};
    use serde_json::json;

    fn login() -> (Flow, Vec<FlowStageBinding>) {
        let flow = Flow::new("login", "Login");
        let bindings = vec![
            FlowStageBinding::new("login", Stage::new("id", "identification"), 10),
            FlowStageBinding::new("login", Stage::new("pw", "password"), 20),
        ];
        (flow, bindings)
    }

    #[tokio::test]
    async fn put_flow_bumps_version_on_replace() {
        let store = InMemoryFlowStore::new();
        let (flow, bindings) = login();
        assert_eq!(store.put_flow(&flow, &bindings).unwrap(), 1);
        assert_eq!(store.put_flow(&flow, &bindings).unwrap(), 2);
        let loaded = store.flow("login").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(store.bindings("login").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn binding_changes_bump_flow_version() {
        let store = InMemoryFlowStore::new();
        let (flow, bindings) = login();
        store.put_flow(&flow, &bindings).unwrap();

        let extra = FlowStageBinding::new("login", Stage::new("done", "userlogin"), 100);
        assert_eq!(store.add_binding(&extra).unwrap(), 2);
        assert_eq!(store.remove_binding(&extra.id).unwrap(), Some(3));
        assert_eq!(store.remove_binding(&extra.id).unwrap(), None);
        assert_eq!(store.flow("login").await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn recreated_flow_gets_a_fresh_version() {
        let store = InMemoryFlowStore::new();
        let (flow, bindings) = login();
        assert_eq!(store.put_flow(&flow, &bindings).unwrap(), 1);
        assert!(store.delete_flow("login").unwrap());
        assert!(!store.delete_flow("login").unwrap());
        assert!(store.flow("login").await.unwrap().is_none());
        assert!(store.bindings("login").await.unwrap().is_empty());

        assert_eq!(store.put_flow(&flow, &bindings[..1]).unwrap(), 2);
    }

    #[test]
    fn add_binding_to_missing_flow_fails() {
        let store = InMemoryFlowStore::new();
        let b = FlowStageBinding::new("ghost", Stage::new("x", "dummy"), 0);
        assert!(matches!(store.add_binding(&b), Err(FlowError::FlowNotFound(_))));
    }

    #[tokio::test]
    async fn users_are_found_by_username_or_email() {
        let store = InMemoryFlowStore::new();
        store
            .put_user("alice", Some("alice@example.com"), "hunter2", HashMap::from([("totp_code".to_string(), json!("123456"))]))
            .unwrap();

        let by_email = store.find_user("alice@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.username, "alice");
        assert_ne!(by_email.password_hash, "hunter2");

        assert!(store.authenticate("alice", "hunter2").await.unwrap().is_some());
        assert!(store.authenticate("alice", "wrong").await.unwrap().is_none());
        assert!(store.authenticate("bob", "hunter2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_store_roundtrip() {
        let store = InMemoryExecutionStore::new();
        let ctx = ExecutionContext::new(SessionId::new(), "login", PlanContext::new());
        store.save(&ctx).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.load(&ctx.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.flow_slug, "login");
        assert!(store.delete(&ctx.session_id).await.unwrap());
        assert!(!store.delete(&ctx.session_id).await.unwrap());
        assert!(store.is_empty());
    }
}
