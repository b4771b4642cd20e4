use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use flowgate_core::{Plan, PlanContext};

/// Prefix shared by every plan cache key.
pub const CACHE_PREFIX: &str = "flow_";

/// Cache key for a flow and request context: `flow_{slug}#{sha256}`.
///
/// The digest covers the flow slug and every context field a plan-time
/// policy can read, serialized canonically.
pub fn cache_key(flow_slug: &str, ctx: &PlanContext) -> String {
    let doc = serde_json::json!({
        "flow": flow_slug,
        "context": ctx.fingerprint_document(),
    });
    let digest = Sha256::digest(doc.to_string().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}#{}", CACHE_PREFIX, flow_slug, hex)
}

struct CachedPlan {
    plan: Arc<Plan>,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CachedPlan>,
    /// flow slug → keys in that flow's namespace
    by_flow: HashMap<String, HashSet<String>>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<CachedPlan> {
        let removed = self.entries.remove(key)?;
        if let Some(keys) = self.by_flow.get_mut(&removed.plan.flow_slug) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_flow.remove(&removed.plan.flow_slug);
            }
        }
        Some(removed)
    }
}

/// Fingerprint-keyed store of complete plans.
///
/// Entries expire `ttl` after insertion. Expiry is applied lazily when an
/// entry is read, so `count` can include entries that are already dead
/// until `purge_expired` runs.
pub struct PlanCache {
    ttl: Duration,
    inner: RwLock<CacheInner>,
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live plan stored under `key`.
    pub async fn get(&self, key: &str) -> Option<Arc<Plan>> {
        {
            let inner = self.inner.read().await;
            let cached = inner.entries.get(key)?;
            if cached.inserted_at.elapsed() < self.ttl {
                return Some(cached.plan.clone());
            }
        }

        let mut inner = self.inner.write().await;
        // Re-check: another writer may have replaced the entry meanwhile.
        match inner.entries.get(key) {
            Some(cached) if cached.inserted_at.elapsed() < self.ttl => Some(cached.plan.clone()),
            Some(_) => {
                inner.remove(key);
                debug!(key, "Cached plan expired");
                None
            }
            None => None,
        }
    }

    /// Store a complete plan. The last writer for a key wins.
    pub async fn put(&self, key: impl Into<String>, plan: Arc<Plan>) {
        let key = key.into();
        let mut inner = self.inner.write().await;
        inner
            .by_flow
            .entry(plan.flow_slug.clone())
            .or_default()
            .insert(key.clone());
        inner.entries.insert(
            key,
            CachedPlan {
                plan,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry of a flow. Returns how many were removed.
    pub async fn invalidate(&self, flow_slug: &str) -> usize {
        let mut inner = self.inner.write().await;
        let Some(keys) = inner.by_flow.remove(flow_slug) else {
            return 0;
        };
        for key in &keys {
            inner.entries.remove(key);
        }
        debug!(flow = %flow_slug, entries = keys.len(), "Plan cache invalidated");
        keys.len()
    }

    /// Remove a single entry.
    pub async fn remove(&self, key: &str) -> bool {
        self.inner.write().await.remove(key).is_some()
    }

    /// Number of entries whose key starts with `prefix`. `CACHE_PREFIX`
    /// alone counts everything.
    pub async fn count(&self, prefix: &str) -> usize {
        let inner = self.inner.read().await;
        if prefix == CACHE_PREFIX {
            return inner.entries.len();
        }
        inner.entries.keys().filter(|k| k.starts_with(prefix)).count()
    }

    /// Number of entries in one flow's namespace.
    pub async fn count_for_flow(&self, flow_slug: &str) -> usize {
        self.inner
            .read()
            .await
            .by_flow
            .get(flow_slug)
            .map(|keys| keys.len())
            .unwrap_or(0)
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, c)| c.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.by_flow.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
