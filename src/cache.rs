//! Multi-tier caching in front of expensive DAG builds, release lookups and
//! per-PR derived facts.
//!
//! Three tiers: a per-process byte-budgeted cache handing out `Arc` handles
//! to commit DAGs; a best-effort shared key-value store; and the
//! Precomputed Store for durable artifacts (see `db`). Shared-cache keys are
//! `scope|version|fingerprint` where the fingerprint includes every parameter
//! that could change the value, the release-matching rule tuple included.
//! Corrupt or missing entries are silently ignored and recomputed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::dag::Dag;

type DagKey = (String, i32);

struct DagEntry {
    dag: Arc<Dag>,
    bytes: usize,
    last_touch: u64,
}

/// In-process tier for commit DAGs. Every hit refreshes the entry's tick;
/// once the size estimates exceed the byte budget, the stalest entries are
/// dropped until the rest fit again. A graph larger than the whole budget
/// is handed back to the caller without being retained.
struct DagCache {
    budget: usize,
    used: usize,
    tick: u64,
    entries: HashMap<DagKey, DagEntry>,
}

impl DagCache {
    fn new(budget: usize) -> Self {
        DagCache {
            budget,
            used: 0,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &DagKey) -> Option<Arc<Dag>> {
        self.tick += 1;
        let entry = self.entries.get_mut(key)?;
        entry.last_touch = self.tick;
        Some(entry.dag.clone())
    }

    fn put(&mut self, key: DagKey, dag: Arc<Dag>) -> Arc<Dag> {
        let bytes = dag.estimated_size();
        if bytes > self.budget {
            return dag;
        }
        self.tick += 1;
        let entry = DagEntry {
            dag: dag.clone(),
            bytes,
            last_touch: self.tick,
        };
        if let Some(replaced) = self.entries.insert(key, entry) {
            self.used -= replaced.bytes;
        }
        self.used += bytes;
        while self.used > self.budget {
            // The entry just inserted carries the freshest tick, so it can
            // only be the victim when it is the sole entry left.
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_touch)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.used -= evicted.bytes;
            }
        }
        dag
    }

    fn prune(&mut self, key: &DagKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.used -= entry.bytes;
                true
            }
            None => false,
        }
    }
}

/// Best-effort shared key-value cache. Stale reads and lost writes are
/// tolerated; every consumer must survive a miss.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
}

/// Process-local [`SharedCache`] used in tests and single-node deployments.
#[derive(Default)]
pub struct MemSharedCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemSharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl SharedCache for MemSharedCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await);
        }
        values
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value, Instant::now() + ttl));
    }
}

/// Build a shared-cache key: `scope|version|part|part|…`.
pub fn cache_key(scope: &str, version: u32, parts: &[&str]) -> String {
    let mut key = format!("{scope}|{version}");
    for part in parts {
        key.push('|');
        key.push_str(part);
    }
    key
}

const DAG_CACHE_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// The cache tiers threaded through every pipeline component. The in-memory
/// DAG tier is keyed by repository only: DAGs are rule-independent, and the
/// format version guards blob layout changes.
pub struct Caches {
    dags: Mutex<DagCache>,
    pub shared: Option<Arc<dyn SharedCache>>,
}

impl Caches {
    pub fn new(shared: Option<Arc<dyn SharedCache>>) -> Self {
        Self::with_dag_budget(DAG_CACHE_BUDGET_BYTES, shared)
    }

    pub fn with_dag_budget(budget: usize, shared: Option<Arc<dyn SharedCache>>) -> Self {
        Caches {
            dags: Mutex::new(DagCache::new(budget)),
            shared,
        }
    }

    pub fn get_dag(&self, repo: &str, format_version: i32) -> Option<Arc<Dag>> {
        self.dags
            .lock()
            .unwrap()
            .get(&(repo.to_owned(), format_version))
    }

    pub fn put_dag(&self, repo: &str, format_version: i32, dag: Arc<Dag>) -> Arc<Dag> {
        self.dags
            .lock()
            .unwrap()
            .put((repo.to_owned(), format_version), dag)
    }

    pub fn prune_dag(&self, repo: &str, format_version: i32) -> bool {
        self.dags
            .lock()
            .unwrap()
            .prune(&(repo.to_owned(), format_version))
    }

    /// Fetch and deserialize a shared-cache entry, treating corrupt payloads
    /// as misses.
    pub async fn shared_get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.shared.as_ref()?.get(key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("dropping corrupt shared cache entry {key}: {e}");
                None
            }
        }
    }

    /// Serialize and store a shared-cache entry; failures are ignored.
    pub async fn shared_set<T: serde::Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        match serde_json::to_vec(value) {
            Ok(raw) => shared.set(key, raw, ttl).await,
            Err(e) => tracing::warn!("failed to serialize shared cache entry {key}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Adjacency;

    /// A single-node DAG whose sha length controls the size estimate.
    fn sized_dag(name_len: usize) -> Arc<Dag> {
        let sha = "a".repeat(name_len);
        Arc::new(Dag::from_parent_lists(&Adjacency::from([(sha, vec![])])))
    }

    #[test]
    fn dag_cache_evicts_stalest_entry_first() {
        // Three single-node graphs of ~132 bytes each against a budget
        // that only fits two.
        let bytes = sized_dag(100).estimated_size();
        let mut cache = DagCache::new(2 * bytes + 1);
        cache.put(("a".into(), 1), sized_dag(100));
        cache.put(("b".into(), 1), sized_dag(100));
        // Touch "a" so that "b" becomes the eviction candidate.
        assert!(cache.get(&("a".into(), 1)).is_some());
        cache.put(("c".into(), 1), sized_dag(100));
        assert!(cache.get(&("a".into(), 1)).is_some());
        assert!(cache.get(&("b".into(), 1)).is_none());
        assert!(cache.get(&("c".into(), 1)).is_some());
    }

    #[test]
    fn dag_cache_skips_graphs_larger_than_the_budget() {
        let mut cache = DagCache::new(16);
        let dag = cache.put(("big".into(), 1), sized_dag(100));
        assert!(cache.get(&("big".into(), 1)).is_none());
        // The caller still gets its handle back.
        assert!(dag.contains(&"a".repeat(100)));
    }

    #[test]
    fn dag_cache_replacement_keeps_the_byte_account_straight() {
        let bytes = sized_dag(100).estimated_size();
        let mut cache = DagCache::new(2 * bytes + 1);
        cache.put(("a".into(), 1), sized_dag(100));
        // Replacing under the same key must not double-count.
        cache.put(("a".into(), 1), sized_dag(100));
        cache.put(("b".into(), 1), sized_dag(100));
        assert!(cache.get(&("a".into(), 1)).is_some());
        assert!(cache.get(&("b".into(), 1)).is_some());
        assert!(cache.prune(&("a".into(), 1)));
        assert!(!cache.prune(&("a".into(), 1)));
        assert_eq!(cache.used, bytes);
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(
            cache_key("released_pr", 2, &["node", "tag|v.*|"]),
            "released_pr|2|node|tag|v.*|"
        );
    }

    #[tokio::test]
    async fn shared_cache_expires_entries() {
        let cache = MemSharedCache::new();
        cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some(&b"v"[..]));
        cache.set("k", b"v".to_vec(), Duration::from_nanos(1)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(cache.get("k").await, None);
    }
}
