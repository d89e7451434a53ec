//! Cluster-wide state used by the listener registry to agree on exactly
//! one provider per record name across every server in the mesh.
//!
//! The trait is the integration seam for a real distributed backend; this
//! module ships only the in-process implementation used for single-node
//! deployments and tests, matching the spec's explicit non-goal of strong
//! cross-cluster consistency — a real backend only needs best-effort CAS
//! plus a change feed.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// A listener offered, or currently providing, a record name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub uuid: String,
    pub pattern: String,
    pub server_name: String,
    /// Present while the offer is outstanding; cleared on ACCEPT.
    pub deadline_millis: Option<u64>,
}

/// Cluster-visible entry for one record name: the current provider (if
/// any) and the set of `(uuid, pattern)` pairs already offered-and-either-
/// rejected-or-expired, so the next `tryAdd` doesn't re-offer to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerEntry {
    pub provider: Option<Provider>,
    pub history: HashSet<(String, String)>,
}

/// A distributed map of record name -> [`ListenerEntry`] with
/// compare-and-swap upsert semantics and a change feed.
#[async_trait]
pub trait ClusterStateMap: Send + Sync {
    async fn get(&self, name: &str) -> Option<ListenerEntry>;

    /// Atomically replace the entry for `name`: `f` receives the current
    /// value (`None` if absent) and returns `Some(next)` to commit or
    /// `None` to leave it unchanged. Returns the value that's live after
    /// the call, along with whether `f` actually changed anything.
    async fn upsert(
        &self,
        name: &str,
        f: Box<dyn FnOnce(Option<ListenerEntry>) -> Option<ListenerEntry> + Send>,
    ) -> (ListenerEntry, bool);

    fn watch(&self) -> broadcast::Receiver<String>;

    /// Server names other than our own currently considered part of the
    /// cluster. Empty for a single-node deployment.
    fn remote_servers(&self) -> Vec<String>;
}

struct MemoryInner {
    map: Mutex<HashMap<String, ListenerEntry>>,
    changes: broadcast::Sender<String>,
    remote_servers: Mutex<HashSet<String>>,
}

/// In-process [`ClusterStateMap`]. CAS is trivial here because everything
/// is behind one mutex; a real backend would implement `upsert` with a
/// compare-and-swap RPC instead.
pub struct InMemoryClusterState {
    inner: Arc<MemoryInner>,
}

impl InMemoryClusterState {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(MemoryInner {
                map: Mutex::new(HashMap::new()),
                changes: tx,
                remote_servers: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Test/simulation hook: mark another server as part of the cluster.
    pub fn add_remote_server(&self, name: impl Into<String>) {
        self.inner.remote_servers.lock().unwrap().insert(name.into());
    }

    pub fn remove_remote_server(&self, name: &str) {
        self.inner.remote_servers.lock().unwrap().remove(name);
    }
}

impl Default for InMemoryClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStateMap for InMemoryClusterState {
    async fn get(&self, name: &str) -> Option<ListenerEntry> {
        self.inner.map.lock().unwrap().get(name).cloned()
    }

    async fn upsert(
        &self,
        name: &str,
        f: Box<dyn FnOnce(Option<ListenerEntry>) -> Option<ListenerEntry> + Send>,
    ) -> (ListenerEntry, bool) {
        let mut map = self.inner.map.lock().unwrap();
        let prev = map.get(name).cloned();
        match f(prev.clone()) {
            Some(next) => {
                let changed = Some(&next) != prev.as_ref();
                map.insert(name.to_string(), next.clone());
                drop(map);
                if changed {
                    let _ = self.inner.changes.send(name.to_string());
                }
                (next, changed)
            }
            None => (prev.unwrap_or_default(), false),
        }
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }

    fn remote_servers(&self) -> Vec<String> {
        self.inner.remote_servers.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_commits_and_notifies() {
        let state = InMemoryClusterState::new();
        let mut watcher = state.watch();

        let (entry, changed) = state
            .upsert(
                "user/1",
                Box::new(|_prev| {
                    Some(ListenerEntry {
                        provider: Some(Provider {
                            uuid: "u1".into(),
                            pattern: "user/.*".into(),
                            server_name: "node-a".into(),
                            deadline_millis: Some(1000),
                        }),
                        history: HashSet::new(),
                    })
                }),
            )
            .await;

        assert!(changed);
        assert_eq!(entry.provider.unwrap().uuid, "u1");
        assert_eq!(watcher.recv().await.unwrap(), "user/1");
    }

    #[tokio::test]
    async fn upsert_no_change_does_not_notify() {
        let state = InMemoryClusterState::new();
        let (_entry, changed) = state.upsert("x", Box::new(|prev| prev)).await;
        assert!(!changed);
    }

    #[tokio::test]
    async fn remote_servers_roundtrip() {
        let state = InMemoryClusterState::new();
        state.add_remote_server("node-b");
        assert_eq!(state.remote_servers(), vec!["node-b".to_string()]);
        state.remove_remote_server("node-b");
        assert!(state.remote_servers().is_empty());
    }
}
