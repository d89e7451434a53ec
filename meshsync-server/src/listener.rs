//! Pattern listening: lets clients register regex patterns, and assigns
//! exactly one live listener as "provider" for each actively-subscribed
//! record name that matches.
//!
//! Assignment state lives in the cluster [`ClusterStateMap`]; this
//! registry reconciles a `pending` set of names against it on a 10ms
//! timer, and re-sweeps every locally-subscribed name every 10s as a
//! coarse recovery pass (the spec's error-triggered recovery, generalized
//! to also cover lost `watch()` notifications without needing a distinct
//! error channel).
//!
//! Matching only considers listeners registered on this process. A real
//! multi-node deployment would need pattern registrations themselves
//! propagated through the cluster map; that's out of scope here, same as
//! the spec's non-goal of strong cross-cluster consistency — the
//! `ClusterStateMap` trait is the seam where that would plug in.

use crate::cluster::{ClusterStateMap, ListenerEntry, Provider};
use crate::metrics::ServerMetrics;
use crate::socket::Socket;
use crate::subscription::{SubscriptionHook, SubscriptionRegistry};
use meshsync_core::{Action, ErrorCode, Frame, Topic};
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct CompiledPattern {
    raw: String,
    regex: Regex,
}

struct LocalListener {
    uuid: String,
    socket: Arc<dyn Socket>,
    patterns: Vec<CompiledPattern>,
}

struct Inner {
    cluster: Arc<dyn ClusterStateMap>,
    record_subs: SubscriptionRegistry,
    server_name: String,
    listen_response_timeout: Duration,
    local: Mutex<HashMap<u64, LocalListener>>,
    pending: Mutex<HashSet<String>>,
    metrics: Option<Arc<ServerMetrics>>,
}

#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Arc<Inner>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ListenerRegistry {
    pub fn new(
        cluster: Arc<dyn ClusterStateMap>,
        record_subs: SubscriptionRegistry,
        server_name: impl Into<String>,
        listen_response_timeout: Duration,
    ) -> Self {
        Self::with_metrics(cluster, record_subs, server_name, listen_response_timeout, None)
    }

    pub fn with_metrics(
        cluster: Arc<dyn ClusterStateMap>,
        record_subs: SubscriptionRegistry,
        server_name: impl Into<String>,
        listen_response_timeout: Duration,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                record_subs,
                server_name: server_name.into(),
                listen_response_timeout,
                local: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                metrics,
            }),
        }
    }

    fn record_reconcile(&self, outcome: &str) {
        if let Some(m) = &self.inner.metrics {
            m.record_listener_reconcile(outcome);
        }
    }

    /// Start the 10ms reconcile drain and the 10s coarse recovery sweep.
    pub fn spawn_reconcile_loops(&self) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let fine = {
            let registry = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(10));
                loop {
                    ticker.tick().await;
                    registry.drain_pending().await;
                }
            })
        };
        let coarse = {
            let registry = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(10));
                loop {
                    ticker.tick().await;
                    for name in registry.inner.record_subs.names() {
                        registry.enqueue(&name);
                    }
                }
            })
        };
        (fine, coarse)
    }

    fn enqueue(&self, name: &str) {
        self.inner.pending.lock().unwrap().insert(name.to_string());
    }

    async fn drain_pending(&self) {
        let names: Vec<String> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().collect()
        };
        for name in names {
            if self.inner.record_subs.local_count(&name) > 0 {
                self.try_add(&name).await;
            } else {
                self.try_remove(&name).await;
            }
        }
    }

    /// Register `pattern` for `socket`. Compiles the regex once; a
    /// compile failure reports `INVALID_MESSAGE_DATA` and the pattern is
    /// not stored.
    pub fn listen(&self, socket: Arc<dyn Socket>, pattern: &str) {
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(_) => {
                self.send_error(&socket, ErrorCode::InvalidMessageData, pattern);
                return;
            }
        };

        let socket_id = socket.id();
        let matching_names: Vec<String> = {
            let mut local = self.inner.local.lock().unwrap();
            let entry = local.entry(socket_id).or_insert_with(|| LocalListener {
                uuid: uuid::Uuid::new_v4().to_string(),
                socket: socket.clone(),
                patterns: Vec::new(),
            });
            entry.patterns.push(CompiledPattern {
                raw: pattern.to_string(),
                regex: regex.clone(),
            });
            self.inner
                .record_subs
                .names()
                .into_iter()
                .filter(|n| regex.is_match(n))
                .collect()
        };

        for name in matching_names {
            self.enqueue(&name);
        }
    }

    pub fn unlisten(&self, socket_id: u64, pattern: &str) {
        let mut local = self.inner.local.lock().unwrap();
        if let Some(entry) = local.get_mut(&socket_id) {
            entry.patterns.retain(|p| p.raw != pattern);
            if entry.patterns.is_empty() {
                local.remove(&socket_id);
            }
        }
    }

    pub fn remove_socket(&self, socket_id: u64) {
        self.inner.local.lock().unwrap().remove(&socket_id);
    }

    fn matching_listeners(&self, name: &str, history: &HashSet<(String, String)>) -> Vec<(String, String, Arc<dyn Socket>)> {
        let local = self.inner.local.lock().unwrap();
        let mut out = Vec::new();
        for listener in local.values() {
            for pattern in &listener.patterns {
                let key = (listener.uuid.clone(), pattern.raw.clone());
                if !history.contains(&key) && pattern.regex.is_match(name) {
                    out.push((listener.uuid.clone(), pattern.raw.clone(), listener.socket.clone()));
                }
            }
        }
        out
    }

    async fn is_alive(&self, provider: &Option<Provider>) -> bool {
        let Some(p) = provider else { return false };
        if let Some(deadline) = p.deadline_millis {
            if now_millis() > deadline {
                return false;
            }
        }
        if p.server_name == self.inner.server_name {
            let local = self.inner.local.lock().unwrap();
            local
                .values()
                .any(|l| l.uuid == p.uuid && l.patterns.iter().any(|pat| pat.raw == p.pattern))
        } else {
            self.inner.cluster.remote_servers().contains(&p.server_name)
        }
    }

    async fn try_add(&self, name: &str) {
        let prev = self.inner.cluster.get(name).await.unwrap_or_default();
        if self.is_alive(&prev.provider).await {
            return;
        }

        let candidates = self.matching_listeners(name, &prev.history);
        if candidates.is_empty() {
            // Every currently-matching listener has already been offered
            // (and rejected or expired). Start a fresh round instead of
            // leaving the name stuck at no_candidate forever.
            self.inner
                .cluster
                .upsert(
                    name,
                    Box::new(move |_cur| {
                        Some(ListenerEntry {
                            provider: None,
                            history: HashSet::new(),
                        })
                    }),
                )
                .await;
            self.record_reconcile("no_candidate");
            return;
        }

        let (uuid, pattern, socket) = candidates.choose(&mut rand::thread_rng()).unwrap().clone();
        let deadline = now_millis() + self.inner.listen_response_timeout.as_millis() as u64;
        let all_matching = self.matching_listeners(name, &HashSet::new()).len();
        let mut history = prev.history.clone();
        history.insert((uuid.clone(), pattern.clone()));
        if history.len() >= all_matching {
            history.clear();
        }
        let new_provider = Provider {
            uuid: uuid.clone(),
            pattern: pattern.clone(),
            server_name: self.inner.server_name.clone(),
            deadline_millis: Some(deadline),
        };

        let (_entry, changed) = self
            .inner
            .cluster
            .upsert(
                name,
                Box::new(move |_cur| {
                    Some(ListenerEntry {
                        provider: Some(new_provider),
                        history,
                    })
                }),
            )
            .await;
        if !changed {
            return;
        }
        self.record_reconcile("assigned");

        if prev.provider.is_some() {
            self.broadcast_has_provider(name, false);
        }

        let frame = Frame::new(
            Topic::Record,
            Action::SubscriptionForPatternFound,
            vec![pattern, name.to_string()],
        );
        socket.send(frame.raw);

        let registry = self.clone();
        let name_owned = name.to_string();
        let timeout = self.inner.listen_response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.enqueue(&name_owned);
        });
    }

    async fn try_remove(&self, name: &str) {
        let prev = self.inner.cluster.get(name).await.unwrap_or_default();
        let Some(provider) = prev.provider.clone() else {
            return;
        };
        let is_local = provider.server_name == self.inner.server_name;
        let should_clear = is_local || !self.inner.cluster.remote_servers().contains(&provider.server_name);
        if !should_clear {
            return;
        }

        let history = prev.history.clone();
        let (_entry, changed) = self
            .inner
            .cluster
            .upsert(
                name,
                Box::new(move |_cur| {
                    Some(ListenerEntry {
                        provider: None,
                        history,
                    })
                }),
            )
            .await;
        if changed {
            self.record_reconcile("cleared");
        }
        if changed && is_local {
            if let Some(socket) = self.socket_for_uuid(&provider.uuid) {
                let frame = Frame::new(
                    Topic::Record,
                    Action::SubscriptionForPatternRemoved,
                    vec![provider.pattern, name.to_string()],
                );
                socket.send(frame.raw);
            }
        }
    }

    fn socket_for_uuid(&self, uuid: &str) -> Option<Arc<dyn Socket>> {
        self.inner
            .local
            .lock()
            .unwrap()
            .values()
            .find(|l| l.uuid == uuid)
            .map(|l| l.socket.clone())
    }

    fn broadcast_has_provider(&self, name: &str, has_provider: bool) {
        let frame = Frame::new(
            Topic::Record,
            Action::SubscriptionHasProvider,
            vec![name.to_string(), has_provider.to_string()],
        );
        self.inner.record_subs.send_to_subscribers(name, &frame, None);
    }

    /// Called right after a subscriber joins `name`: if a live provider
    /// already exists, tell just this subscriber rather than waiting for
    /// the next reconcile (which wouldn't re-announce an unchanged state).
    pub async fn notify_new_subscriber(&self, name: &str, socket: &Arc<dyn Socket>) {
        if let Some(entry) = self.inner.cluster.get(name).await {
            if self.is_alive(&entry.provider).await {
                let frame = Frame::new(
                    Topic::Record,
                    Action::SubscriptionHasProvider,
                    vec![name.to_string(), "true".to_string()],
                );
                socket.send(frame.raw);
            }
        }
    }

    pub fn accept(&self, socket: &Arc<dyn Socket>, pattern: &str, name: &str) {
        let uuid = match self.inner.local.lock().unwrap().get(&socket.id()) {
            Some(l) => l.uuid.clone(),
            None => return,
        };
        let registry = self.clone();
        let name = name.to_string();
        let pattern = pattern.to_string();
        let socket = socket.clone();
        let server_name = self.inner.server_name.clone();
        tokio::spawn(async move {
            let (_entry, changed) = registry
                .inner
                .cluster
                .upsert(
                    &name,
                    {
                        let uuid = uuid.clone();
                        let pattern = pattern.clone();
                        Box::new(move |cur| {
                            let cur = cur?;
                            match &cur.provider {
                                Some(p) if p.deadline_millis.is_some() => Some(ListenerEntry {
                                    provider: Some(Provider {
                                        uuid,
                                        pattern,
                                        server_name,
                                        deadline_millis: None,
                                    }),
                                    history: cur.history,
                                }),
                                _ => None,
                            }
                        })
                    },
                )
                .await;

            if !changed {
                let frame = Frame::new(
                    Topic::Record,
                    Action::SubscriptionForPatternRemoved,
                    vec![pattern, name],
                );
                socket.send(frame.raw);
                return;
            }
            registry.broadcast_has_provider(&name, true);
        });
    }

    pub fn reject(&self, socket: &Arc<dyn Socket>, pattern: &str, name: &str) {
        let uuid = match self.inner.local.lock().unwrap().get(&socket.id()) {
            Some(l) => l.uuid.clone(),
            None => return,
        };
        let registry = self.clone();
        let name = name.to_string();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let (_entry, changed) = registry
                .inner
                .cluster
                .upsert(
                    &name,
                    {
                        let uuid = uuid.clone();
                        let pattern = pattern.clone();
                        Box::new(move |cur| {
                            let cur = cur?;
                            match &cur.provider {
                                Some(p) if p.uuid == uuid && p.pattern == pattern => Some(ListenerEntry {
                                    provider: None,
                                    history: cur.history,
                                }),
                                _ => None,
                            }
                        })
                    },
                )
                .await;
            if changed {
                registry.enqueue(&name);
            }
        });
    }

    fn send_error(&self, socket: &Arc<dyn Socket>, code: ErrorCode, detail: &str) {
        let frame = Frame::new(Topic::Record, Action::Error, vec![code.to_string(), detail.to_string()]);
        socket.send(frame.raw);
    }
}

impl SubscriptionHook for ListenerRegistry {
    fn on_subscription_added(&self, name: &str, _socket_id: u64, local_count: usize) {
        if local_count == 1 {
            self.enqueue(name);
        }
    }

    fn on_subscription_removed(&self, name: &str, _socket_id: u64, local_count: usize) {
        if local_count == 0 {
            self.enqueue(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryClusterState;
    use crate::socket::test_support::RecordingSocket;

    fn new_registry() -> ListenerRegistry {
        let cluster: Arc<dyn ClusterStateMap> = Arc::new(InMemoryClusterState::new());
        let subs = SubscriptionRegistry::new(Topic::Record, Duration::ZERO);
        ListenerRegistry::new(cluster, subs, "node-a", Duration::from_millis(200))
    }

    #[tokio::test]
    async fn offers_name_to_matching_listener() {
        let registry = new_registry();
        let listener_socket = RecordingSocket::new(1);
        registry.listen(listener_socket.clone(), "user/.*");
        registry.inner.record_subs.subscribe("user/42", RecordingSocket::new(2));

        registry.try_add("user/42").await;

        let frames = listener_socket.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("SPF"));
        assert!(frames[0].contains("user/42"));

        let entry = registry.inner.cluster.get("user/42").await.unwrap();
        assert!(entry.provider.is_some());
    }

    #[tokio::test]
    async fn invalid_pattern_reports_invalid_message_data() {
        let registry = new_registry();
        let socket = RecordingSocket::new(1);
        registry.listen(socket.clone(), "(unterminated");
        let frames = socket.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("INVALID_MESSAGE_DATA"));
    }

    #[tokio::test]
    async fn reject_clears_provider_and_requeues() {
        let registry = new_registry();
        let listener_socket = RecordingSocket::new(1);
        registry.listen(listener_socket.clone(), "user/.*");
        registry.inner.record_subs.subscribe("user/42", RecordingSocket::new(2));
        registry.try_add("user/42").await;

        registry.reject(&(listener_socket.clone() as Arc<dyn Socket>), "user/.*", "user/42");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = registry.inner.cluster.get("user/42").await.unwrap();
        assert!(entry.provider.is_none());
        assert!(!entry.history.is_empty());
    }
}
