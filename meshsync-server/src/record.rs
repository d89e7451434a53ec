//! Record handling: the READ/UPDATE dispatch, the version-domination merge
//! rule that resolves conflicting writes, and a subscriber-pinned LRU
//! cache sitting in front of the storage plugin.

use crate::listener::ListenerRegistry;
use crate::metrics::ServerMetrics;
use crate::socket::Socket;
use crate::storage::{ChangeEvent, Storage, StorageError, StoredRecord};
use crate::subscription::{CompositeHook, SubscriptionHook, SubscriptionRegistry};
use meshsync_core::{Action, ErrorCode, Frame, Topic, Version};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

struct CacheEntry {
    version: Version,
    raw: Option<Arc<str>>,
    pinned: bool,
}

/// Size-bounded cache over unpinned entries; a record with at least one
/// subscriber is pinned and exempt from eviction, so the cache may exceed
/// `capacity` while every entry in it is actively watched.
struct RecordCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    /// Touch order, most-recently-used at the back. May contain stale
    /// names already removed from `entries`; those are skipped on sweep.
    lru: VecDeque<String>,
}

impl RecordCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn touch(&mut self, name: &str) {
        self.lru.push_back(name.to_string());
    }

    fn get(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    fn insert_loading(&mut self, name: &str) {
        self.entries.entry(name.to_string()).or_insert(CacheEntry {
            version: Version::loading(),
            raw: None,
            pinned: false,
        });
        self.touch(name);
    }

    /// Apply the domination rule against the current entry (if any).
    /// Returns `true` if `incoming` replaced it.
    fn apply(&mut self, name: &str, incoming: &Version, raw: Arc<str>) -> bool {
        let dominates = match self.entries.get(name) {
            Some(prev) if prev.raw.is_some() => incoming.dominates(&prev.version),
            _ => true,
        };
        if !dominates {
            return false;
        }
        let pinned = self.entries.get(name).map(|e| e.pinned).unwrap_or(false);
        self.entries.insert(
            name.to_string(),
            CacheEntry {
                version: incoming.clone(),
                raw: Some(raw),
                pinned,
            },
        );
        self.touch(name);
        self.evict_if_needed();
        true
    }

    fn drop_unrefreshed(&mut self, name: &str) {
        self.entries.remove(name);
    }

    fn pin(&mut self, name: &str) {
        if let Some(e) = self.entries.get_mut(name) {
            e.pinned = true;
        }
    }

    fn unpin(&mut self, name: &str) {
        if let Some(e) = self.entries.get_mut(name) {
            e.pinned = false;
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(candidate) = self.lru.pop_front() else { break };
            match self.entries.get(&candidate) {
                Some(e) if !e.pinned => {
                    self.entries.remove(&candidate);
                }
                Some(_) => {
                    // pinned; entry survives, candidate dropped from this sweep
                }
                None => {
                    // stale lru entry, already gone
                }
            }
        }
    }
}

struct CachePinHook {
    cache: Arc<Mutex<RecordCache>>,
}

impl SubscriptionHook for CachePinHook {
    fn on_subscription_added(&self, name: &str, _socket_id: u64, local_count: usize) {
        if local_count == 1 {
            self.cache.lock().unwrap().pin(name);
        }
    }

    fn on_subscription_removed(&self, name: &str, _socket_id: u64, local_count: usize) {
        if local_count == 0 {
            self.cache.lock().unwrap().unpin(name);
        }
    }
}

pub struct RecordHandler {
    cache: Arc<Mutex<RecordCache>>,
    subs: SubscriptionRegistry,
    storage: Arc<dyn Storage>,
    storage_exclusion: Option<Regex>,
    listeners: ListenerRegistry,
    metrics: Option<Arc<ServerMetrics>>,
}

impl RecordHandler {
    pub fn new(
        cache_size: usize,
        broadcast_timeout: std::time::Duration,
        storage: Arc<dyn Storage>,
        storage_exclusion: Option<Regex>,
        cluster: Arc<dyn crate::cluster::ClusterStateMap>,
        server_name: impl Into<String>,
        listen_response_timeout: std::time::Duration,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        let cache = Arc::new(Mutex::new(RecordCache::new(cache_size)));
        let subs = SubscriptionRegistry::new(Topic::Record, broadcast_timeout);
        let listeners = ListenerRegistry::with_metrics(
            cluster,
            subs.clone(),
            server_name,
            listen_response_timeout,
            metrics.clone(),
        );

        let pin_hook = Arc::new(CachePinHook { cache: cache.clone() });
        let composite = CompositeHook::new(vec![
            pin_hook as Arc<dyn SubscriptionHook>,
            Arc::new(listeners.clone()) as Arc<dyn SubscriptionHook>,
        ]);
        subs.set_hook(Arc::new(composite));

        Self {
            cache,
            subs,
            storage,
            storage_exclusion,
            listeners,
            metrics,
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subs
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Wire the background tasks: broadcast flush, listener reconcile
    /// loops, and the storage changefeed consumer.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        self.subs.spawn_broadcast_loop();
        self.listeners.spawn_reconcile_loops();

        let handler = Arc::clone(self);
        let mut changes = self.storage.changes();
        tokio::spawn(async move {
            while let Ok(event) = changes.recv().await {
                handler.on_storage_change(event).await;
            }
        });
    }

    pub async fn dispatch(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        match frame.action {
            Action::Read => self.handle_read(socket, frame).await,
            Action::Update => self.handle_update(socket, frame).await,
            Action::Unsubscribe => self.handle_unsubscribe(socket, frame),
            Action::Listen => self.handle_listen(socket, frame),
            Action::Unlisten => self.handle_unlisten(socket, frame),
            Action::ListenAccept => self.handle_listen_accept(socket, frame),
            Action::ListenReject => self.handle_listen_reject(socket, frame),
            _ => self.send_error(&socket, ErrorCode::UnknownAction, frame.action.as_str()),
        }
    }

    pub fn remove_socket(&self, socket_id: u64) {
        self.subs.remove_socket(socket_id);
        self.listeners.remove_socket(socket_id);
    }

    async fn handle_read(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(name) = frame.part(0) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "READ");
        };
        let name = name.to_string();

        if !self.subs.subscribe(&name, socket.clone()) {
            return;
        }
        self.listeners.notify_new_subscriber(&name, &socket).await;

        let hydrated_raw = {
            let cache = self.cache.lock().unwrap();
            cache.get(&name).and_then(|e| e.raw.clone())
        };
        if let Some(raw) = hydrated_raw {
            socket.send(raw);
            return;
        }

        let already_loading = {
            let mut cache = self.cache.lock().unwrap();
            let was_absent = cache.get(&name).is_none();
            cache.insert_loading(&name);
            !was_absent
        };
        if already_loading {
            return;
        }

        if self.is_excluded(&name) {
            return;
        }

        let storage = Arc::clone(&self.storage);
        let name_owned = name.clone();
        let cache = Arc::clone(&self.cache);
        let subs = self.subs.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match storage.get(&name_owned).await {
                Ok(record) => {
                    let frame = Frame::new(
                        Topic::Record,
                        Action::Update,
                        vec![record.name.clone(), record.version.to_string(), record.body.to_string()],
                    );
                    merge_into_cache(&cache, &subs, &name_owned, &record.version, frame, None, metrics.as_ref());
                }
                Err(StorageError::NotFound(_)) => {
                    cache.lock().unwrap().drop_unrefreshed(&name_owned);
                }
                Err(e) => {
                    cache.lock().unwrap().drop_unrefreshed(&name_owned);
                    if let Some(m) = &metrics {
                        m.record_error("RECORD_LOAD_ERROR");
                    }
                    tracing::error!(name = %name_owned, error = %e, "RECORD_LOAD_ERROR");
                }
            }
        });
    }

    async fn handle_update(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let (Some(name), Some(version_str), body) = (frame.part(0), frame.part(1), frame.part(2)) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "UPDATE");
        };
        let body = body.unwrap_or("null").to_string();

        let version = match Version::parse(version_str) {
            Ok(v) => v,
            Err(_) => return self.send_error(&socket, ErrorCode::InvalidVersion, version_str),
        };

        let update_frame = Frame::new(
            Topic::Record,
            Action::Update,
            vec![name.to_string(), version_str.to_string(), body.clone()],
        );

        if self.should_write_through(&version, name) {
            let body_json: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
            let storage = Arc::clone(&self.storage);
            let name_owned = name.to_string();
            let version_owned = version.clone();
            let socket_for_err = socket.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let result = storage
                    .set(StoredRecord {
                        name: name_owned.clone(),
                        version: version_owned,
                        body: body_json,
                    })
                    .await;
                if let Err(e) = result {
                    if let Some(m) = &metrics {
                        m.record_error("RECORD_UPDATE_ERROR");
                    }
                    tracing::error!(name = %name_owned, error = %e, "RECORD_UPDATE_ERROR");
                    let err_frame = Frame::new(
                        Topic::Record,
                        Action::Error,
                        vec![ErrorCode::RecordUpdateError.to_string(), name_owned],
                    );
                    socket_for_err.send(err_frame.raw);
                }
            });
        }

        merge_into_cache(&self.cache, &self.subs, name, &version, update_frame, Some(socket.id()), self.metrics.as_ref());
    }

    fn handle_unsubscribe(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(name) = frame.part(0) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "UNSUBSCRIBE");
        };
        self.subs.unsubscribe(name, &socket, false);
    }

    fn handle_listen(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(pattern) = frame.part(0) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "LISTEN");
        };
        self.listeners.listen(socket, pattern);
    }

    fn handle_unlisten(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(pattern) = frame.part(0) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "UNLISTEN");
        };
        self.listeners.unlisten(socket.id(), pattern);
    }

    fn handle_listen_accept(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let (Some(pattern), Some(name)) = (frame.part(0), frame.part(1)) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "LA");
        };
        self.listeners.accept(&socket, pattern, name);
    }

    fn handle_listen_reject(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let (Some(pattern), Some(name)) = (frame.part(0), frame.part(1)) else {
            return self.send_error(&socket, ErrorCode::InvalidMessageData, "LR");
        };
        self.listeners.reject(&socket, pattern, name);
    }

    async fn on_storage_change(&self, event: ChangeEvent) {
        if self.subs.local_count(&event.name) == 0 {
            self.cache.lock().unwrap().drop_unrefreshed(&event.name);
            return;
        }
        let up_to_date = self
            .cache
            .lock()
            .unwrap()
            .get(&event.name)
            .map(|e| !event.version.dominates(&e.version))
            .unwrap_or(false);
        if up_to_date {
            return;
        }
        if let Ok(record) = self.storage.get(&event.name).await {
            let frame = Frame::new(
                Topic::Record,
                Action::Update,
                vec![record.name.clone(), record.version.to_string(), record.body.to_string()],
            );
            merge_into_cache(&self.cache, &self.subs, &event.name, &record.version, frame, None, self.metrics.as_ref());
        }
    }

    fn should_write_through(&self, version: &Version, name: &str) -> bool {
        if self.is_excluded(name) {
            return false;
        }
        matches!(version.num, meshsync_core::VersionNum::Num(n) if n > 0 && n < (1u64 << 53))
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.storage_exclusion.as_ref().map(|re| re.is_match(name)).unwrap_or(false)
    }

    fn send_error(&self, socket: &Arc<dyn Socket>, code: ErrorCode, detail: &str) {
        let frame = Frame::new(Topic::Record, Action::Error, vec![code.to_string(), detail.to_string()]);
        socket.send(frame.raw);
    }
}

fn merge_into_cache(
    cache: &Arc<Mutex<RecordCache>>,
    subs: &SubscriptionRegistry,
    name: &str,
    version: &Version,
    frame: Frame,
    sender_id: Option<u64>,
    metrics: Option<&Arc<ServerMetrics>>,
) {
    let (applied, len) = {
        let mut cache = cache.lock().unwrap();
        let applied = cache.apply(name, version, frame.raw.clone());
        (applied, cache.len())
    };
    if applied {
        subs.send_to_subscribers(name, &frame, sender_id);
        if let Some(m) = metrics {
            m.update_records_cached(len as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryClusterState;
    use crate::socket::test_support::RecordingSocket;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn handler() -> Arc<RecordHandler> {
        Arc::new(RecordHandler::new(
            100,
            Duration::ZERO,
            MemoryStorage::new(),
            None,
            Arc::new(InMemoryClusterState::new()),
            "node-a",
            Duration::from_millis(200),
            None,
        ))
    }

    #[tokio::test]
    async fn update_then_read_round_trips() {
        let h = handler();
        let writer = RecordingSocket::new(1);
        let update = Frame::new(
            Topic::Record,
            Action::Update,
            vec!["foo".into(), "1-aaa".into(), "{\"x\":1}".into()],
        );
        h.dispatch(writer.clone(), &update).await;

        let reader = RecordingSocket::new(2);
        let read = Frame::new(Topic::Record, Action::Read, vec!["foo".into()]);
        h.dispatch(reader.clone(), &read).await;

        let frames = reader.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("1-aaa"));
    }

    #[tokio::test]
    async fn stale_update_is_dropped() {
        let h = handler();
        let s1 = RecordingSocket::new(1);
        h.dispatch(
            s1.clone(),
            &Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "5-aaa".into(), "1".into()]),
        )
        .await;
        h.dispatch(
            s1.clone(),
            &Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "4-zzz".into(), "2".into()]),
        )
        .await;

        let reader = RecordingSocket::new(2);
        h.dispatch(reader.clone(), &Frame::new(Topic::Record, Action::Read, vec!["foo".into()]))
            .await;
        assert!(reader.frames()[0].contains("5-aaa"));
    }

    #[tokio::test]
    async fn tag_tiebreak_on_equal_numeric_version() {
        let h = handler();
        let s1 = RecordingSocket::new(1);
        h.dispatch(
            s1.clone(),
            &Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "5-aaa".into(), "1".into()]),
        )
        .await;
        h.dispatch(
            s1.clone(),
            &Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "5-zzz".into(), "2".into()]),
        )
        .await;

        let reader = RecordingSocket::new(2);
        h.dispatch(reader.clone(), &Frame::new(Topic::Record, Action::Read, vec!["foo".into()]))
            .await;
        assert!(reader.frames()[0].contains("5-zzz"));
    }

    #[tokio::test]
    async fn inf_dominates_subsequent_numeric_updates() {
        let h = handler();
        let s1 = RecordingSocket::new(1);
        h.dispatch(
            s1.clone(),
            &Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "INF-aaa".into(), "1".into()]),
        )
        .await;
        h.dispatch(
            s1.clone(),
            &Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "999-zzz".into(), "2".into()]),
        )
        .await;

        let reader = RecordingSocket::new(2);
        h.dispatch(reader.clone(), &Frame::new(Topic::Record, Action::Read, vec!["foo".into()]))
            .await;
        assert!(reader.frames()[0].contains("INF-aaa"));
    }

    #[tokio::test]
    async fn subscriber_with_pending_record_is_pinned() {
        let h = handler();
        let reader = RecordingSocket::new(1);
        h.dispatch(reader.clone(), &Frame::new(Topic::Record, Action::Read, vec!["unset".into()]))
            .await;
        assert!(h.cache.lock().unwrap().get("unset").map(|e| e.pinned).unwrap_or(false));
    }

    #[tokio::test]
    async fn double_subscribe_signals_multiple_subscriptions() {
        let h = handler();
        let reader = RecordingSocket::new(1);
        let read = Frame::new(Topic::Record, Action::Read, vec!["foo".into()]);
        h.dispatch(reader.clone(), &read).await;
        h.dispatch(reader.clone(), &read).await;
        assert!(reader.frames().iter().any(|f| f.contains("MULTIPLE_SUBSCRIPTIONS")));
    }
}
