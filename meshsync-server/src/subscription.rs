//! Per-topic subscription index with a batched broadcast path.
//!
//! One [`SubscriptionRegistry`] is owned by each of the record, RPC, and
//! listener-pattern handlers. It tracks which sockets are subscribed to
//! which names, and coalesces outbound frames for a name into a single
//! buffer per broadcast tick so that N subscribers cost one allocation
//! instead of N.
//!
//! Sender exclusion works by recording byte ranges: a socket that
//! contributed frames to this tick's buffer gets a spliced copy with its
//! own contributions cut out, instead of echoing its own update back to it.

use crate::socket::Socket;
use meshsync_core::{Action, Frame, Topic};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Notified when a name's local subscriber count transitions to/from zero,
/// so `RecordHandler` can pin/unpin cache entries and `ListenerRegistry`
/// can reconcile provider assignment.
pub trait SubscriptionHook: Send + Sync {
    fn on_subscription_added(&self, name: &str, socket_id: u64, local_count: usize);
    fn on_subscription_removed(&self, name: &str, socket_id: u64, local_count: usize);
}

/// Fans a single hook slot out to several hooks, since the record and RPC
/// registries each need to notify both a cache-pinning hook and the
/// listener registry.
pub struct CompositeHook {
    hooks: Vec<Arc<dyn SubscriptionHook>>,
}

impl CompositeHook {
    pub fn new(hooks: Vec<Arc<dyn SubscriptionHook>>) -> Self {
        Self { hooks }
    }
}

impl SubscriptionHook for CompositeHook {
    fn on_subscription_added(&self, name: &str, socket_id: u64, local_count: usize) {
        for hook in &self.hooks {
            hook.on_subscription_added(name, socket_id, local_count);
        }
    }

    fn on_subscription_removed(&self, name: &str, socket_id: u64, local_count: usize) {
        for hook in &self.hooks {
            hook.on_subscription_removed(name, socket_id, local_count);
        }
    }
}

struct PendingBroadcast {
    buffer: String,
    /// socket_id -> byte ranges within `buffer` that originated from it.
    senders: HashMap<u64, Vec<(usize, usize)>>,
}

impl PendingBroadcast {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            senders: HashMap::new(),
        }
    }
}

struct Inner {
    topic: Topic,
    /// name -> (socket_id -> socket)
    subscribers: Mutex<HashMap<String, HashMap<u64, Arc<dyn Socket>>>>,
    /// socket_id -> names it is subscribed to, for O(names-per-socket) close cleanup
    socket_names: Mutex<HashMap<u64, HashSet<String>>>,
    pending: Mutex<HashMap<String, PendingBroadcast>>,
    broadcast_timeout: Duration,
    hook: Mutex<Option<Arc<dyn SubscriptionHook>>>,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl SubscriptionRegistry {
    pub fn new(topic: Topic, broadcast_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                topic,
                subscribers: Mutex::new(HashMap::new()),
                socket_names: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                broadcast_timeout,
                hook: Mutex::new(None),
            }),
        }
    }

    pub fn set_hook(&self, hook: Arc<dyn SubscriptionHook>) {
        *self.inner.hook.lock().unwrap() = Some(hook);
    }

    /// Spawn the periodic flush task when `broadcastTimeout > 0`. With the
    /// default of 0, `send_to_subscribers` flushes synchronously and no
    /// task is needed.
    pub fn spawn_broadcast_loop(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.inner.broadcast_timeout.is_zero() {
            return None;
        }
        let registry = self.clone();
        let interval = self.inner.broadcast_timeout;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.flush_all();
            }
        }))
    }

    /// True iff `socket` is already subscribed to `name`.
    pub fn is_subscribed(&self, name: &str, socket_id: u64) -> bool {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.contains_key(&socket_id))
            .unwrap_or(false)
    }

    /// Subscribe `socket` to `name`. Returns `false` (and signals
    /// `MULTIPLE_SUBSCRIPTIONS` to the socket) if already subscribed.
    pub fn subscribe(&self, name: &str, socket: Arc<dyn Socket>) -> bool {
        let socket_id = socket.id();
        let local_count = {
            let mut subs = self.inner.subscribers.lock().unwrap();
            let entry = subs.entry(name.to_string()).or_default();
            if entry.contains_key(&socket_id) {
                drop(subs);
                self.send_error(
                    &socket,
                    meshsync_core::ErrorCode::MultipleSubscriptions,
                    name,
                );
                return false;
            }
            entry.insert(socket_id, socket.clone());
            entry.len()
        };

        self.inner
            .socket_names
            .lock()
            .unwrap()
            .entry(socket_id)
            .or_default()
            .insert(name.to_string());

        if let Some(hook) = self.inner.hook.lock().unwrap().as_ref() {
            hook.on_subscription_added(name, socket_id, local_count);
        }
        true
    }

    /// Unsubscribe `socket_id` from `name`. Signals `NOT_SUBSCRIBED` to
    /// `socket` unless `silent` (used for close-triggered cleanup, where
    /// the caller doesn't have a live socket handle to notify anyway).
    pub fn unsubscribe(&self, name: &str, socket: &Arc<dyn Socket>, silent: bool) -> bool {
        let socket_id = socket.id();
        let (removed, local_count) = {
            let mut subs = self.inner.subscribers.lock().unwrap();
            match subs.get_mut(name) {
                Some(entry) => {
                    let removed = entry.remove(&socket_id).is_some();
                    let count = entry.len();
                    if entry.is_empty() {
                        subs.remove(name);
                    }
                    (removed, count)
                }
                None => (false, 0),
            }
        };

        if !removed {
            if !silent {
                self.send_error(socket, meshsync_core::ErrorCode::NotSubscribed, name);
            }
            return false;
        }

        if let Some(names) = self.inner.socket_names.lock().unwrap().get_mut(&socket_id) {
            names.remove(name);
        }

        if let Some(hook) = self.inner.hook.lock().unwrap().as_ref() {
            hook.on_subscription_removed(name, socket_id, local_count);
        }
        true
    }

    /// Remove every subscription held by `socket_id` (connection close).
    pub fn remove_socket(&self, socket_id: u64) {
        let names = self
            .inner
            .socket_names
            .lock()
            .unwrap()
            .remove(&socket_id)
            .unwrap_or_default();
        for name in names {
            let local_count = {
                let mut subs = self.inner.subscribers.lock().unwrap();
                if let Some(entry) = subs.get_mut(&name) {
                    entry.remove(&socket_id);
                    let count = entry.len();
                    if entry.is_empty() {
                        subs.remove(&name);
                    }
                    count
                } else {
                    0
                }
            };
            if let Some(hook) = self.inner.hook.lock().unwrap().as_ref() {
                hook.on_subscription_removed(&name, socket_id, local_count);
            }
        }
    }

    pub fn get_subscribers(&self, name: &str) -> Vec<Arc<dyn Socket>> {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .get(name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_count(&self, name: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .get(name)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.inner.subscribers.lock().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.subscribers.lock().unwrap().keys().cloned().collect()
    }

    /// Append `frame.raw` to the shared buffer for `name`. If
    /// `sender_id` is given, its contribution is recorded so it can be
    /// spliced out of the copy that sender ultimately receives. With
    /// `broadcastTimeout == 0` this flushes immediately.
    pub fn send_to_subscribers(&self, name: &str, frame: &Frame, sender_id: Option<u64>) {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            let entry = pending.entry(name.to_string()).or_insert_with(PendingBroadcast::new);
            let start = entry.buffer.len();
            entry.buffer.push_str(&frame.raw);
            let end = entry.buffer.len();
            if let Some(id) = sender_id {
                entry.senders.entry(id).or_default().push((start, end));
            }
        }
        if self.inner.broadcast_timeout.is_zero() {
            self.flush(name);
        }
    }

    fn flush_all(&self) {
        let names: Vec<String> = self.inner.pending.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.flush(&name);
        }
    }

    fn flush(&self, name: &str) {
        let pending = self.inner.pending.lock().unwrap().remove(name);
        let Some(pending) = pending else { return };
        if pending.buffer.is_empty() {
            return;
        }

        let recipients = self.get_subscribers(name);
        let shared: Arc<str> = Arc::from(pending.buffer.as_str());

        for socket in recipients {
            let id = socket.id();
            if let Some(gaps) = pending.senders.get(&id) {
                let spliced = splice_out(&pending.buffer, gaps);
                if !spliced.is_empty() {
                    socket.send(Arc::from(spliced));
                }
            } else {
                socket.send(shared.clone());
            }
        }
    }

    fn send_error(&self, socket: &Arc<dyn Socket>, code: meshsync_core::ErrorCode, name: &str) {
        let frame = Frame::new(
            self.inner.topic,
            Action::Error,
            vec![code.to_string(), name.to_string()],
        );
        socket.send(frame.raw);
    }

    pub fn send_error_to(&self, socket: &Arc<dyn Socket>, code: meshsync_core::ErrorCode, name: &str) {
        self.send_error(socket, code, name);
    }
}

/// Remove the byte ranges in `gaps` (assumed sorted, non-overlapping) from
/// `buffer`, returning the remainder.
fn splice_out(buffer: &str, gaps: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(buffer.len());
    let mut cursor = 0;
    for &(start, end) in gaps {
        if start > cursor {
            out.push_str(&buffer[cursor..start]);
        }
        cursor = end.max(cursor);
    }
    if cursor < buffer.len() {
        out.push_str(&buffer[cursor..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::test_support::RecordingSocket;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Topic::Record, Duration::ZERO)
    }

    #[test]
    fn subscribe_and_get_subscribers() {
        let reg = registry();
        let s1 = RecordingSocket::new(1);
        let s2 = RecordingSocket::new(2);
        assert!(reg.subscribe("foo", s1.clone()));
        assert!(reg.subscribe("foo", s2.clone()));
        assert_eq!(reg.local_count("foo"), 2);
    }

    #[test]
    fn duplicate_subscribe_signals_multiple_subscriptions() {
        let reg = registry();
        let s1 = RecordingSocket::new(1);
        assert!(reg.subscribe("foo", s1.clone()));
        assert!(!reg.subscribe("foo", s1.clone()));
        let frames = s1.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("MULTIPLE_SUBSCRIPTIONS"));
    }

    #[test]
    fn unsubscribe_removes_and_decrements() {
        let reg = registry();
        let s1 = RecordingSocket::new(1);
        reg.subscribe("foo", s1.clone());
        assert!(reg.unsubscribe("foo", &(s1.clone() as Arc<dyn Socket>), false));
        assert_eq!(reg.local_count("foo"), 0);
        assert!(!reg.has_name("foo"));
    }

    #[test]
    fn broadcast_excludes_sender_with_zero_timeout() {
        let reg = registry();
        let sender = RecordingSocket::new(1);
        let other = RecordingSocket::new(2);
        reg.subscribe("foo", sender.clone());
        reg.subscribe("foo", other.clone());

        let frame = Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "1-aaa".into()]);
        reg.send_to_subscribers("foo", &frame, Some(1));

        assert!(sender.frames().is_empty());
        assert_eq!(other.frames().len(), 1);
        assert_eq!(other.frames()[0], frame.raw);
    }

    #[test]
    fn broadcast_batches_multiple_frames_in_one_tick_with_delay() {
        let reg = SubscriptionRegistry::new(Topic::Record, Duration::from_millis(50));
        let other = RecordingSocket::new(2);
        reg.subscribe("foo", other.clone());

        let f1 = Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "1-aaa".into()]);
        let f2 = Frame::new(Topic::Record, Action::Update, vec!["foo".into(), "2-bbb".into()]);
        reg.send_to_subscribers("foo", &f1, None);
        reg.send_to_subscribers("foo", &f2, None);

        // Not flushed yet: nothing sent synchronously.
        assert!(other.frames().is_empty());
    }

    #[test]
    fn splice_out_removes_sender_ranges() {
        let buf = "AAABBBCCC";
        let out = splice_out(buf, &[(3, 6)]);
        assert_eq!(out, "AAACCC");
    }

    #[test]
    fn remove_socket_cleans_all_names() {
        let reg = registry();
        let s1 = RecordingSocket::new(1);
        reg.subscribe("foo", s1.clone());
        reg.subscribe("bar", s1.clone());
        reg.remove_socket(1);
        assert!(!reg.has_name("foo"));
        assert!(!reg.has_name("bar"));
    }
}
