//! Request/response dispatch between providers registered for a method
//! name and the clients that call it.
//!
//! Each call moves through `AwaitAccept -> AwaitResponse -> Done` keyed by
//! a correlation id the requester supplies on `REQUEST` (and which every
//! later frame for that call must carry). A provider that `REJECT`s is
//! excluded and another random candidate is tried; once no untried
//! provider remains the requester gets `NO_RPC_PROVIDER`. A provider that
//! never `ACCEPT`s before `rpcAckTimeout` does not get retried — the call
//! is terminated with `ACCEPT_TIMEOUT` straight to the requester, same as
//! a response timeout after accept. A `Done` call is kept a while longer
//! as a tombstone so a late frame referencing it gets
//! `INVALID_RPC_CORRELATION_ID` instead of being silently dropped.

use crate::metrics::ServerMetrics;
use crate::socket::Socket;
use crate::subscription::SubscriptionRegistry;
use meshsync_core::{Action, ErrorCode, Frame, Topic};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    AwaitAccept,
    AwaitResponse,
    Done,
}

struct PendingCall {
    requester: Arc<dyn Socket>,
    method: String,
    payload: String,
    provider_socket_id: u64,
    tried: HashSet<u64>,
    state: CallState,
    generation: u64,
}

struct Inner {
    providers: SubscriptionRegistry,
    pending: Mutex<HashMap<String, PendingCall>>,
    ack_timeout: Duration,
    response_timeout: Duration,
    metrics: Option<Arc<ServerMetrics>>,
}

#[derive(Clone)]
pub struct RpcHandler {
    inner: Arc<Inner>,
}

impl RpcHandler {
    pub fn new(ack_timeout: Duration, response_timeout: Duration, metrics: Option<Arc<ServerMetrics>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                providers: SubscriptionRegistry::new(Topic::Rpc, Duration::ZERO),
                pending: Mutex::new(HashMap::new()),
                ack_timeout,
                response_timeout,
                metrics,
            }),
        }
    }

    pub async fn dispatch(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        match frame.action {
            Action::Provide => self.handle_provide(socket, frame),
            Action::Unprovide => self.handle_unprovide(socket, frame),
            Action::Request => self.handle_request(socket, frame),
            Action::Accept => self.handle_accept(socket, frame),
            Action::Reject => self.handle_reject(socket, frame),
            Action::Response => self.handle_response(socket, frame),
            Action::Error => self.handle_provider_error(socket, frame),
            _ => self.send_error_to(&socket, ErrorCode::UnknownAction, frame.action.as_str()),
        }
    }

    pub fn remove_socket(&self, socket_id: u64) {
        self.inner.providers.remove_socket(socket_id);

        let (requester_affected, provider_affected): (Vec<String>, Vec<String>) = {
            let pending = self.inner.pending.lock().unwrap();
            let mut requester_affected = Vec::new();
            let mut provider_affected = Vec::new();
            for (id, call) in pending.iter() {
                if call.state == CallState::Done {
                    continue;
                }
                if call.requester.id() == socket_id {
                    requester_affected.push(id.clone());
                } else if call.provider_socket_id == socket_id {
                    provider_affected.push(id.clone());
                }
            }
            (requester_affected, provider_affected)
        };

        // The requester is gone: nowhere to deliver ACCEPT/RESPONSE, so the
        // call is terminated outright rather than tried against a new
        // provider.
        for correlation_id in requester_affected {
            self.inner.pending.lock().unwrap().remove(&correlation_id);
        }
        for correlation_id in provider_affected {
            self.advance_past_provider(&correlation_id, socket_id);
        }
    }

    /// `PROVIDE`/`UNPROVIDE` register a socket as a candidate for `method`
    /// via the same subscription registry the record and listener topics
    /// use, so a repeat `PROVIDE` for the same method from the same socket
    /// signals `MULTIPLE_SUBSCRIPTIONS` instead of silently no-opping.
    fn handle_provide(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(method) = frame.part(0) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "PR");
        };
        self.inner.providers.subscribe(method, socket);
    }

    fn handle_unprovide(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(method) = frame.part(0) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "UP");
        };
        self.inner.providers.unsubscribe(method, &socket, false);
    }

    fn handle_request(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let (Some(correlation_id), Some(method)) = (frame.part(0), frame.part(1)) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "REQ");
        };
        let payload = frame.part(2).unwrap_or("null").to_string();

        if self.inner.pending.lock().unwrap().contains_key(correlation_id) {
            return self.send_error_to(&socket, ErrorCode::InvalidRpcCorrelationId, correlation_id);
        }

        self.assign_provider(correlation_id, method, &payload, socket, HashSet::new(), 0);
    }

    /// Pick a provider not in `tried` and forward the request, or fail the
    /// call with `NO_RPC_PROVIDER` if none remain.
    fn assign_provider(
        &self,
        correlation_id: &str,
        method: &str,
        payload: &str,
        requester: Arc<dyn Socket>,
        tried: HashSet<u64>,
        generation: u64,
    ) {
        let candidate = {
            let providers = self.inner.providers.get_subscribers(method);
            providers
                .iter()
                .filter(|s| !tried.contains(&s.id()))
                .collect::<Vec<_>>()
                .choose(&mut rand::thread_rng())
                .map(|s| (*s).clone())
        };

        let Some(provider) = candidate else {
            self.inner.pending.lock().unwrap().remove(correlation_id);
            if let Some(m) = &self.inner.metrics {
                m.record_error("NO_RPC_PROVIDER");
            }
            return self.send_error_to(&requester, ErrorCode::NoRpcProvider, correlation_id);
        };

        let mut next_tried = tried;
        next_tried.insert(provider.id());
        let next_generation = generation + 1;

        self.inner.pending.lock().unwrap().insert(
            correlation_id.to_string(),
            PendingCall {
                requester: requester.clone(),
                method: method.to_string(),
                payload: payload.to_string(),
                provider_socket_id: provider.id(),
                tried: next_tried,
                state: CallState::AwaitAccept,
                generation: next_generation,
            },
        );

        let request_frame = Frame::new(
            Topic::Rpc,
            Action::Request,
            vec![correlation_id.to_string(), method.to_string(), payload.to_string()],
        );
        provider.send(request_frame.raw);

        let handler = self.clone();
        let correlation_id = correlation_id.to_string();
        let timeout = self.inner.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handler.on_ack_timeout(&correlation_id, next_generation);
        });
    }

    /// `rpcAckTimeout` expiring means no provider ever committed to the
    /// call, so it terminates straight to the requester rather than
    /// retrying — only an explicit `REJECT` tries another provider.
    fn on_ack_timeout(&self, correlation_id: &str, generation: u64) {
        let still_waiting = {
            let pending = self.inner.pending.lock().unwrap();
            pending
                .get(correlation_id)
                .map(|c| c.generation == generation && c.state == CallState::AwaitAccept)
                .unwrap_or(false)
        };
        if !still_waiting {
            return;
        }
        if let Some(m) = &self.inner.metrics {
            m.record_error("ACCEPT_TIMEOUT");
        }
        let call = self.inner.pending.lock().unwrap().remove(correlation_id);
        if let Some(call) = call {
            self.send_error_to(&call.requester, ErrorCode::AcceptTimeout, correlation_id);
        }
    }

    fn on_response_timeout(&self, correlation_id: &str, generation: u64) {
        let still_waiting = {
            let pending = self.inner.pending.lock().unwrap();
            pending
                .get(correlation_id)
                .map(|c| c.generation == generation && c.state == CallState::AwaitResponse)
                .unwrap_or(false)
        };
        if !still_waiting {
            return;
        }
        if let Some(m) = &self.inner.metrics {
            m.record_error("RESPONSE_TIMEOUT");
        }
        // unlike an accept timeout, a response timeout does not retry: the
        // provider already committed to answering.
        let call = self.inner.pending.lock().unwrap().remove(correlation_id);
        if let Some(call) = call {
            self.send_error_to(&call.requester, ErrorCode::ResponseTimeout, correlation_id);
        }
    }

    /// The only retry path: an explicit `REJECT` from the current
    /// provider. Tries the next untried candidate for the same call.
    fn retry_or_fail(&self, correlation_id: &str) {
        let state = self.inner.pending.lock().unwrap().remove(correlation_id);
        let Some(call) = state else { return };
        self.assign_provider(
            correlation_id,
            &call.method,
            &call.payload,
            call.requester,
            call.tried,
            call.generation,
        );
    }

    /// A provider that was mid-call disappeared; move on to the next
    /// candidate the same way a `REJECT` would.
    fn advance_past_provider(&self, correlation_id: &str, provider_socket_id: u64) {
        let call = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.get(correlation_id) {
                Some(c) if c.provider_socket_id == provider_socket_id && c.state != CallState::Done => pending.remove(correlation_id),
                _ => None,
            }
        };
        let Some(call) = call else { return };
        self.assign_provider(
            correlation_id,
            &call.method,
            &call.payload,
            call.requester,
            call.tried,
            call.generation,
        );
    }

    fn handle_accept(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(correlation_id) = frame.part(0) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "A");
        };

        enum Outcome {
            Accepted(u64),
            MultipleAccept { method: String, payload: String },
            Invalid,
        }

        let outcome = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.get_mut(correlation_id) {
                Some(call) if call.provider_socket_id != socket.id() => Outcome::Invalid,
                Some(call) if call.state == CallState::AwaitAccept => {
                    call.state = CallState::AwaitResponse;
                    Outcome::Accepted(call.generation)
                }
                Some(call) if call.state == CallState::AwaitResponse => Outcome::MultipleAccept {
                    method: call.method.clone(),
                    payload: call.payload.clone(),
                },
                Some(_) => Outcome::Invalid,
                None => Outcome::Invalid,
            }
        };

        match outcome {
            Outcome::Accepted(generation) => {
                let handler = self.clone();
                let correlation_id = correlation_id.to_string();
                let timeout = self.inner.response_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    handler.on_response_timeout(&correlation_id, generation);
                });
            }
            // A second provider accepted after the first already did. The
            // original request is re-forwarded so the late accepter still
            // gets the work it just committed to, alongside the error
            // telling it another provider is already handling this call.
            Outcome::MultipleAccept { method, payload } => {
                let request_frame = Frame::new(Topic::Rpc, Action::Request, vec![correlation_id.to_string(), method, payload]);
                socket.send(request_frame.raw);
                self.send_error_to(&socket, ErrorCode::MultipleAccept, correlation_id);
            }
            Outcome::Invalid => self.send_error_to(&socket, ErrorCode::InvalidRpcCorrelationId, correlation_id),
        }
    }

    fn handle_reject(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(correlation_id) = frame.part(0) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "RJ");
        };
        let matches = {
            let pending = self.inner.pending.lock().unwrap();
            pending
                .get(correlation_id)
                .map(|c| c.provider_socket_id == socket.id() && c.state == CallState::AwaitAccept)
                .unwrap_or(false)
        };
        if !matches {
            return self.send_error_to(&socket, ErrorCode::InvalidRpcCorrelationId, correlation_id);
        }
        self.retry_or_fail(correlation_id);
    }

    fn handle_response(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(correlation_id) = frame.part(0) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "RES");
        };
        let result = frame.part(1).unwrap_or("null").to_string();
        self.complete(&socket, correlation_id, |requester| {
            let resp = Frame::new(Topic::Rpc, Action::Response, vec![correlation_id.to_string(), result]);
            requester.send(resp.raw);
        });
    }

    fn handle_provider_error(&self, socket: Arc<dyn Socket>, frame: &Frame) {
        let Some(correlation_id) = frame.part(0) else {
            return self.send_error_to(&socket, ErrorCode::InvalidMessageData, "E");
        };
        let message = frame.part(1).unwrap_or("").to_string();
        self.complete(&socket, correlation_id, |requester| {
            let err = Frame::new(Topic::Rpc, Action::Error, vec![correlation_id.to_string(), message]);
            requester.send(err.raw);
        });
    }

    /// Shared tail of RESPONSE/ERROR handling: validate the provider owns
    /// an in-flight call, hand the requester-facing frame to `emit`, mark
    /// the call `Done`, and schedule tombstone cleanup.
    fn complete(&self, socket: &Arc<dyn Socket>, correlation_id: &str, emit: impl FnOnce(&Arc<dyn Socket>)) {
        let requester = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.get_mut(correlation_id) {
                Some(call) if call.provider_socket_id == socket.id() && call.state == CallState::AwaitResponse => {
                    call.state = CallState::Done;
                    Some(call.requester.clone())
                }
                _ => None,
            }
        };
        let Some(requester) = requester else {
            return self.send_error_to(socket, ErrorCode::InvalidRpcCorrelationId, correlation_id);
        };
        emit(&requester);

        let handler = self.clone();
        let correlation_id = correlation_id.to_string();
        let grace = self.inner.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            handler.inner.pending.lock().unwrap().remove(&correlation_id);
        });
    }

    fn send_error_to(&self, socket: &Arc<dyn Socket>, code: ErrorCode, detail: &str) {
        let frame = Frame::new(Topic::Rpc, Action::Error, vec![code.to_string(), detail.to_string()]);
        socket.send(frame.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::test_support::RecordingSocket;
    use std::time::Duration;

    fn handler() -> RpcHandler {
        RpcHandler::new(Duration::from_millis(30), Duration::from_millis(30), None)
    }

    fn provide(h: &RpcHandler, socket: Arc<RecordingSocket>, method: &str) {
        let f = Frame::new(Topic::Rpc, Action::Provide, vec![method.into()]);
        h.handle_provide(socket, &f);
    }

    #[tokio::test]
    async fn full_round_trip_delivers_response() {
        let h = handler();
        let provider = RecordingSocket::new(1);
        provide(&h, provider.clone(), "add");

        let requester = RecordingSocket::new(2);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "add".into(), "[1,2]".into()]),
        )
        .await;

        let req_frame = provider.frames();
        assert_eq!(req_frame.len(), 1);
        assert!(req_frame[0].contains("add"));

        h.dispatch(provider.clone(), &Frame::new(Topic::Rpc, Action::Accept, vec!["c1".into()]))
            .await;
        h.dispatch(
            provider.clone(),
            &Frame::new(Topic::Rpc, Action::Response, vec!["c1".into(), "3".into()]),
        )
        .await;

        let resp = requester.frames();
        assert_eq!(resp.len(), 1);
        assert!(resp[0].contains("RES") || resp[0].contains('3'));
    }

    #[tokio::test]
    async fn no_provider_signals_no_rpc_provider() {
        let h = handler();
        let requester = RecordingSocket::new(1);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "missing".into(), "null".into()]),
        )
        .await;
        let frames = requester.frames();
        assert!(frames[0].contains("NO_RPC_PROVIDER"));
    }

    #[tokio::test]
    async fn duplicate_provide_signals_multiple_subscriptions() {
        let h = handler();
        let p1 = RecordingSocket::new(1);
        provide(&h, p1.clone(), "add");
        provide(&h, p1.clone(), "add");
        let frames = p1.frames();
        assert!(frames.iter().any(|f| f.contains("MULTIPLE_SUBSCRIPTIONS")));
    }

    #[tokio::test]
    async fn reject_tries_next_provider() {
        let h = handler();
        let p1 = RecordingSocket::new(1);
        let p2 = RecordingSocket::new(2);
        provide(&h, p1.clone(), "add");
        provide(&h, p2.clone(), "add");

        let requester = RecordingSocket::new(3);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "add".into(), "null".into()]),
        )
        .await;

        let (first, second) = if !p1.frames().is_empty() { (p1.clone(), p2.clone()) } else { (p2.clone(), p1.clone()) };

        h.dispatch(first.clone(), &Frame::new(Topic::Rpc, Action::Reject, vec!["c1".into()]))
            .await;

        assert_eq!(second.frames().len(), 1);
    }

    #[tokio::test]
    async fn late_accept_after_completion_is_invalid() {
        let h = handler();
        let provider = RecordingSocket::new(1);
        provide(&h, provider.clone(), "add");
        let requester = RecordingSocket::new(2);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "add".into(), "null".into()]),
        )
        .await;
        h.dispatch(provider.clone(), &Frame::new(Topic::Rpc, Action::Accept, vec!["c1".into()]))
            .await;
        h.dispatch(
            provider.clone(),
            &Frame::new(Topic::Rpc, Action::Response, vec!["c1".into(), "1".into()]),
        )
        .await;

        h.dispatch(provider.clone(), &Frame::new(Topic::Rpc, Action::Accept, vec!["c1".into()]))
            .await;
        let frames = provider.frames();
        assert!(frames.iter().any(|f| f.contains("INVALID_RPC_CORRELATION_ID")));
    }

    #[tokio::test]
    async fn multiple_accept_reforwards_request() {
        let h = handler();
        let provider = RecordingSocket::new(1);
        provide(&h, provider.clone(), "add");
        let requester = RecordingSocket::new(2);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "add".into(), "[1,2]".into()]),
        )
        .await;

        h.dispatch(provider.clone(), &Frame::new(Topic::Rpc, Action::Accept, vec!["c1".into()]))
            .await;
        h.dispatch(provider.clone(), &Frame::new(Topic::Rpc, Action::Accept, vec!["c1".into()]))
            .await;

        let frames = provider.frames();
        assert_eq!(frames.len(), 3);
        assert!(frames[1].contains("add"));
        assert!(frames[2].contains("MULTIPLE_ACCEPT"));
    }

    #[tokio::test]
    async fn requester_disconnect_terminates_pending_call() {
        let h = handler();
        let provider = RecordingSocket::new(1);
        provide(&h, provider.clone(), "add");
        let requester = RecordingSocket::new(2);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "add".into(), "null".into()]),
        )
        .await;

        h.remove_socket(requester.id());

        h.dispatch(provider.clone(), &Frame::new(Topic::Rpc, Action::Accept, vec!["c1".into()]))
            .await;
        let frames = provider.frames();
        assert!(frames.iter().any(|f| f.contains("INVALID_RPC_CORRELATION_ID")));
    }

    #[tokio::test]
    async fn accept_timeout_terminates_call() {
        let h = RpcHandler::new(Duration::from_millis(10), Duration::from_millis(100), None);
        let p1 = RecordingSocket::new(1);
        provide(&h, p1.clone(), "add");

        let requester = RecordingSocket::new(2);
        h.dispatch(
            requester.clone(),
            &Frame::new(Topic::Rpc, Action::Request, vec!["c1".into(), "add".into(), "null".into()]),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(p1.frames().len(), 1);
        let frames = requester.frames();
        assert!(frames.iter().any(|f| f.contains("ACCEPT_TIMEOUT")));
    }
}
