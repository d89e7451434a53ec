//! The `Socket` abstraction the core dispatches through. A concrete
//! transport (the WebSocket binding in `connection.rs`, or an in-memory
//! channel in tests) only needs to hand out `Arc<dyn Socket>` handles.

use std::sync::Arc;

/// A single addressable endpoint. `send` best-efforts delivery — a closed
/// peer simply drops frames rather than erroring the caller, matching how
/// the registries treat disconnects as eventually-consistent via the close
/// hook rather than the synchronous send path.
pub trait Socket: Send + Sync {
    fn id(&self) -> u64;
    fn send(&self, frame: Arc<str>);
}

impl std::fmt::Debug for dyn Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Socket({})", self.id())
    }
}

/// A `Socket` backed by a `tokio::sync::mpsc` channel, used by the
/// WebSocket connection binding: the send loop reads from the receiving
/// half and writes to the wire, decoupling `send()` from backpressure on
/// the actual I/O.
pub struct ChannelSocket {
    id: u64,
    tx: tokio::sync::mpsc::UnboundedSender<Arc<str>>,
}

impl ChannelSocket {
    pub fn new(id: u64, tx: tokio::sync::mpsc::UnboundedSender<Arc<str>>) -> Arc<Self> {
        Arc::new(Self { id, tx })
    }
}

impl Socket for ChannelSocket {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: Arc<str>) {
        let _ = self.tx.send(frame);
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An in-process `Socket` that records every frame sent to it, for
    /// assertions in integration-style tests.
    pub struct RecordingSocket {
        id: u64,
        pub received: Mutex<Vec<Arc<str>>>,
    }

    impl RecordingSocket {
        pub fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn frames(&self) -> Vec<Arc<str>> {
            self.received.lock().unwrap().clone()
        }
    }

    impl Socket for RecordingSocket {
        fn id(&self) -> u64 {
            self.id
        }

        fn send(&self, frame: Arc<str>) {
            self.received.lock().unwrap().push(frame);
        }
    }
}
