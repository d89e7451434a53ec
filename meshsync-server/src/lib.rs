//! Realtime record sync and RPC server.
//!
//! - **record sync**: clients `READ`/`UPDATE` named records; updates merge
//!   via last-writer-wins versioning and fan out to every subscriber
//! - **listeners**: clients register regex patterns and are offered
//!   exclusive "provider" status for actively-subscribed names that match
//! - **RPC**: clients `PROVIDE` a method name and `REQUEST`/`ACCEPT`/
//!   `RESPONSE` calls route between requester and provider
//!
//! ```rust,no_run
//! use meshsync_server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr: std::net::SocketAddr = "127.0.0.1:7700".parse()?;
//!     let server = Server::builder().bind(addr).server_name("node-a").build().await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod builder;
mod cluster;
mod connection;
mod listener;
mod metrics;
mod record;
mod rpc;
mod socket;
mod storage;
mod subscription;

pub use builder::ServerBuilder;
pub use cluster::{ClusterStateMap, InMemoryClusterState, ListenerEntry, Provider};
pub use listener::ListenerRegistry;
pub use metrics::ServerMetrics;
pub use record::RecordHandler;
pub use rpc::RpcHandler;
pub use socket::Socket;
pub use storage::{ChangeEvent, MemoryStorage, SledStorage, Storage, StorageError, StoredRecord};
pub use subscription::{SubscriptionHook, SubscriptionRegistry};

use meshsync_core::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// A bound server ready to accept connections. Construct with
/// [`Server::builder`].
pub struct Server {
    listener: TcpListener,
    record_handler: Arc<RecordHandler>,
    rpc_handler: Arc<RpcHandler>,
    metrics: Option<Arc<ServerMetrics>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn record_handler(&self) -> &Arc<RecordHandler> {
        &self.record_handler
    }

    pub fn rpc_handler(&self) -> &Arc<RpcHandler> {
        &self.rpc_handler
    }

    /// Accept connections and dispatch frames until the listener errors.
    /// Starts the broadcast flush loop and listener reconcile loops on
    /// first call.
    #[tracing::instrument(skip(self), name = "server.run")]
    pub async fn run(&self) -> Result<()> {
        self.record_handler.spawn_background_tasks();

        tracing::info!("accepting connections");
        let conn_counter = AtomicU64::new(0);

        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| meshsync_core::Error::Io(e.to_string()))?;
            let conn_id = conn_counter.fetch_add(1, Ordering::SeqCst);
            let record_handler = Arc::clone(&self.record_handler);
            let rpc_handler = Arc::clone(&self.rpc_handler);
            let metrics = self.metrics.clone();

            tracing::info!(conn_id, %addr, "connection accepted");
            if let Some(m) = &metrics {
                m.record_connection(conn_counter.load(Ordering::SeqCst) as i64);
            }

            tokio::spawn(async move {
                if let Err(e) = connection::handle_connection(stream, conn_id, record_handler, rpc_handler, metrics).await {
                    tracing::error!(conn_id, error = %e, "connection error");
                }
            });
        }
    }
}
