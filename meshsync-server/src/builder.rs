//! Fluent construction of a [`crate::Server`].
//!
//! ```rust,no_run
//! use meshsync_server::Server;
//!
//! # async fn example() -> meshsync_core::Result<()> {
//! let addr: std::net::SocketAddr = "127.0.0.1:7700".parse().unwrap();
//! let server = Server::builder()
//!     .bind(addr)
//!     .server_name("node-a")
//!     .cache_size(10_000)
//!     .with_default_observability()
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::cluster::{ClusterStateMap, InMemoryClusterState};
use crate::metrics::ServerMetrics;
use crate::storage::{MemoryStorage, SledStorage, Storage};
use crate::Server;
use meshsync_core::{Error, Result};
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub struct ServerBuilder {
    addr: Option<SocketAddr>,
    server_name: String,
    cache_size: usize,
    storage_exclusion: Option<String>,
    rpc_ack_timeout: Duration,
    rpc_timeout: Duration,
    broadcast_timeout: Duration,
    listen_response_timeout: Duration,
    sled_path: Option<PathBuf>,
    cluster: Option<Arc<dyn ClusterStateMap>>,
    observability_config: Option<meshsync_core::ObservabilityConfig>,
    service_name: Option<String>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            addr: None,
            server_name: "node".to_string(),
            cache_size: 10_000,
            storage_exclusion: None,
            rpc_ack_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
            broadcast_timeout: Duration::ZERO,
            listen_response_timeout: Duration::from_secs(10),
            sled_path: None,
            cluster: None,
            observability_config: None,
            service_name: None,
        }
    }

    pub fn bind(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn bind_str(mut self, addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::InvalidMessageData(format!("invalid address: {e}")))?;
        self.addr = Some(addr);
        Ok(self)
    }

    /// Identity used when offering/holding a provider slot in the cluster
    /// map; must be unique per process in a multi-node deployment.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Maximum number of unpinned records kept in the cache.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Record names matching this regex never reach the storage plugin.
    pub fn storage_exclusion(mut self, pattern: impl Into<String>) -> Self {
        self.storage_exclusion = Some(pattern.into());
        self
    }

    pub fn rpc_ack_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_ack_timeout = timeout;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// How long to coalesce outbound frames per name before flushing.
    /// Zero (the default) flushes synchronously on every send.
    pub fn broadcast_timeout(mut self, timeout: Duration) -> Self {
        self.broadcast_timeout = timeout;
        self
    }

    pub fn listen_response_timeout(mut self, timeout: Duration) -> Self {
        self.listen_response_timeout = timeout;
        self
    }

    /// Use a `sled`-backed store at `path` instead of the default
    /// in-memory one.
    pub fn with_sled_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.sled_path = Some(path.into());
        self
    }

    /// Supply a cluster state backend other than the default in-process
    /// one, for a real multi-node deployment.
    pub fn cluster_state(mut self, cluster: Arc<dyn ClusterStateMap>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_observability(mut self, config: meshsync_core::ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(meshsync_core::ObservabilityConfig::default());
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub async fn build(self) -> Result<Server> {
        let addr = self
            .addr
            .ok_or_else(|| Error::InvalidMessageData("no bind address specified".to_string()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;

        let metrics = if let Some(mut config) = self.observability_config {
            if let Some(name) = &self.service_name {
                config.service_name = name.clone();
            }
            config.node_name = self.server_name.clone();
            meshsync_core::init_observability(config.clone())
                .map_err(|e| Error::Internal(format!("failed to initialize observability: {e}")))?;
            Some(Arc::new(ServerMetrics::new(config.service_name.clone())))
        } else {
            None
        };

        let storage_exclusion = self
            .storage_exclusion
            .map(|p| Regex::new(&p).map_err(|e| Error::InvalidMessageData(e.to_string())))
            .transpose()?;

        let storage: Arc<dyn Storage> = match self.sled_path {
            Some(path) => SledStorage::open(path).map_err(|e| Error::Storage(e.to_string()))?,
            None => MemoryStorage::new(),
        };

        let cluster = self.cluster.unwrap_or_else(|| Arc::new(InMemoryClusterState::new()));

        tracing::info!(addr = %addr, server_name = %self.server_name, "meshsync server listening");

        Ok(Server {
            listener,
            record_handler: Arc::new(crate::record::RecordHandler::new(
                self.cache_size,
                self.broadcast_timeout,
                storage,
                storage_exclusion,
                cluster,
                self.server_name,
                self.listen_response_timeout,
                metrics.clone(),
            )),
            rpc_handler: Arc::new(crate::rpc::RpcHandler::new(self.rpc_ack_timeout, self.rpc_timeout, metrics.clone())),
            metrics,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_with_defaults() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = ServerBuilder::new().bind(addr).build().await.unwrap();
        assert!(server.local_addr().is_ok());
    }

    #[test]
    fn missing_bind_address_errors() {
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(async { ServerBuilder::new().build().await });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_storage_exclusion_errors() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let result = ServerBuilder::new().bind(addr).storage_exclusion("(unterminated").build().await;
        assert!(result.is_err());
    }

    #[test]
    fn bind_str_valid() {
        assert!(ServerBuilder::new().bind_str("127.0.0.1:7700").is_ok());
    }

    #[test]
    fn bind_str_invalid() {
        assert!(ServerBuilder::new().bind_str("not-an-address").is_err());
    }
}
