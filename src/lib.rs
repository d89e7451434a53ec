//! meshsync - realtime record sync and RPC routing core
//!
//! This is the convenience crate that re-exports the core and server
//! sub-crates under a single dependency.
//!
//! - **meshsync-core**: wire frame types, codec, error vocabulary, observability init
//! - **meshsync-server**: subscription registry, record cache, RPC routing, listener registry
//!
//! # Quick start
//!
//! ```rust,no_run
//! use meshsync::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr: std::net::SocketAddr = "127.0.0.1:6020".parse()?;
//!     let server = Server::builder()
//!         .bind(addr)
//!         .server_name("node-a")
//!         .build()
//!         .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub use meshsync_core as core;
pub use meshsync_server as server;

pub use meshsync_server::Server;
