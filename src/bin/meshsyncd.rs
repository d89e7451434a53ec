//! Standalone server binary: reads configuration from the environment and
//! command-line flags, then runs until the process is killed.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "meshsyncd", about = "Realtime record sync and RPC server")]
struct Args {
    /// Address to bind the server to.
    #[arg(long, env = "MESHSYNC_BIND", default_value = "0.0.0.0:7700")]
    bind: SocketAddr,

    /// Identity used when this node holds a listener provider slot.
    #[arg(long, env = "MESHSYNC_SERVER_NAME")]
    server_name: Option<String>,

    /// Maximum number of unpinned records kept in the cache.
    #[arg(long, env = "MESHSYNC_CACHE_SIZE", default_value_t = 10_000)]
    cache_size: usize,

    /// Regex of record names excluded from the storage plugin.
    #[arg(long, env = "MESHSYNC_STORAGE_EXCLUSION")]
    storage_exclusion: Option<String>,

    /// Path to a sled database directory. Defaults to an in-memory store.
    #[arg(long, env = "MESHSYNC_SLED_PATH")]
    sled_path: Option<PathBuf>,

    #[arg(long, env = "MESHSYNC_RPC_ACK_TIMEOUT_MS", default_value_t = 5_000)]
    rpc_ack_timeout_ms: u64,

    #[arg(long, env = "MESHSYNC_RPC_TIMEOUT_MS", default_value_t = 30_000)]
    rpc_timeout_ms: u64,

    #[arg(long, env = "MESHSYNC_BROADCAST_TIMEOUT_MS", default_value_t = 0)]
    broadcast_timeout_ms: u64,

    #[arg(long, env = "MESHSYNC_LISTEN_RESPONSE_TIMEOUT_MS", default_value_t = 10_000)]
    listen_response_timeout_ms: u64,

    /// Disable OpenTelemetry tracing/metrics export.
    #[arg(long, env = "MESHSYNC_NO_OBSERVABILITY")]
    no_observability: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_name = args.server_name.unwrap_or_else(|| "node".to_string());

    let mut builder = meshsync::server::ServerBuilder::new()
        .bind(args.bind)
        .server_name(server_name)
        .cache_size(args.cache_size)
        .rpc_ack_timeout(Duration::from_millis(args.rpc_ack_timeout_ms))
        .rpc_timeout(Duration::from_millis(args.rpc_timeout_ms))
        .broadcast_timeout(Duration::from_millis(args.broadcast_timeout_ms))
        .listen_response_timeout(Duration::from_millis(args.listen_response_timeout_ms));

    if let Some(pattern) = args.storage_exclusion {
        builder = builder.storage_exclusion(pattern);
    }
    if let Some(path) = args.sled_path {
        builder = builder.with_sled_storage(path);
    }
    if !args.no_observability {
        builder = builder.with_default_observability();
    }

    let server = builder.build().await?;
    tracing::info!(addr = %server.local_addr()?, "meshsyncd starting");
    server.run().await?;
    Ok(())
}
