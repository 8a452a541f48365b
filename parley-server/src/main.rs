//! parley-server: runs the signaling and presence relay over WebSocket.
//!
//! Configuration comes from flags or the matching environment variables;
//! logging is filtered with `RUST_LOG`.

use clap::{Parser, ValueEnum};
use log::{error, info};

use parley_relay::notifications::{BufferConfig, OverflowPolicy};
use parley_relay::router::RouterConfig;
use parley_relay::server::{RelayServer, ServerConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Overflow {
    /// Evict the oldest pending notification
    DropOldest,
    /// Reject the incoming notification
    DropNewest,
}

impl From<Overflow> for OverflowPolicy {
    fn from(overflow: Overflow) -> Self {
        match overflow {
            Overflow::DropOldest => OverflowPolicy::DropOldest,
            Overflow::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

// CLI
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(version = VERSION)]
#[command(about = "Realtime signaling and presence relay for web chat")]
struct Cli {
    /// Interface to listen on
    #[arg(long, env = "PARLEY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Events queued per connection before new ones are dropped
    #[arg(long, env = "PARLEY_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Seconds between pings; 0 or unset disables heartbeats
    #[arg(long, env = "PARLEY_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Pending notifications kept per offline user (unbounded if unset)
    #[arg(long, env = "PARLEY_MAX_PENDING")]
    max_pending: Option<usize>,

    /// What to do when a user's pending queue is full
    #[arg(long, env = "PARLEY_OVERFLOW", value_enum, default_value_t = Overflow::DropOldest)]
    overflow: Overflow,

    /// Characters of a message kept in its notification summary
    #[arg(long, env = "PARLEY_PREVIEW_CHARS", default_value_t = 140)]
    preview_chars: usize,

    /// Store this text as every notification summary instead of a preview
    #[arg(long, env = "PARLEY_FIXED_SUMMARY")]
    fixed_summary: Option<String>,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            buffer: BufferConfig {
                max_per_user: self.max_pending,
                overflow: self.overflow.into(),
            },
            router: RouterConfig {
                preview_chars: self.preview_chars,
                fixed_summary: self.fixed_summary,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = RelayServer::new(Cli::parse().into_config());
    info!("parley-server {VERSION} starting on {}", server.bind_addr());
    let buffer = server.config().buffer;
    match buffer.max_per_user {
        Some(cap) => info!("Pending notifications capped at {cap} ({:?})", buffer.overflow),
        None => info!("Pending notifications unbounded"),
    }

    if let Err(e) = server.run().await {
        error!("Relay server stopped: {e}");
        std::process::exit(1);
    }
}
