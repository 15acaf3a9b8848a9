//! collab-relay: WebSocket relay for collaborative diagram rooms.
//!
//! Clients connect to `ws://<listen>/<room>`. The relay keeps one shared
//! document per room in memory and fans updates and presence out to the
//! room's other members.

use anyhow::Result;
use clap::Parser;
use collab_relay::RelayServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-relay")]
#[command(about = "Room relay for collaborative diagrams")]
struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, default_value = "localhost:1234")]
    listen: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_relay=debug,collab_core=debug"
    } else {
        "info,collab_relay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting collab-relay");
    let listener = RelayServer::bind(&args.listen).await?;
    let server = RelayServer::new();

    tokio::select! {
        result = server.run(listener) => {
            if let Err(e) = &result {
                error!("Relay stopped: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
