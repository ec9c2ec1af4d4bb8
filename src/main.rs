//! # obs-mcp
//!
//! MCP (Model Context Protocol) server that drives OBS Studio through the
//! obs-websocket v5 protocol. Runs as a stdio JSON-RPC server launched by an
//! agent host; logs go to stderr.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, config loading, tracing setup, MCP server launch
//! config.rs        CLI / JSON file / env-var configuration
//! client.rs        obs-websocket session (handshake, requests, events)
//! mcp.rs           MCP JSON-RPC protocol handler (stdio)
//! tools.rs         tool definitions and handlers
//! ```

use clap::Parser;
use tracing::{info, warn};

use obs_mcp::config::{self, Cli};
use obs_mcp::mcp;
use obs_mcp::tools::ToolContext;
use obs_mcp::ObsClient;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let resolved = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("obs-mcp: configuration error: {e}");
            std::process::exit(1);
        }
    };

    // stdout carries MCP traffic, so logs go to stderr
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| resolved.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("obs-mcp v{} starting", env!("CARGO_PKG_VERSION"));
    info!(url = %resolved.url, auth = resolved.password.is_some(), "OBS WebSocket target");

    let client = ObsClient::new(resolved.to_client_options());
    let ctx = ToolContext::new(client.clone());

    // Tools connect lazily, so OBS may start later.
    if let Err(e) = client.connect().await {
        warn!("Initial connection to OBS failed: {e}");
    }

    mcp::run_stdio(ctx).await;
    client.disconnect().await;
}
