//! Entry point for the zsh-tool MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), builds the server from the environment config, and serves
//! on stdin/stdout.

use anyhow::Result;
use rmcp::{ServiceExt, transport::stdio};
use tracing_subscriber::{self, EnvFilter};
use zsh_tool::config::Config;
use zsh_tool::server::ZshToolServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting zsh-tool MCP server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let server = ZshToolServer::new(config)?;
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    tracing::info!("zsh-tool server shut down");
    Ok(())
}
