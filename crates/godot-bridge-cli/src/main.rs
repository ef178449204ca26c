//! Godot bridge MCP server
//!
//! Speaks MCP on stdio and bridges to a running Godot editor:
//! - the debug adapter over TCP (127.0.0.1:6006 by default)
//! - the editor plugin over a WebSocket it dials in to (127.0.0.1:6505)
//!
//! Logs go to stderr; stdout carries only the JSON-RPC stream.

use anyhow::Result;
use clap::Parser;
use godot_bridge_core::BridgeConfig;
use godot_bridge_server::GodotBridgeServer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "godot-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debug adapter port (overrides GODOT_DAP_PORT)
    #[arg(long)]
    dap_port: Option<u16>,

    /// Editor plugin WebSocket port (overrides GODOT_EDITOR_PORT)
    #[arg(long)]
    editor_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = BridgeConfig::from_env()?;
    if let Some(port) = args.dap_port {
        config.dap.port = port;
    }
    if let Some(port) = args.editor_port {
        config.editor.port = port;
    }

    info!(
        "Godot bridge starting (debug adapter {}, editor plugin ws://{})",
        config.dap.address(),
        config.editor.address()
    );

    GodotBridgeServer::new(config).run_stdio().await?;
    Ok(())
}
