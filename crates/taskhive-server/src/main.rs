use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taskhive_server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "taskhive coordinator daemon")]
struct Args {
    /// Config file (TOML). Defaults to <state-dir>/coordinator.toml if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on; 0 picks a free one.
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding tasks.json and the marker files.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Stop once the last worker session has ended.
    #[arg(long)]
    exit_on_complete: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskhive_server=info,libtaskhive=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref(), args.state_dir.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.exit_on_complete |= args.exit_on_complete;

    let server = Server::bind(config).await?;
    tokio::spawn(wait_for_signal(server.shutdown_token()));
    server.run().await
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    info!("shutdown signal received");
    shutdown.cancel();
}
