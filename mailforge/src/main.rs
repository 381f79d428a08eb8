use std::path::PathBuf;

use clap::Parser;
use mailforge::{Config, Server};
use mailforge_common::Signal;

#[derive(Parser)]
#[command(name = "mailforge", about = "A high-throughput, extensible SMTP server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "mailforge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    mailforge_common::logging::init();

    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| anyhow::anyhow!("unable to read {}: {e}", args.config.display()))?;
    let config = Config::from_toml(&raw)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let server = Server::from_config(config)?;
    let bound = server.bind().await?;

    for addr in bound.local_addrs() {
        tracing::info!("listening on {addr}");
    }

    let (shutdown, _) = tokio::sync::broadcast::channel(8);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut terminate = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                )
                .expect("failed to install SIGTERM handler");

                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }

            tracing::info!("shutdown requested, draining sessions");
            let _ = shutdown.send(Signal::Shutdown);
        }
    });

    bound.serve(shutdown).await
}
