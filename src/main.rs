mod config;
mod daemon;
mod ephemeral;
mod router;
mod ssh;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use config::config::Config;
use ephemeral::{ProvisionSettings, ServerRegistry};

#[derive(Parser)]
#[command(name = "payd")]
#[command(about = "Hands out throwaway SSH servers that collect a payment", long_about = None)]
struct Cli {
    /// Host put into connection strings
    external_addr: Option<String>,

    /// Address the HTTP listener and payment servers bind to
    bind_addr: Option<String>,

    port: Option<u16>,

    #[arg(long = "config")]
    config: Option<PathBuf>,

    #[arg(long = "dev")]
    dev: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.dev {
        // Dev mode also shows debug logs from the ssh sessions
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_overrides(cli.external_addr, cli.bind_addr, cli.port);
    let bind_ip = config.validate()?;

    daemon::start::print_banner(&config);

    let registry = Arc::new(ServerRegistry::new(ProvisionSettings::from_config(&config, bind_ip)));

    // Spawn server event listener
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => event.log(),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Forget finished servers once they're past the retention window
    let registry_cleanup = registry.clone();
    let retain = config.payments.retain_finished();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let pruned = registry_cleanup.prune_finished(retain);
            if pruned > 0 {
                tracing::debug!("Pruned {} finished payment servers", pruned);
            }
        }
    });

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;

    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, router::app(registry.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, cancelling {} payment servers", registry.list().len());
    registry.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
