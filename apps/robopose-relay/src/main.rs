use clap::Parser;
use robopose_relay::{
    build_router,
    cli::{self, Cli},
    config::Config,
    lifecycle::SessionManager,
    router::RelayRouter,
    serve,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    if let Some(command) = cli.command {
        if let Err(e) = cli::run_command(command).await {
            error!("Debug client error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!("Starting relay on {}{}", config.bind_addr(), config.ws_path);
    if !config.include_sender.is_empty() {
        info!("Echoing to sender: {:?}", config.include_sender);
    }

    let sessions = SessionManager::new(RelayRouter::new(config.relay_policy()));
    let app = build_router(&config, sessions);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Relay listening on {}", listener.local_addr()?);

    serve(listener, app, shutdown_signal()).await?;
    info!("Relay stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
