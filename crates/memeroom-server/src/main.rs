use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use memeroom_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    let (config, source) = ServerConfig::load();
    init_tracing(&config.log_format);
    source.log();

    if let Err(problems) = config.validate() {
        for problem in &problems {
            tracing::error!("Invalid config: {problem}");
        }
        std::process::exit(2);
    }

    let listen_addr = config.listen_addr.clone();
    let (app, state) = memeroom_server::build_app(config);

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %listen_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %listen_addr, "memeroom server listening");

    let shutdown = CancellationToken::new();
    let reaper = memeroom_server::spawn_background_tasks(&state, shutdown.clone());

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "Server error");
    }

    shutdown.cancel();
    state.registry.shutdown_all("server shutting down").await;
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Reaper task failed");
    }
    tracing::info!("memeroom server stopped");
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
