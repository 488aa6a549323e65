use anyhow::Result;
use std::sync::Arc;

use prism_gateway::config::Config;
use prism_gateway::mapper::ModelMapper;
use prism_gateway::middleware;
use prism_gateway::orchestrator::Orchestrator;
use prism_gateway::routes::{self, AppState};
use prism_gateway::runtime_config::RuntimeConfigManager;
use prism_gateway::store::memory::MemoryStore;
use prism_gateway::store::sqlite::SqliteStore;
use prism_gateway::store::GatewayStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Prism Gateway starting...");

    let store: Arc<dyn GatewayStore> = match &config.db_file {
        Some(path) => {
            tracing::info!("Opening SQLite store at {}", path.display());
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            tracing::warn!("No GATEWAY_DB_FILE configured, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let runtime = RuntimeConfigManager::load(Arc::clone(&store)).await?;
    let _reload_task = runtime.spawn_reload_task(config.settings_reload_interval);
    tracing::info!(
        "Runtime settings loaded, reloading every {}s",
        config.settings_reload_interval
    );

    let mapper = ModelMapper::new(Arc::clone(&store));
    mapper.refresh().await;
    tracing::info!("Model mapper initialized");

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&runtime),
        mapper,
    )?);

    let state = AppState {
        orchestrator,
        store,
    };

    let app = routes::health_routes()
        .merge(routes::api_routes(state))
        .layer(middleware::cors_layer());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
