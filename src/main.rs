mod auth;
mod conversation;
mod db;
mod error;
mod message;
mod middleware;
mod routes;
mod state;
mod user;
mod websocket;

#[cfg(test)]
mod memory_store;

use anyhow::Context;
use conversation::{ConversationRepository, ConversationResolver, ConversationStore};
use db::{create_pool, run_migrations};
use message::{MessageQueue, MessageService};
use routes::create_router;
use state::{AppState, Config};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use user::{UserDirectory, UserRepository};
use websocket::{ConnectionManager, Gateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devnet_messaging=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);

    // Sanitize URL for logging (hide password)
    let url_for_logging = config
        .database_url
        .split('@')
        .last()
        .map(|part| format!("<hidden>@{}", part))
        .unwrap_or_else(|| "<invalid format>".to_string());

    tracing::info!("Connecting to database at {}...", url_for_logging);
    let db = create_pool(&config.database_url, config.database_max_connections)
        .await
        .with_context(|| format!("failed to connect to database at {}", url_for_logging))?;

    tracing::info!("Running migrations...");
    run_migrations(&db).await.context("failed to run migrations")?;

    // Repositories
    let store: Arc<dyn ConversationStore> = Arc::new(ConversationRepository::new(db.clone()));
    let user_directory: Arc<dyn UserDirectory> = Arc::new(UserRepository::new(db.clone()));

    // Realtime plumbing
    let ws_connections = ConnectionManager::new();
    let resolver = ConversationResolver::new(store.clone());
    let message_queue = MessageQueue::new(store.clone(), config.flush.clone());
    let flush_worker = message_queue.start_flush_worker();

    // Services
    let message_service = MessageService::new(
        store.clone(),
        user_directory.clone(),
        resolver.clone(),
        ws_connections.clone(),
    );
    let gateway = Gateway::new(
        ws_connections.clone(),
        resolver,
        store,
        user_directory.clone(),
        message_queue.clone(),
    );

    let state = AppState {
        config: config.clone(),
        ws_connections,
        user_directory,
        message_service,
        gateway,
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(
        pending = message_queue.pending_len(),
        "Server stopped, flushing queued messages"
    );
    flush_worker.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
