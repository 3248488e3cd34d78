use crate::config::ServerConfig;
use crate::http::{create_router, AppState};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use weave_core::Weave;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!("Starting Weave v{}", env!("CARGO_PKG_VERSION"));
    info!("HTTP: {}", config.http_addr);
    info!("Data: {:?}", config.data_dir);

    let core_config = config.core_config();
    info!(
        "Provider: {} (chat {}, embeddings {}, dim {})",
        core_config.llm_provider_base_url,
        core_config.llm_model,
        core_config.embedding_model,
        core_config.vector_dim
    );

    let weave = Arc::new(Weave::open(core_config).await?);
    let stats = weave.stats().await?;
    info!(
        "Store loaded: {} episodes, {} entities, {} edges",
        stats.episode_count, stats.entity_count, stats.edge_count
    );

    let state = AppState {
        weave: weave.clone(),
        start_time: std::time::Instant::now(),
    };
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!("Weave ready on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received, draining queue...");
    weave.close();
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
}
