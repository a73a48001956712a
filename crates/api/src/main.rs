use std::sync::Arc;

use anyhow::Context;

use docpipe_api::app::{self, services};
use docpipe_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docpipe_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let bind = config.bind.clone();

    let services = Arc::new(services::build_services(config).await?);
    let background = services::Background::start(&services);
    let router = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    background.shutdown().await;
    Ok(())
}
