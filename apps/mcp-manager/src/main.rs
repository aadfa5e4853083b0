use mcp_manager::config::AppConfig;
use mcp_manager::manager::Manager;
use mcp_manager::metrics::BOOT_COUNTER;
use mcp_manager::routes::build_router;
use mcp_manager::state::AppState;
use mcp_manager::telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env()?;
    init_tracing(&cfg.log_filter);
    BOOT_COUNTER.inc();

    let manager = Manager::from_config(&cfg).await?;
    manager.start().await?;
    let app = build_router(AppState::new(manager.clone()));

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    info!(
        manager_id = %manager.id(),
        addr = %cfg.bind_addr,
        advertised = %cfg.manager_address,
        "starting mcp manager"
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    manager.stop().await;
    Ok(())
}
