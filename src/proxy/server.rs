use crate::models::AppConfig;
use crate::proxy::handlers::{admin, messages};
use crate::proxy::pool::AccountPool;
use crate::proxy::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::handle_messages))
        .route("/v1/models", get(admin::handle_list_models))
        .route("/health", get(admin::handle_health))
        .route("/account-limits", get(admin::handle_account_limits))
        .route("/refresh-token", post(admin::handle_refresh_token))
        .route("/accounts/reload", post(admin::handle_accounts_reload))
        .with_state(state)
}

pub async fn run_server(config: AppConfig) -> Result<(), String> {
    let pool_path = AppConfig::config_dir()?.join("accounts.json");
    let pool = AccountPool::load(pool_path, config.pool.clone())?;
    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, pool);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", bind_addr, e))?;
    info!("listening on http://{}", bind_addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| format!("server error: {}", e))
}
