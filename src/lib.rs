pub mod auth;
pub mod constants;
pub mod error;
pub mod models;
pub mod proxy;
pub mod utils;

use tracing::error;

fn init_logger() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run() {
    init_logger();

    let mut config = match models::AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_env_overrides();
    if let Err(errors) = config.validate() {
        error!("configuration validation failed:\n{}", errors.join("\n"));
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to create Tokio runtime");
    runtime.block_on(async {
        if let Err(e) = proxy::server::run_server(config).await {
            error!("{}", e);
            std::process::exit(1);
        }
    });
}
