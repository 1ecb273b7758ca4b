use crate::auth::CredentialStore;
use crate::models::AppConfig;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: Arc<AccountPool>,
    pub credentials: Arc<CredentialStore>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(config: AppConfig, pool: AccountPool) -> Self {
        let config = Arc::new(config);
        let pool = Arc::new(pool);
        let credentials = Arc::new(CredentialStore::new(config.token_ttl_minutes));
        let upstream = Arc::new(UpstreamClient::new(
            pool.clone(),
            credentials.clone(),
            &config,
        ));
        Self {
            config,
            pool,
            credentials,
            upstream,
        }
    }
}
