use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// Shared client for short control-plane calls (token refresh, userinfo,
// loadCodeAssist). Generation traffic gets its own client with a long read
// timeout, built by the upstream module.
static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
        .expect("failed to build shared HTTP client")
});

pub fn get_client() -> Client {
    CLIENT.clone()
}

pub fn build_upstream_client(timeout_secs: u64) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .timeout(Duration::from_secs(timeout_secs))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
}
