pub mod handlers;
pub mod mappers;
pub mod pool;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod signature_cache;
pub mod state;
pub mod upstream;
