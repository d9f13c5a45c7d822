pub mod proxy_client;
pub mod retry;
