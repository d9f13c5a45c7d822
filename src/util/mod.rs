pub mod fifo_ttl_cache;
pub mod random;
