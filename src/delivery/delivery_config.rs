use std::time::Duration;

#[derive(Debug)]
pub struct DeliveryConfig {
    /// number of neighbors a message must have been sent to successfully before its propagation
    ///  task is retired. 0 means 'best effort, single pass': messages are sent to the neighbors
    ///  known at the time, and never to neighbors that join later
    pub min_propagation_targets: usize,
    pub propagation_task_ttl: Duration,
    pub max_propagation_tasks: usize,

    /// upper bound for the number of unseen ranges tracked per message chain
    pub max_gap_count: usize,

    pub max_neighbors: usize,

    /// a proxy connection request without a response after this time is treated as rejected
    pub proxy_request_timeout: Duration,
    pub proxy_retry_interval: Duration,
    /// nodes accepting proxy connections from other nodes can not use proxies themselves
    pub accept_proxy_connections: bool,

    pub message_channel_capacity: usize,
}

impl DeliveryConfig {
    pub fn new() -> DeliveryConfig {
        DeliveryConfig {
            min_propagation_targets: 2,
            propagation_task_ttl: Duration::from_secs(10),
            max_propagation_tasks: 150,
            max_gap_count: 10_000,
            max_neighbors: 1000,
            proxy_request_timeout: Duration::from_secs(5),
            proxy_retry_interval: Duration::from_secs(10),
            accept_proxy_connections: false,
            message_channel_capacity: 256,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::new()
    }
}
