pub mod content_delivery_node;
pub mod content_delivery_rpc_local;
pub mod delivery_config;
pub mod delivery_error;
pub mod delivery_manager;
pub mod duplicate_detector;
pub mod neighbor_list;
pub mod propagation;
