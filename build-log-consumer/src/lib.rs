pub mod config;
pub mod kafka;
pub mod metrics_consts;
pub mod metrics_server;
pub mod pipeline;
pub mod processor;
pub mod stores;
pub mod test_utils;
pub mod types;
pub mod worker_pool;
