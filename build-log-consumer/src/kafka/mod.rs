pub mod config;
pub mod consumer;
pub mod context;
pub mod offset_tracker;

pub use config::GroupConsumerConfig;
pub use consumer::{GroupConsumer, GroupSubscription, KafkaSubscription};
pub use context::PipelineConsumerContext;
pub use offset_tracker::OffsetTracker;
