pub mod deployment;
pub mod log_sink;

pub use deployment::{DeploymentStore, DeploymentStoreError, StatusWritePolicy};
pub use log_sink::{LogQuery, LogSink, LogSinkError, TimeRange};
