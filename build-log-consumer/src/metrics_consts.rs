// ==== Consumer-group driver ====
/// Counter for messages received from the broker
pub const MESSAGES_RECEIVED: &str = "build_log_messages_received_total";

/// Counter for messages processed successfully
pub const MESSAGES_ACKNOWLEDGED: &str = "build_log_messages_acknowledged_total";

/// Counter for partition watermark advances handed to the offset store
pub const OFFSETS_STORED: &str = "build_log_offsets_stored_total";

/// Counter for messages left unacknowledged, labelled by failure reason
pub const MESSAGES_FAILED: &str = "build_log_messages_failed_total";

/// Counter for receive errors, labelled by error kind
pub const CONSUMER_KAFKA_ERROR: &str = "build_log_consumer_kafka_error_total";

/// Counter for group rejoins after a failed consumer session
pub const CONSUMER_REJOINS: &str = "build_log_consumer_rejoins_total";

/// Counter for rebalance callbacks, labelled by event type
pub const REBALANCE_EVENTS: &str = "build_log_rebalance_events_total";

/// Counter for failed offset commits reported by librdkafka
pub const OFFSET_COMMIT_FAILURES: &str = "build_log_offset_commit_failures_total";

// ==== Worker pool ====
pub const WORKER_POOL_SATURATION: &str = "build_log_worker_pool_saturation_percent";

pub const WORKER_POOL_IN_FLIGHT: &str = "build_log_worker_pool_in_flight";

// ==== Event processor ====
/// Counter for messages skipped because key or payload was empty
pub const EVENTS_SKIPPED: &str = "build_log_events_skipped_total";

/// Counter for status transitions written, labelled by status
pub const STATUS_TRANSITIONS: &str = "build_log_status_transitions_total";

/// Counter for events written to the log sink
pub const EVENTS_PERSISTED: &str = "build_log_events_persisted_total";

/// Histogram for end-to-end processing time of one message
pub const PROCESSING_DURATION: &str = "build_log_processing_duration_seconds";

// ==== HTTP surface ====
pub const HTTP_REQUESTS: &str = "build_log_http_requests_total";

pub const HTTP_REQUEST_DURATION: &str = "build_log_http_request_duration_seconds";
