use std::sync::Arc;
use std::time::Instant;

use rdkafka::message::{Message, OwnedMessage};
use tracing::{debug, error};

use crate::metrics_consts::{
    EVENTS_PERSISTED, EVENTS_SKIPPED, PROCESSING_DURATION, STATUS_TRANSITIONS,
};
use crate::stores::deployment::{DeploymentStore, DeploymentStoreError};
use crate::stores::log_sink::{LogSink, LogSinkError};
use crate::types::{BuildLogEvent, DeploymentStatus};

const LOG_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Empty key or payload. Nothing was written, the message can be acknowledged.
    Skipped,
    /// The event was stored, after applying these transitions in order.
    Persisted { transitions: Vec<DeploymentStatus> },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to decode build log event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("build log event has no deployment_id")]
    MissingDeploymentId,
    #[error("failed to set deployment {deployment_id} to {status}: {source}")]
    Transition {
        deployment_id: String,
        status: DeploymentStatus,
        #[source]
        source: DeploymentStoreError,
    },
    #[error("failed to persist log event for deployment {deployment_id}: {source}")]
    Persist {
        deployment_id: String,
        #[source]
        source: LogSinkError,
    },
}

impl ProcessError {
    /// Whether redelivering the same message could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Decode(_) | ProcessError::MissingDeploymentId => false,
            ProcessError::Transition { source, .. } => source.is_transient(),
            ProcessError::Persist { source, .. } => source.is_transient(),
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessError::Decode(_) => "decode",
            ProcessError::MissingDeploymentId => "missing_deployment_id",
            ProcessError::Transition { .. } => "transition",
            ProcessError::Persist { .. } => "persist",
        }
    }
}

enum Matcher {
    Exact(&'static str),
    PrefixContains(&'static str, &'static str),
}

impl Matcher {
    fn matches(&self, lowered: &str) -> bool {
        match self {
            Matcher::Exact(line) => lowered == *line,
            Matcher::PrefixContains(prefix, needle) => {
                lowered.starts_with(prefix) && lowered.contains(needle)
            }
        }
    }
}

// Evaluated independently and in order, against the lower-cased log line
const TRANSITION_RULES: &[(Matcher, DeploymentStatus)] = &[
    (
        Matcher::Exact("info: starting build pipeline..."),
        DeploymentStatus::InProgress,
    ),
    (
        Matcher::Exact("info: pipeline completed successfully."),
        DeploymentStatus::Ready,
    ),
    (
        Matcher::PrefixContains("error:", "pipeline failed"),
        DeploymentStatus::Fail,
    ),
];

/// Statuses implied by a log line. Matching ignores case.
pub fn transitions_for(log: &str) -> Vec<DeploymentStatus> {
    let lowered = log.to_lowercase();
    TRANSITION_RULES
        .iter()
        .filter(|(matcher, _)| matcher.matches(&lowered))
        .map(|(_, status)| *status)
        .collect()
}

fn preview(log: &str) -> String {
    let mut chars = log.chars();
    let head: String = chars.by_ref().take(LOG_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Turns one build log message into deployment status writes plus a stored
/// log line. The returned result alone decides acknowledgement.
#[derive(Clone)]
pub struct EventProcessor {
    deployments: Arc<dyn DeploymentStore>,
    logs: Arc<dyn LogSink>,
}

impl EventProcessor {
    pub fn new(deployments: Arc<dyn DeploymentStore>, logs: Arc<dyn LogSink>) -> Self {
        Self { deployments, logs }
    }

    pub async fn process(&self, message: &OwnedMessage) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();
        let result = self.process_parts(message.key(), message.payload()).await;
        metrics::histogram!(PROCESSING_DURATION).record(started.elapsed().as_secs_f64());
        result
    }

    /// Same as `process`, for callers that hold the raw key and payload.
    pub async fn process_parts(
        &self,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let (Some(key), Some(payload)) = (key, payload) else {
            metrics::counter!(EVENTS_SKIPPED).increment(1);
            return Ok(ProcessOutcome::Skipped);
        };
        if key.is_empty() || payload.is_empty() {
            metrics::counter!(EVENTS_SKIPPED).increment(1);
            return Ok(ProcessOutcome::Skipped);
        }

        let mut event: BuildLogEvent = serde_json::from_slice(payload)?;
        if event.deployment_id.is_empty() {
            return Err(ProcessError::MissingDeploymentId);
        }
        event.ensure_event_id();

        self.handle_event(event).await
    }

    async fn handle_event(&self, event: BuildLogEvent) -> Result<ProcessOutcome, ProcessError> {
        let transitions = transitions_for(&event.log);

        for status in &transitions {
            debug!(
                deployment_id = %event.deployment_id,
                status = %status,
                "applying status transition"
            );
            self.deployments
                .update_status(&event.deployment_id, *status)
                .await
                .map_err(|source| ProcessError::Transition {
                    deployment_id: event.deployment_id.clone(),
                    status: *status,
                    source,
                })?;
            metrics::counter!(STATUS_TRANSITIONS, "status" => status.as_str()).increment(1);
        }

        if let Err(source) = self.logs.insert(&event).await {
            error!(
                deployment_id = %event.deployment_id,
                event_id = %event.event_id,
                log = %preview(&event.log),
                "failed to persist build log event: {}",
                source
            );
            return Err(ProcessError::Persist {
                deployment_id: event.deployment_id,
                source,
            });
        }
        metrics::counter!(EVENTS_PERSISTED).increment(1);

        Ok(ProcessOutcome::Persisted { transitions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::deployment::{MemoryDeploymentStore, StatusWritePolicy};
    use crate::stores::log_sink::MemoryLogSink;
    use crate::test_utils::{
        build_message, log_message, FailingDeploymentStore, FailingLogSink,
    };
    use test_case::test_case;

    fn processor() -> (
        EventProcessor,
        Arc<MemoryDeploymentStore>,
        Arc<MemoryLogSink>,
    ) {
        let deployments = Arc::new(MemoryDeploymentStore::new(StatusWritePolicy::Overwrite));
        deployments.insert("D1", DeploymentStatus::Queued);
        let logs = Arc::new(MemoryLogSink::new());
        (
            EventProcessor::new(deployments.clone(), logs.clone()),
            deployments,
            logs,
        )
    }

    #[test_case("INFO: Starting build pipeline...", &[DeploymentStatus::InProgress] ; "start uppercase")]
    #[test_case("info: starting build pipeline...", &[DeploymentStatus::InProgress] ; "start lowercase")]
    #[test_case("Info: Pipeline completed successfully.", &[DeploymentStatus::Ready] ; "success")]
    #[test_case("ERROR: step 3: Pipeline Failed", &[DeploymentStatus::Fail] ; "failure")]
    #[test_case("error: pipeline failed", &[DeploymentStatus::Fail] ; "bare failure")]
    #[test_case("ERROR: disk full", &[] ; "error without pipeline failed")]
    #[test_case("warning: pipeline failed", &[] ; "failure text without error prefix")]
    #[test_case("info: starting build pipeline... now", &[] ; "start must be exact")]
    #[test_case(" info: pipeline completed successfully.", &[] ; "leading whitespace is not trimmed")]
    #[test_case("Cloning repository", &[] ; "plain progress line")]
    fn test_transition_rules(log: &str, expected: &[DeploymentStatus]) {
        assert_eq!(transitions_for(log), expected.to_vec());
    }

    #[test]
    fn test_preview_truncates_long_lines() {
        let long = "x".repeat(150);
        let shown = preview(&long);
        assert_eq!(shown.len(), 103);
        assert!(shown.ends_with("..."));

        assert_eq!(preview("short"), "short");
        assert_eq!(preview(&"y".repeat(100)), "y".repeat(100));
    }

    #[tokio::test]
    async fn test_missing_key_or_payload_is_skipped() {
        let (processor, deployments, logs) = processor();
        let payload = r#"{"deployment_id":"D1","log":"INFO: Starting build pipeline..."}"#;

        for message in [
            build_message(None, Some(payload)),
            build_message(Some(""), Some(payload)),
            build_message(Some("D1"), None),
            build_message(Some("D1"), Some("")),
        ] {
            let outcome = processor.process(&message).await.unwrap();
            assert_eq!(outcome, ProcessOutcome::Skipped);
        }

        assert!(deployments.applied_writes().is_empty());
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_original_casing_is_persisted() {
        let (processor, deployments, logs) = processor();

        let outcome = processor
            .process(&log_message("D1", "INFO: Starting build pipeline..."))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Persisted {
                transitions: vec![DeploymentStatus::InProgress]
            }
        );
        assert_eq!(deployments.status("D1"), Some(DeploymentStatus::InProgress));

        let stored = logs.all_for_deployment("D1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].log, "INFO: Starting build pipeline...");
        assert!(!stored[0].event_id.is_empty());
    }

    #[tokio::test]
    async fn test_plain_line_is_persisted_without_transition() {
        let (processor, deployments, logs) = processor();

        let outcome = processor
            .process(&log_message("D1", "ERROR: disk full"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Persisted {
                transitions: vec![]
            }
        );
        assert_eq!(deployments.status("D1"), Some(DeploymentStatus::Queued));
        assert_eq!(logs.count("D1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_for_status() {
        let (processor, deployments, logs) = processor();
        let message = log_message("D1", "info: pipeline completed successfully.");

        processor.process(&message).await.unwrap();
        processor.process(&message).await.unwrap();

        assert_eq!(deployments.status("D1"), Some(DeploymentStatus::Ready));
        assert_eq!(deployments.write_count("D1"), 2);
        assert_eq!(logs.count("D1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_acknowledged() {
        let (processor, _, logs) = processor();

        let err = processor
            .process(&build_message(Some("D1"), Some("{not json")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Decode(_)));
        assert!(!err.is_retryable());

        let err = processor
            .process(&build_message(
                Some("D1"),
                Some(r#"{"deployment_id":"","log":"hello"}"#),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::MissingDeploymentId));
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_null_event_id_and_log_are_persisted() {
        let (processor, deployments, logs) = processor();

        let outcome = processor
            .process(&build_message(
                Some("D1"),
                Some(r#"{"event_id":null,"deployment_id":"D1","log":null}"#),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, ProcessOutcome::Persisted { .. }));
        assert_eq!(deployments.status("D1"), Some(DeploymentStatus::Queued));
        let stored = logs.all_for_deployment("D1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].log, "");
        assert!(!stored[0].event_id.is_empty());
    }

    #[tokio::test]
    async fn test_status_failure_stops_before_persisting() {
        let deployments = Arc::new(FailingDeploymentStore::always());
        let logs = Arc::new(MemoryLogSink::new());
        let processor = EventProcessor::new(deployments, logs.clone());

        let err = processor
            .process(&log_message("D1", "ERROR: pipeline failed"))
            .await
            .unwrap_err();

        match &err {
            ProcessError::Transition {
                deployment_id,
                status,
                ..
            } => {
                assert_eq!(deployment_id, "D1");
                assert_eq!(*status, DeploymentStatus::Fail);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported() {
        let deployments = Arc::new(MemoryDeploymentStore::default());
        deployments.insert("D1", DeploymentStatus::Queued);
        let logs = Arc::new(FailingLogSink::always());
        let processor = EventProcessor::new(deployments.clone(), logs);

        let err = processor
            .process(&log_message("D1", "INFO: Starting build pipeline..."))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Persist { .. }));
        assert_eq!(err.reason(), "persist");
        // The transition already landed; a redelivery re-applies it
        assert_eq!(deployments.status("D1"), Some(DeploymentStatus::InProgress));
    }
}
