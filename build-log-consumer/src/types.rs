use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One build-progress line, as produced by a build worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogEvent {
    #[serde(default, deserialize_with = "null_is_empty")]
    pub event_id: String,
    pub deployment_id: String,
    #[serde(default, deserialize_with = "null_is_empty")]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// Producers send explicit nulls for fields they do not fill in
fn null_is_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl BuildLogEvent {
    pub fn new(deployment_id: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            event_id: String::new(),
            deployment_id: deployment_id.into(),
            log: log.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Producers may omit the event id, in which case we mint one at ingestion.
    pub fn ensure_event_id(&mut self) {
        if self.event_id.is_empty() {
            self.event_id = Uuid::now_v7().to_string();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    NotStarted,
    Queued,
    InProgress,
    Ready,
    Fail,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown deployment status: {0}")]
pub struct UnknownStatus(pub String);

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::NotStarted => "NOT_STARTED",
            DeploymentStatus::Queued => "QUEUED",
            DeploymentStatus::InProgress => "IN_PROGRESS",
            DeploymentStatus::Ready => "READY",
            DeploymentStatus::Fail => "FAIL",
        }
    }

    /// Position in the deployment lifecycle. READY and FAIL share the last slot.
    pub fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::NotStarted => 0,
            DeploymentStatus::Queued => 1,
            DeploymentStatus::InProgress => 2,
            DeploymentStatus::Ready | DeploymentStatus::Fail => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Whether a monotonic writer may replace `self` with `next`.
    pub fn can_advance_to(&self, next: DeploymentStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }

    /// Every status that `next` is allowed to overwrite under monotonic writes.
    pub fn predecessors_of(next: DeploymentStatus) -> Vec<DeploymentStatus> {
        [
            DeploymentStatus::NotStarted,
            DeploymentStatus::Queued,
            DeploymentStatus::InProgress,
            DeploymentStatus::Ready,
            DeploymentStatus::Fail,
        ]
        .into_iter()
        .filter(|current| current.can_advance_to(next))
        .collect()
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(DeploymentStatus::NotStarted),
            "QUEUED" => Ok(DeploymentStatus::Queued),
            "IN_PROGRESS" => Ok(DeploymentStatus::InProgress),
            "READY" => Ok(DeploymentStatus::Ready),
            "FAIL" => Ok(DeploymentStatus::Fail),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_decode_full_event() {
        let event: BuildLogEvent = serde_json::from_value(json!({
            "event_id": "evt-1",
            "deployment_id": "D1",
            "log": "Info: Starting build pipeline...",
            "timestamp": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.deployment_id, "D1");
        assert_eq!(event.log, "Info: Starting build pipeline...");
        assert_eq!(
            event.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_minimal_event() {
        let event: BuildLogEvent =
            serde_json::from_value(json!({"deployment_id": "D1", "log": "hello"})).unwrap();

        assert!(event.event_id.is_empty());
        assert!(event.timestamp.is_none());
    }

    #[test]
    fn test_decode_null_fields_as_empty() {
        let event: BuildLogEvent = serde_json::from_value(json!({
            "event_id": null,
            "deployment_id": "D1",
            "log": null,
            "timestamp": null
        }))
        .unwrap();

        assert_eq!(event, BuildLogEvent::new("D1", ""));
    }

    #[test]
    fn test_decode_rejects_null_deployment_id() {
        let result =
            serde_json::from_value::<BuildLogEvent>(json!({"deployment_id": null, "log": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_requires_deployment_id() {
        let result = serde_json::from_value::<BuildLogEvent>(json!({"log": "hello"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_event_id_keeps_producer_value() {
        let mut supplied = BuildLogEvent::new("D1", "x").with_event_id("evt-1");
        supplied.ensure_event_id();
        assert_eq!(supplied.event_id, "evt-1");

        let mut generated = BuildLogEvent::new("D1", "x");
        generated.ensure_event_id();
        assert!(Uuid::parse_str(&generated.event_id).is_ok());
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            DeploymentStatus::NotStarted,
            DeploymentStatus::Queued,
            DeploymentStatus::InProgress,
            DeploymentStatus::Ready,
            DeploymentStatus::Fail,
        ] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                json!(status.as_str())
            );
        }
        assert!("ready".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_monotonic_ordering() {
        assert!(DeploymentStatus::Queued.can_advance_to(DeploymentStatus::InProgress));
        assert!(DeploymentStatus::InProgress.can_advance_to(DeploymentStatus::Ready));
        assert!(DeploymentStatus::Ready.can_advance_to(DeploymentStatus::Ready));
        assert!(!DeploymentStatus::Ready.can_advance_to(DeploymentStatus::InProgress));
        assert!(!DeploymentStatus::Ready.can_advance_to(DeploymentStatus::Fail));
        assert!(DeploymentStatus::Fail.is_terminal());

        let predecessors = DeploymentStatus::predecessors_of(DeploymentStatus::InProgress);
        assert_eq!(
            predecessors,
            vec![
                DeploymentStatus::NotStarted,
                DeploymentStatus::Queued,
                DeploymentStatus::InProgress
            ]
        );
    }
}
