// Target ingress - the wire contract consumed by the HTTP API layer.
//
// The API surface itself lives outside this crate; it forwards validated
// `{target_ip, source?}` submissions here. Client identifiers are stripped
// before this boundary and never reach the store.

use crate::target_queue::{EnqueueOutcome, TargetQueue};
use crate::types::{canonicalize_ip, TaskPriority, TaskSource};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSubmission {
    pub target_ip: String,
    #[serde(default)]
    pub source: Option<TaskSource>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("invalid target IP: {0}")]
    InvalidIp(#[from] crate::types::TypeParseError),
    #[error("queue error: {0}")]
    Queue(#[from] crate::target_queue::QueueError),
}

/// Validate and enqueue one submission. The structured error carries kind
/// and message for the API layer to surface.
pub async fn submit_target(
    queue: &Arc<TargetQueue>,
    submission: TargetSubmission,
) -> Result<EnqueueOutcome, IngressError> {
    let ip = canonicalize_ip(&submission.target_ip)?;
    let source = submission.source.unwrap_or(TaskSource::Api);
    let priority = submission.priority.unwrap_or(TaskPriority::Normal);
    Ok(queue.enqueue(ip, source, priority, None).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_deserializes_with_defaults() {
        let s: TargetSubmission = serde_json::from_str(r#"{"target_ip": "1.1.1.1"}"#).unwrap();
        assert_eq!(s.target_ip, "1.1.1.1");
        assert_eq!(s.source, None);
        assert_eq!(s.priority, None);

        let s: TargetSubmission = serde_json::from_str(
            r#"{"target_ip": "8.8.8.8", "source": "dns", "priority": "high"}"#,
        )
        .unwrap();
        assert_eq!(s.source, Some(TaskSource::Dns));
        assert_eq!(s.priority, Some(TaskPriority::High));
    }

    #[test]
    fn test_invalid_source_is_rejected_at_parse() {
        let result =
            serde_json::from_str::<TargetSubmission>(r#"{"target_ip": "1.1.1.1", "source": "bgp"}"#);
        assert!(result.is_err());
    }
}
