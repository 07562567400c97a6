//! Wire envelopes exchanged with agents over the broker.
//!
//! Every envelope carries `task_id` and `attempt` so that consumers can
//! deduplicate redelivered messages.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Result, TrustmeshError};
use crate::task::Task;
use crate::{AgentId, TaskId};

/// Encode an envelope as JSON bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(TrustmeshError::from)
}

/// Decode an envelope; undecodable input is a permanent `MalformedMessage`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| TrustmeshError::MalformedMessage(e.to_string()))
}

/// Sent to an agent to start one attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    pub task_id: TaskId,
    pub kind: String,
    pub attempt: u32,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl DispatchEnvelope {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind.clone(),
            attempt: task.attempt,
            payload: task.payload.clone(),
            published_at: Utc::now(),
        }
    }
}

/// How an agent finished an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    /// Worth retrying on another attempt (timeouts, unavailable dependencies).
    TransientFailure,
    /// Retrying cannot help (malformed payload, unsupported kind).
    PermanentFailure,
}

/// Reported by an agent when an attempt finishes, and republished by the
/// orchestrator on terminal Completed/Failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
    #[serde(default)]
    pub result_payload: Vec<u8>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ResultEnvelope {
    pub fn success(task_id: TaskId, agent_id: AgentId, attempt: u32, payload: Vec<u8>) -> Self {
        Self {
            task_id,
            agent_id,
            attempt,
            outcome: TaskOutcome::Success,
            result_payload: payload,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
        outcome: TaskOutcome,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            agent_id,
            attempt,
            outcome,
            result_payload: Vec::new(),
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Messages agents send to the orchestrator's inbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// The agent accepted the dispatch and is executing it.
    Started {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    Finished(ResultEnvelope),
    Heartbeat {
        agent_id: AgentId,
        #[serde(default)]
        capabilities: Option<BTreeSet<String>>,
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_dispatch_envelope_carries_dedup_keys() {
        let mut task = Task::new("analyze", b"\x00\x01binary".to_vec());
        task.attempt = 2;
        let envelope = DispatchEnvelope::for_task(&task);
        let bytes = encode(&envelope).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["taskId"], serde_json::json!(task.id));
        assert_eq!(json["attempt"], 2);

        let decoded: DispatchEnvelope = decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_agent_message_tagging() {
        let msg = AgentMessage::Started {
            task_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            attempt: 1,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "started");

        let finished = AgentMessage::Finished(ResultEnvelope::failure(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            TaskOutcome::TransientFailure,
            "upstream timeout",
        ));
        let bytes = encode(&finished).unwrap();
        assert_eq!(decode::<AgentMessage>(&bytes).unwrap(), finished);
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = decode::<AgentMessage>(b"not json").unwrap_err();
        assert!(matches!(err, TrustmeshError::MalformedMessage(_)));
    }
}
