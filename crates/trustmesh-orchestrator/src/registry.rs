use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use trustmesh_types::{BackoffPolicy, Result, TrustmeshError};

/// What the orchestrator needs to know about one kind of task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskKindSpec {
    pub name: String,
    /// An agent must hold every one of these to receive the task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Reject payloads that are not valid JSON.
    #[serde(default)]
    pub json_payload: bool,
    /// Overrides the orchestrator's retry backoff for this kind.
    #[serde(default)]
    pub retry: Option<BackoffPolicy>,
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

impl TaskKindSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_capabilities: BTreeSet::new(),
            max_payload_bytes: default_max_payload_bytes(),
            json_payload: false,
            retry: None,
        }
    }

    pub fn requires<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_payload = true;
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Check a payload against this kind's limits.
    pub fn validate(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload_bytes {
            return Err(TrustmeshError::InvalidPayload(format!(
                "{} bytes exceeds the {} byte limit for '{}'",
                payload.len(),
                self.max_payload_bytes,
                self.name
            )));
        }
        if self.json_payload {
            serde_json::from_slice::<serde_json::Value>(payload).map_err(|e| {
                TrustmeshError::InvalidPayload(format!("'{}' expects JSON: {e}", self.name))
            })?;
        }
        Ok(())
    }
}

/// Task kinds accepted for submission.
#[derive(Default)]
pub struct TaskKindRegistry {
    kinds: DashMap<String, TaskKindSpec>,
}

impl TaskKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: TaskKindSpec) {
        tracing::debug!(kind = %spec.name, "Task kind registered");
        self.kinds.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<TaskKindSpec> {
        self.kinds.get(kind).map(|s| s.clone())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.iter().map(|k| k.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve `kind` and validate `payload` against it.
    pub fn validate(&self, kind: &str, payload: &[u8]) -> Result<TaskKindSpec> {
        let spec = self
            .get(kind)
            .ok_or_else(|| TrustmeshError::UnknownKind(kind.to_string()))?;
        spec.validate(payload)?;
        Ok(spec)
    }
}
