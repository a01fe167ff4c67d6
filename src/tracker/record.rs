use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    InProgress,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::InProgress => "IN_PROGRESS",
            ProcessingState::Completed => "COMPLETED",
            ProcessingState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(ProcessingState::InProgress),
            "COMPLETED" => Ok(ProcessingState::Completed),
            "FAILED" => Ok(ProcessingState::Failed),
            other => Err(BatchError::Step(format!("unknown processing state `{other}`"))),
        }
    }
}

/// Key for a job-level execution: `{source_system}:{job}:{transaction_id}`.
pub fn idempotency_key(source_system: &str, job: &str, transaction_id: &str) -> String {
    format!("{source_system}:{job}:{transaction_id}")
}

/// Key for a request identified only by its payload.
pub fn request_hash_key(payload: &[u8]) -> String {
    format!("req:{}", hex::encode(Sha256::digest(payload)))
}

/// One tracked execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: ProcessingState,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Incremented on every state mutation.
    pub lock_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub response_payload: Option<String>,
    pub error_details: Option<String>,
}

impl IdempotencyRecord {
    pub fn new(key: &str, max_retries: u32, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            state: ProcessingState::InProgress,
            retry_count: 0,
            max_retries,
            lock_version: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            response_payload: None,
            error_details: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// COMPLETED, or FAILED with no retries left.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            ProcessingState::Completed => true,
            ProcessingState::Failed => self.retries_exhausted(),
            ProcessingState::InProgress => false,
        }
    }

    /// Whether `self.state -> to` is a legal transition.
    pub fn can_transition_to(&self, to: ProcessingState) -> bool {
        match (self.state, to) {
            (ProcessingState::InProgress, ProcessingState::Completed | ProcessingState::Failed) => true,
            (ProcessingState::Failed, ProcessingState::InProgress) => !self.retries_exhausted(),
            _ => false,
        }
    }
}
