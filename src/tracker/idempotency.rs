use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};

use crate::BatchError;

use super::{
    audit::{AuditEntry, AuditStore, AuditTrail, InMemoryAuditStore},
    record::{idempotency_key, IdempotencyRecord, ProcessingState},
    store::{CasResult, IdempotencyStore, InMemoryIdempotencyStore},
};

const REREAD_ATTEMPTS: usize = 5;

/// Result of an optimistic state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(IdempotencyRecord),
    /// The stored version moved on; re-read and retry the whole transition.
    Conflict { current_version: u64 },
}

/// Record returned by [`IdempotencyTracker::claim_key`], with whether this
/// call created it. Only the creator owns the execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub record: IdempotencyRecord,
    pub created: bool,
}

/// What accompanies a transition into the audit trail and the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionDetails {
    pub reason: String,
    pub response_payload: Option<String>,
    pub error_details: Option<String>,
    pub processing_context: Option<String>,
}

impl TransitionDetails {
    pub fn reason(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.response_payload = Some(payload.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error_details = Some(error.to_string());
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.processing_context = Some(context.to_string());
        self
    }
}

/// Idempotent execution tracking with optimistic locking and an audit trail.
///
/// ```text
/// IN_PROGRESS ──> COMPLETED
///      │
///      └──────> FAILED ──(retry_count < max_retries)──> IN_PROGRESS
/// ```
pub struct IdempotencyTracker {
    store: Arc<dyn IdempotencyStore>,
    audit: AuditTrail,
    ttl: Duration,
    max_retries: u32,
    changed_by: String,
}

impl IdempotencyTracker {
    /// Returns the record for the identifiers, creating it IN_PROGRESS when
    /// absent. Callers must branch on the returned state instead of re-executing.
    pub fn begin_or_reuse(
        &self,
        source_system: &str,
        job: &str,
        transaction_id: &str,
    ) -> Result<IdempotencyRecord, BatchError> {
        self.begin_or_reuse_key(&idempotency_key(source_system, job, transaction_id))
    }

    pub fn begin_or_reuse_key(&self, key: &str) -> Result<IdempotencyRecord, BatchError> {
        self.claim_key(key, self.max_retries).map(|claim| claim.record)
    }

    /// Like [`IdempotencyTracker::begin_or_reuse_key`], with a retry ceiling
    /// for the new record and a flag telling the caller whether it owns it.
    pub fn claim_key(&self, key: &str, max_retries: u32) -> Result<Claim, BatchError> {
        let now = Utc::now();
        let candidate = IdempotencyRecord::new(key, max_retries, self.ttl, now);
        let (record, created) = self.store.insert_if_absent(candidate)?;

        if created {
            let entry = AuditEntry {
                old_state: None,
                new_state: ProcessingState::InProgress,
                reason: "execution started".to_string(),
                changed_by: self.changed_by.clone(),
                processing_context: None,
            };
            if let Err(err) = self.audit.record(key, entry, now) {
                error!(target: "compliance", "{} created without an audit record: {}", key, err);
                return Err(err);
            }
            info!("Started tracking {}", key);
        } else {
            debug!("Reusing {} in state {}", key, record.state);
        }

        Ok(Claim { record, created })
    }

    /// Retry ceiling given to records created without an explicit one.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BatchError> {
        self.store.get(key)
    }

    fn require(&self, key: &str) -> Result<IdempotencyRecord, BatchError> {
        self.store
            .get(key)?
            .ok_or_else(|| BatchError::RecordNotFound(key.to_string()))
    }

    /// Moves `key` to `new_state` if the stored version is `expected_version`.
    ///
    /// A FAILED -> IN_PROGRESS transition consumes one retry.
    ///
    /// # Errors
    /// - `RecordNotFound` when the key is unknown
    /// - `IllegalTransition` when the state machine forbids the move
    pub fn transition(
        &self,
        key: &str,
        new_state: ProcessingState,
        expected_version: u64,
        details: TransitionDetails,
    ) -> Result<TransitionOutcome, BatchError> {
        let current = self.require(key)?;
        if current.lock_version != expected_version {
            return Ok(TransitionOutcome::Conflict {
                current_version: current.lock_version,
            });
        }
        if !current.can_transition_to(new_state) {
            return Err(BatchError::IllegalTransition {
                key: key.to_string(),
                from: current.state.to_string(),
                to: new_state.to_string(),
            });
        }

        let mut next = current.clone();
        next.state = new_state;
        if current.state == ProcessingState::Failed {
            next.retry_count += 1;
        }
        if details.response_payload.is_some() {
            next.response_payload.clone_from(&details.response_payload);
        }
        if details.error_details.is_some() {
            next.error_details.clone_from(&details.error_details);
        }

        self.apply(&current, next, details.reason, details.processing_context, &self.changed_by)
    }

    /// Counts one more failed attempt: FAILED once the count reaches
    /// `max_retries`, IN_PROGRESS otherwise.
    ///
    /// # Errors
    /// - `ConcurrencyConflict` when the stored version is not `expected_version`
    /// - `IllegalTransition` when the record is COMPLETED or out of retries
    pub fn increment_retry(&self, key: &str, expected_version: u64) -> Result<IdempotencyRecord, BatchError> {
        let current = self.require(key)?;
        if current.lock_version != expected_version {
            return Err(BatchError::ConcurrencyConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current.lock_version,
            });
        }
        if current.state == ProcessingState::Completed || current.retries_exhausted() {
            return Err(BatchError::IllegalTransition {
                key: key.to_string(),
                from: current.state.to_string(),
                to: ProcessingState::InProgress.to_string(),
            });
        }

        let mut next = current.clone();
        next.retry_count += 1;
        next.state = if next.retry_count >= next.max_retries {
            ProcessingState::Failed
        } else {
            ProcessingState::InProgress
        };
        let reason = format!("retry {} of {}", next.retry_count, next.max_retries);

        match self.apply(&current, next, reason, None, &self.changed_by)? {
            TransitionOutcome::Applied(record) => {
                if record.state == ProcessingState::Failed {
                    warn!("{} failed after {} retries", key, record.retry_count);
                }
                Ok(record)
            }
            TransitionOutcome::Conflict { current_version } => Err(BatchError::ConcurrencyConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current_version,
            }),
        }
    }

    /// Marks `key` COMPLETED, re-reading on version conflicts.
    pub fn complete(&self, key: &str, payload: Option<&str>) -> Result<IdempotencyRecord, BatchError> {
        let mut details = TransitionDetails::reason("execution completed");
        details.response_payload = payload.map(str::to_string);
        self.transition_with_reread(key, ProcessingState::Completed, details)
    }

    /// Marks `key` FAILED, re-reading on version conflicts.
    pub fn fail(&self, key: &str, error: &str) -> Result<IdempotencyRecord, BatchError> {
        let details = TransitionDetails::reason("execution failed").with_error(error);
        self.transition_with_reread(key, ProcessingState::Failed, details)
    }

    fn transition_with_reread(
        &self,
        key: &str,
        new_state: ProcessingState,
        details: TransitionDetails,
    ) -> Result<IdempotencyRecord, BatchError> {
        let mut seen = (0, 0);
        for attempt in 1..=REREAD_ATTEMPTS {
            let current = self.require(key)?;
            match self.transition(key, new_state, current.lock_version, details.clone())? {
                TransitionOutcome::Applied(record) => return Ok(record),
                TransitionOutcome::Conflict { current_version } => {
                    debug!("Conflict on {} (attempt {}), re-reading", key, attempt);
                    seen = (current.lock_version, current_version);
                }
            }
        }
        Err(BatchError::ConcurrencyConflict {
            key: key.to_string(),
            expected: seen.0,
            actual: seen.1,
        })
    }

    /// IN_PROGRESS records not updated within `threshold` of `now`.
    ///
    /// They are only reported; terminating them is an operator decision
    /// (see [`IdempotencyTracker::cancel`]).
    pub fn find_stale(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<IdempotencyRecord>, BatchError> {
        let cutoff = now - threshold;
        let mut stale: Vec<IdempotencyRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.state == ProcessingState::InProgress && r.updated_at < cutoff)
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        Ok(stale)
    }

    /// Operator termination of an IN_PROGRESS record: terminally FAILED with
    /// no retries left.
    pub fn cancel(&self, key: &str, reason: &str, operator: &str) -> Result<IdempotencyRecord, BatchError> {
        let mut seen = (0, 0);
        for _ in 0..REREAD_ATTEMPTS {
            let current = self.require(key)?;
            if current.state != ProcessingState::InProgress {
                return Err(BatchError::IllegalTransition {
                    key: key.to_string(),
                    from: current.state.to_string(),
                    to: ProcessingState::Failed.to_string(),
                });
            }

            let mut next = current.clone();
            next.state = ProcessingState::Failed;
            next.retry_count = next.max_retries;
            next.error_details = Some(format!("cancelled: {reason}"));

            match self.apply(&current, next, format!("cancelled: {reason}"), None, operator)? {
                TransitionOutcome::Applied(record) => {
                    warn!("{} cancelled by {}: {}", key, operator, reason);
                    return Ok(record);
                }
                TransitionOutcome::Conflict { current_version } => seen = (current.lock_version, current_version),
            }
        }
        Err(BatchError::ConcurrencyConflict {
            key: key.to_string(),
            expected: seen.0,
            actual: seen.1,
        })
    }

    /// Deletes expired records. Audit records are kept.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, BatchError> {
        let deleted = self.store.delete_expired(now)?;
        if !deleted.is_empty() {
            info!("Deleted {} expired idempotency records", deleted.len());
        }
        Ok(deleted.len())
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    fn apply(
        &self,
        current: &IdempotencyRecord,
        mut next: IdempotencyRecord,
        reason: String,
        processing_context: Option<String>,
        changed_by: &str,
    ) -> Result<TransitionOutcome, BatchError> {
        let now = Utc::now();
        next.lock_version = current.lock_version + 1;
        next.updated_at = now;

        match self.store.compare_and_swap(current.lock_version, next.clone())? {
            CasResult::Swapped => {
                let entry = AuditEntry {
                    old_state: Some(current.state),
                    new_state: next.state,
                    reason,
                    changed_by: changed_by.to_string(),
                    processing_context,
                };
                if let Err(err) = self.audit.record(&next.key, entry, now) {
                    error!(
                        target: "compliance",
                        "{}: {} -> {} (v{}) applied without an audit record: {}",
                        next.key, current.state, next.state, next.lock_version, err
                    );
                    return Err(err);
                }
                debug!("{}: {} -> {} (v{})", next.key, current.state, next.state, next.lock_version);
                Ok(TransitionOutcome::Applied(next))
            }
            CasResult::VersionMismatch { current } => Ok(TransitionOutcome::Conflict {
                current_version: current,
            }),
            CasResult::Missing => Err(BatchError::RecordNotFound(next.key)),
        }
    }
}

pub struct IdempotencyTrackerBuilder {
    store: Option<Arc<dyn IdempotencyStore>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    ttl: Duration,
    max_retries: u32,
    changed_by: String,
}

impl Default for IdempotencyTrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyTrackerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            audit_store: None,
            ttl: Duration::hours(24),
            max_retries: 3,
            changed_by: "etl-batch".to_string(),
        }
    }

    pub fn store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_store(mut self, audit_store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(audit_store);
        self
    }

    /// Lifetime of new records.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Actor recorded in the audit trail for automatic transitions.
    pub fn changed_by(mut self, changed_by: &str) -> Self {
        self.changed_by = changed_by.to_string();
        self
    }

    /// Missing stores default to the in-memory implementations.
    pub fn build(self) -> IdempotencyTracker {
        IdempotencyTracker {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryIdempotencyStore::new())),
            audit: AuditTrail::new(
                self.audit_store
                    .unwrap_or_else(|| Arc::new(InMemoryAuditStore::new())),
            ),
            ttl: self.ttl,
            max_retries: self.max_retries,
            changed_by: self.changed_by,
        }
    }
}
