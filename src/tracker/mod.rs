//! Idempotent execution tracking and its tamper-evident audit trail.

pub mod audit;
pub mod idempotency;
pub mod record;
pub mod store;

pub use audit::{AuditEntry, AuditRecord, AuditStore, AuditTrail, InMemoryAuditStore, IntegrityFinding};
pub use idempotency::{Claim, IdempotencyTracker, IdempotencyTrackerBuilder, TransitionDetails, TransitionOutcome};
pub use record::{idempotency_key, request_hash_key, IdempotencyRecord, ProcessingState};
pub use store::{CasResult, IdempotencyStore, InMemoryIdempotencyStore};
