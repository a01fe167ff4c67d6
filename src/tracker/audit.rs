//! Append-only, hash-chained log of idempotency state transitions.
//!
//! Each [`AuditRecord`] stores the hash of the previous record for the same key
//! and its own hash over its fields plus that previous hash. A record can
//! therefore be verified on its own: editing any field of one record breaks
//! that record's hash and no other.

use std::{fmt, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use log::{error, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::BatchError;

use super::record::ProcessingState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub key: String,
    /// Position in the key's chain, starting at 1.
    pub sequence: u64,
    pub old_state: Option<ProcessingState>,
    pub new_state: ProcessingState,
    pub reason: String,
    pub changed_by: String,
    pub change_date: DateTime<Utc>,
    pub processing_context: Option<String>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl AuditRecord {
    /// SHA-256 over the record's fields and `previous_hash`, hex encoded.
    ///
    /// Every field is length-prefixed and optional fields carry a presence tag,
    /// so no two distinct records share an encoding.
    pub fn compute_hash(&self) -> String {
        let change_date = self.change_date.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, Some(self.key.as_str()));
        hasher.update(self.sequence.to_be_bytes());
        hash_field(&mut hasher, self.old_state.map(|s| s.as_str()));
        hash_field(&mut hasher, Some(self.new_state.as_str()));
        hash_field(&mut hasher, Some(self.reason.as_str()));
        hash_field(&mut hasher, Some(self.changed_by.as_str()));
        hash_field(&mut hasher, Some(change_date.as_str()));
        hash_field(&mut hasher, self.processing_context.as_deref());
        hash_field(&mut hasher, self.previous_hash.as_deref());

        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> bool {
        self.compute_hash() == self.hash
    }
}

fn hash_field(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        None => hasher.update([0u8]),
        Some(text) => {
            hasher.update([1u8]);
            hasher.update((text.len() as u64).to_be_bytes());
            hasher.update(text.as_bytes());
        }
    }
}

/// Details of one transition, before the chain fields are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub old_state: Option<ProcessingState>,
    pub new_state: ProcessingState,
    pub reason: String,
    pub changed_by: String,
    pub processing_context: Option<String>,
}

impl AuditEntry {
    fn seal(self, key: &str, sequence: u64, change_date: DateTime<Utc>, previous_hash: Option<String>) -> AuditRecord {
        let mut record = AuditRecord {
            key: key.to_string(),
            sequence,
            old_state: self.old_state,
            new_state: self.new_state,
            reason: self.reason,
            changed_by: self.changed_by,
            change_date,
            processing_context: self.processing_context,
            previous_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        record
    }
}

/// Persistence for audit records.
pub trait AuditStore: Send + Sync {
    /// Appends `entry` to the chain of `key`, linking it to the last record.
    /// Must be atomic per key.
    fn append(&self, key: &str, entry: AuditEntry, change_date: DateTime<Utc>) -> Result<AuditRecord, BatchError>;

    /// Records of `key` in sequence order.
    fn records_for(&self, key: &str) -> Result<Vec<AuditRecord>, BatchError>;

    /// Deletes records whose `change_date` is before `cutoff`. Returns how many were removed.
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, BatchError>;
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    chains: DashMap<String, Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append(&self, key: &str, entry: AuditEntry, change_date: DateTime<Utc>) -> Result<AuditRecord, BatchError> {
        let mut chain = self.chains.entry(key.to_string()).or_default();
        let (sequence, previous_hash) = match chain.last() {
            Some(last) => (last.sequence + 1, Some(last.hash.clone())),
            None => (1, None),
        };
        let record = entry.seal(key, sequence, change_date, previous_hash);
        chain.push(record.clone());
        Ok(record)
    }

    fn records_for(&self, key: &str) -> Result<Vec<AuditRecord>, BatchError> {
        Ok(self.chains.get(key).map(|c| c.value().clone()).unwrap_or_default())
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, BatchError> {
        let mut purged = 0;
        for mut chain in self.chains.iter_mut() {
            let before = chain.len();
            chain.retain(|r| r.change_date >= cutoff);
            purged += before - chain.len();
        }
        self.chains.retain(|_, chain| !chain.is_empty());
        Ok(purged)
    }
}

/// A problem found while verifying a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFinding {
    /// The record's stored hash does not match its contents.
    HashMismatch { key: String, sequence: u64 },
    /// The record's `previous_hash` does not match the preceding record.
    BrokenLink { key: String, sequence: u64 },
}

impl IntegrityFinding {
    pub fn sequence(&self) -> u64 {
        match self {
            IntegrityFinding::HashMismatch { sequence, .. } | IntegrityFinding::BrokenLink { sequence, .. } => *sequence,
        }
    }

    fn into_error(self) -> BatchError {
        match self {
            IntegrityFinding::HashMismatch { key, sequence } | IntegrityFinding::BrokenLink { key, sequence } => {
                BatchError::IntegrityViolation { key, sequence }
            }
        }
    }
}

impl fmt::Display for IntegrityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFinding::HashMismatch { key, sequence } => {
                write!(f, "hash mismatch on {key} #{sequence}")
            }
            IntegrityFinding::BrokenLink { key, sequence } => {
                write!(f, "broken chain link on {key} #{sequence}")
            }
        }
    }
}

/// Checks every record on its own and every adjacent pair's link.
///
/// The first record of a (possibly purged) chain is not link-checked.
pub fn verify_records(records: &[AuditRecord]) -> Vec<IntegrityFinding> {
    let mut findings = Vec::new();

    for (index, record) in records.iter().enumerate() {
        if !record.verify() {
            findings.push(IntegrityFinding::HashMismatch {
                key: record.key.clone(),
                sequence: record.sequence,
            });
        }
        if index > 0 && record.previous_hash.as_deref() != Some(records[index - 1].hash.as_str()) {
            findings.push(IntegrityFinding::BrokenLink {
                key: record.key.clone(),
                sequence: record.sequence,
            });
        }
    }

    findings
}

/// Writes and verifies the audit trail. Tampering is reported on the
/// `compliance` log target and never corrected.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, key: &str, entry: AuditEntry, change_date: DateTime<Utc>) -> Result<AuditRecord, BatchError> {
        self.store.append(key, entry, change_date)
    }

    pub fn records_for(&self, key: &str) -> Result<Vec<AuditRecord>, BatchError> {
        self.store.records_for(key)
    }

    /// Every integrity finding for `key`'s chain; empty when the chain is intact.
    pub fn verify_chain(&self, key: &str) -> Result<Vec<IntegrityFinding>, BatchError> {
        let findings = verify_records(&self.store.records_for(key)?);
        for finding in &findings {
            error!(target: "compliance", "Audit integrity violation: {}", finding);
        }
        Ok(findings)
    }

    /// Like [`AuditTrail::verify_chain`] but fails on the first finding.
    pub fn ensure_chain_intact(&self, key: &str) -> Result<(), BatchError> {
        match self.verify_chain(key)?.into_iter().next() {
            Some(finding) => Err(finding.into_error()),
            None => Ok(()),
        }
    }

    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, BatchError> {
        let purged = self.store.purge_older_than(cutoff)?;
        info!("Purged {} audit records older than {}", purged, cutoff);
        Ok(purged)
    }
}
