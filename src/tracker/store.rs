use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};

use crate::BatchError;

use super::record::IdempotencyRecord;

/// Result of a compare-and-swap against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Swapped,
    VersionMismatch { current: u64 },
    Missing,
}

/// Persistence for idempotency records with row-level optimistic locking.
pub trait IdempotencyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BatchError>;

    /// Stores `record` unless its key exists. Returns the stored record and
    /// whether this call created it.
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<(IdempotencyRecord, bool), BatchError>;

    /// Replaces the stored record only if its `lock_version` equals `expected_version`.
    fn compare_and_swap(&self, expected_version: u64, record: IdempotencyRecord) -> Result<CasResult, BatchError>;

    /// Deletes every record whose `expires_at` is at or before `now`, returning their keys.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, BatchError>;

    fn list(&self) -> Result<Vec<IdempotencyRecord>, BatchError>;
}

/// Process-local store. Each key's slot is locked for the duration of an
/// insert or swap, which gives the same guarantees as a versioned row.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BatchError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<(IdempotencyRecord, bool), BatchError> {
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok((record, true))
            }
        }
    }

    fn compare_and_swap(&self, expected_version: u64, record: IdempotencyRecord) -> Result<CasResult, BatchError> {
        let Some(mut stored) = self.records.get_mut(&record.key) else {
            return Ok(CasResult::Missing);
        };
        if stored.lock_version != expected_version {
            return Ok(CasResult::VersionMismatch {
                current: stored.lock_version,
            });
        }
        *stored = record;
        Ok(CasResult::Swapped)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, BatchError> {
        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|key| self.records.remove_if(key, |_, r| r.is_expired(now)).is_some())
            .collect())
    }

    fn list(&self) -> Result<Vec<IdempotencyRecord>, BatchError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}
