//! The store-client capability surface the harness drives.
//!
//! The harness is glue code and test-operation generators layered over an
//! externally supplied store client; this trait is the full capability set
//! it consumes. Implementations are injected (composition, no inheritance),
//! so the same harness core runs against any backend that can satisfy the
//! contract. The in-memory [`crate::memstore::MemStore`] implements it for
//! tests and the CLI smoke path.

use std::time::Duration;

use thiserror::Error;

use crate::args::{Consistency, Durability};

/// Raw stored value bytes.
pub type Value = Vec<u8>;

/// Opaque, monotonically increasing record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

/// A store key: a 40-bit parent (major path) and an 8-bit minor component,
/// mirroring the keynum split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    pub parent: u64,
    pub minor: u16,
}

/// Identifier of the partition a key hashes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub u32);

/// A value together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueVersion {
    pub value: Value,
    pub version: Version,
}

/// Scan direction for whole-store iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Normalized result of any write primitive.
///
/// Every update reports the same `(previous value, version, success)` shape
/// regardless of which underlying store call performed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The value previously stored under the key, when the store reported it.
    pub previous: Option<ValueVersion>,
    /// Version of the newly written record, when the write succeeded.
    pub version: Option<Version>,
    /// Whether the write took effect (conditional writes may legitimately
    /// decline).
    pub success: bool,
}

/// One entry of an `execute_batch` request.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: StoreKey, value: Value },
    Delete { key: StoreKey },
}

/// Store-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("table missing: {0}")]
    TableMissing(String),

    #[error("store fault: {0}")]
    Fault(String),
}

impl StoreError {
    /// True for faults the retry wrapper is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Unavailable(_))
    }
}

/// The external store collaborator.
///
/// All methods are synchronous from the harness's point of view; blocking on
/// a store call is the only suspension point a worker thread has.
pub trait StoreClient: Send + Sync {
    /// Point read.
    fn get(
        &self,
        key: StoreKey,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Option<ValueVersion>, StoreError>;

    /// All records under a parent key.
    fn multi_get(
        &self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Vec<(StoreKey, ValueVersion)>, StoreError>;

    /// Keys (no values) under a parent key.
    fn multi_get_keys(
        &self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Vec<StoreKey>, StoreError>;

    /// Iterator form of [`Self::multi_get`].
    fn multi_get_iterator<'a>(
        &'a self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError>;

    /// Unconditional put.
    fn put(
        &self,
        key: StoreKey,
        value: Value,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError>;

    /// Put only if the key is absent.
    fn put_if_absent(
        &self,
        key: StoreKey,
        value: Value,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError>;

    /// Put only if the key is present.
    fn put_if_present(
        &self,
        key: StoreKey,
        value: Value,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError>;

    /// Put only if the current version matches `expect`.
    fn put_if_version(
        &self,
        key: StoreKey,
        value: Value,
        expect: Version,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError>;

    /// Unconditional delete.
    fn delete(
        &self,
        key: StoreKey,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError>;

    /// Delete only if the current version matches `expect`.
    fn delete_if_version(
        &self,
        key: StoreKey,
        expect: Version,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError>;

    /// Range delete scoped to a single key; returns the number of records
    /// removed.
    fn multi_delete(
        &self,
        key: StoreKey,
        durability: Durability,
        timeout: Duration,
    ) -> Result<u64, StoreError>;

    /// Atomically executes a batch of operations sharing a parent key.
    fn execute_batch(
        &self,
        ops: Vec<BatchOp>,
        durability: Durability,
        timeout: Duration,
    ) -> Result<Vec<WriteOutcome>, StoreError>;

    /// Iterates every record in the store, for extinction/scan checks.
    fn store_iterator<'a>(
        &'a self,
        direction: Direction,
        consistency: Consistency,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError>;

    /// The partition a key hashes to, for diagnostics and partition
    /// restriction.
    fn partition_of(&self, key: StoreKey) -> PartitionId;

    /// Drops the backing table. Used only by the drop-table scenario.
    fn drop_table(&self, timeout: Duration) -> Result<(), StoreError>;
}

/// Shared handles are clients too; the drop-table watchdog thread needs an
/// owned handle while the harness keeps driving the same store.
impl<T: StoreClient + ?Sized> StoreClient for std::sync::Arc<T> {
    fn get(
        &self,
        key: StoreKey,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Option<ValueVersion>, StoreError> {
        (**self).get(key, consistency, timeout)
    }

    fn multi_get(
        &self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Vec<(StoreKey, ValueVersion)>, StoreError> {
        (**self).multi_get(parent, consistency, timeout)
    }

    fn multi_get_keys(
        &self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Vec<StoreKey>, StoreError> {
        (**self).multi_get_keys(parent, consistency, timeout)
    }

    fn multi_get_iterator<'a>(
        &'a self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError> {
        (**self).multi_get_iterator(parent, consistency, timeout)
    }

    fn put(
        &self,
        key: StoreKey,
        value: Value,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).put(key, value, durability, timeout)
    }

    fn put_if_absent(
        &self,
        key: StoreKey,
        value: Value,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).put_if_absent(key, value, durability, timeout)
    }

    fn put_if_present(
        &self,
        key: StoreKey,
        value: Value,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).put_if_present(key, value, durability, timeout)
    }

    fn put_if_version(
        &self,
        key: StoreKey,
        value: Value,
        expect: Version,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).put_if_version(key, value, expect, durability, timeout)
    }

    fn delete(
        &self,
        key: StoreKey,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).delete(key, durability, timeout)
    }

    fn delete_if_version(
        &self,
        key: StoreKey,
        expect: Version,
        durability: Durability,
        timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).delete_if_version(key, expect, durability, timeout)
    }

    fn multi_delete(
        &self,
        key: StoreKey,
        durability: Durability,
        timeout: Duration,
    ) -> Result<u64, StoreError> {
        (**self).multi_delete(key, durability, timeout)
    }

    fn execute_batch(
        &self,
        ops: Vec<BatchOp>,
        durability: Durability,
        timeout: Duration,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        (**self).execute_batch(ops, durability, timeout)
    }

    fn store_iterator<'a>(
        &'a self,
        direction: Direction,
        consistency: Consistency,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError> {
        (**self).store_iterator(direction, consistency, batch_size, timeout)
    }

    fn partition_of(&self, key: StoreKey) -> PartitionId {
        (**self).partition_of(key)
    }

    fn drop_table(&self, timeout: Duration) -> Result<(), StoreError> {
        (**self).drop_table(timeout)
    }
}
