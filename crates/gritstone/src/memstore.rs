//! Deterministic in-memory store for harness tests and the CLI smoke path.
//!
//! `MemStore` is not a storage engine; it is the smallest honest
//! implementation of [`StoreClient`] the harness can exercise itself
//! against. Transient faults are injected from a seeded stream so that
//! retry handling is reproducible: same seed, same faults.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::args::{Consistency, Durability};
use crate::store::{
    BatchOp, Direction, PartitionId, StoreClient, StoreError, StoreKey, Value, ValueVersion,
    Version, WriteOutcome,
};

/// Number of simulated partitions keys hash across.
const PARTITION_COUNT: u64 = 16;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for simulated store behavior.
#[derive(Debug, Clone, Default)]
pub struct MemStoreConfig {
    /// Probability in `[0.0, 1.0]` that any call fails with a transient
    /// fault before touching state.
    pub fault_probability: f64,
    /// Seed for the fault stream.
    pub fault_seed: u64,
}

impl MemStoreConfig {
    /// A store that never injects faults.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// A store that injects transient faults with the given probability.
    pub fn with_faults(probability: f64, seed: u64) -> Self {
        Self {
            fault_probability: probability,
            fault_seed: seed,
        }
    }
}

/// Operation counters, read at test end.
#[derive(Debug, Default)]
pub struct MemStoreStats {
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub scans: AtomicU64,
    pub injected_faults: AtomicU64,
}

// ============================================================================
// MemStore
// ============================================================================

/// In-memory [`StoreClient`] with seeded transient-fault injection.
pub struct MemStore {
    config: MemStoreConfig,
    records: RwLock<BTreeMap<StoreKey, (Value, Version)>>,
    next_version: AtomicU64,
    dropped: AtomicBool,
    fault_rng: Mutex<SmallRng>,
    stats: MemStoreStats,
}

impl MemStore {
    pub fn new(config: MemStoreConfig) -> Self {
        let fault_rng = Mutex::new(SmallRng::seed_from_u64(config.fault_seed));
        Self {
            config,
            records: RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            dropped: AtomicBool::new(false),
            fault_rng,
            stats: MemStoreStats::default(),
        }
    }

    /// A store that never injects faults.
    pub fn reliable() -> Self {
        Self::new(MemStoreConfig::reliable())
    }

    pub fn stats(&self) -> &MemStoreStats {
        &self.stats
    }

    /// Number of records currently stored.
    pub fn record_count(&self) -> usize {
        self.records.read().expect("records lock").len()
    }

    /// Re-creates the table after a drop, for multi-scenario tests.
    pub fn recreate_table(&self) {
        self.dropped.store(false, Ordering::Release);
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.dropped.load(Ordering::Acquire) {
            Err(StoreError::TableMissing("table dropped".to_string()))
        } else {
            Ok(())
        }
    }

    fn maybe_fault(&self) -> Result<(), StoreError> {
        if self.config.fault_probability > 0.0 {
            let roll: f64 = self.fault_rng.lock().expect("fault rng lock").r#gen();
            if roll < self.config.fault_probability {
                self.stats.injected_faults.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::Unavailable("injected fault".to_string()));
            }
        }
        Ok(())
    }

    fn bump_version(&self) -> Version {
        Version(self.next_version.fetch_add(1, Ordering::Relaxed))
    }

    fn apply_one(
        &self,
        records: &mut BTreeMap<StoreKey, (Value, Version)>,
        op: BatchOp,
    ) -> WriteOutcome {
        match op {
            BatchOp::Put { key, value } => {
                let version = self.bump_version();
                let previous = records.insert(key, (value, version));
                WriteOutcome {
                    previous: previous.map(into_value_version),
                    version: Some(version),
                    success: true,
                }
            }
            BatchOp::Delete { key } => {
                let previous = records.remove(&key);
                WriteOutcome {
                    success: previous.is_some(),
                    previous: previous.map(into_value_version),
                    version: None,
                }
            }
        }
    }
}

fn into_value_version((value, version): (Value, Version)) -> ValueVersion {
    ValueVersion { value, version }
}

impl StoreClient for MemStore {
    fn get(
        &self,
        key: StoreKey,
        _consistency: Consistency,
        _timeout: Duration,
    ) -> Result<Option<ValueVersion>, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().expect("records lock");
        Ok(records.get(&key).cloned().map(into_value_version))
    }

    fn multi_get(
        &self,
        parent: u64,
        _consistency: Consistency,
        _timeout: Duration,
    ) -> Result<Vec<(StoreKey, ValueVersion)>, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().expect("records lock");
        Ok(records
            .range(parent_range(parent))
            .map(|(k, v)| (*k, into_value_version(v.clone())))
            .collect())
    }

    fn multi_get_keys(
        &self,
        parent: u64,
        _consistency: Consistency,
        _timeout: Duration,
    ) -> Result<Vec<StoreKey>, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().expect("records lock");
        Ok(records.range(parent_range(parent)).map(|(k, _)| *k).collect())
    }

    fn multi_get_iterator<'a>(
        &'a self,
        parent: u64,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError> {
        let entries = self.multi_get(parent, consistency, timeout)?;
        Ok(Box::new(entries.into_iter()))
    }

    fn put(
        &self,
        key: StoreKey,
        value: Value,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        Ok(self.apply_one(&mut records, BatchOp::Put { key, value }))
    }

    fn put_if_absent(
        &self,
        key: StoreKey,
        value: Value,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        if let Some(existing) = records.get(&key) {
            return Ok(WriteOutcome {
                previous: Some(into_value_version(existing.clone())),
                version: None,
                success: false,
            });
        }
        let version = self.bump_version();
        records.insert(key, (value, version));
        Ok(WriteOutcome {
            previous: None,
            version: Some(version),
            success: true,
        })
    }

    fn put_if_present(
        &self,
        key: StoreKey,
        value: Value,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        match records.get(&key).cloned() {
            Some(existing) => {
                let version = self.bump_version();
                records.insert(key, (value, version));
                Ok(WriteOutcome {
                    previous: Some(into_value_version(existing)),
                    version: Some(version),
                    success: true,
                })
            }
            None => Ok(WriteOutcome {
                previous: None,
                version: None,
                success: false,
            }),
        }
    }

    fn put_if_version(
        &self,
        key: StoreKey,
        value: Value,
        expect: Version,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        match records.get(&key).cloned() {
            Some((_, version)) if version == expect => {
                let new_version = self.bump_version();
                let previous = records.insert(key, (value, new_version));
                Ok(WriteOutcome {
                    previous: previous.map(into_value_version),
                    version: Some(new_version),
                    success: true,
                })
            }
            existing => Ok(WriteOutcome {
                previous: existing.map(into_value_version),
                version: None,
                success: false,
            }),
        }
    }

    fn delete(
        &self,
        key: StoreKey,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        Ok(self.apply_one(&mut records, BatchOp::Delete { key }))
    }

    fn delete_if_version(
        &self,
        key: StoreKey,
        expect: Version,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<WriteOutcome, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        match records.get(&key) {
            Some((_, version)) if *version == expect => {
                let previous = records.remove(&key);
                Ok(WriteOutcome {
                    previous: previous.map(into_value_version),
                    version: None,
                    success: true,
                })
            }
            existing => Ok(WriteOutcome {
                previous: existing.cloned().map(into_value_version),
                version: None,
                success: false,
            }),
        }
    }

    fn multi_delete(
        &self,
        key: StoreKey,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<u64, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        Ok(u64::from(records.remove(&key).is_some()))
    }

    fn execute_batch(
        &self,
        ops: Vec<BatchOp>,
        _durability: Durability,
        _timeout: Duration,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("records lock");
        Ok(ops
            .into_iter()
            .map(|op| self.apply_one(&mut records, op))
            .collect())
    }

    fn store_iterator<'a>(
        &'a self,
        direction: Direction,
        _consistency: Consistency,
        _batch_size: usize,
        _timeout: Duration,
    ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().expect("records lock");
        let mut entries: Vec<(StoreKey, ValueVersion)> = records
            .iter()
            .map(|(k, v)| (*k, into_value_version(v.clone())))
            .collect();
        if matches!(direction, Direction::Reverse) {
            entries.reverse();
        }
        Ok(Box::new(entries.into_iter()))
    }

    fn partition_of(&self, key: StoreKey) -> PartitionId {
        PartitionId((key.parent % PARTITION_COUNT) as u32)
    }

    fn drop_table(&self, _timeout: Duration) -> Result<(), StoreError> {
        self.maybe_fault()?;
        self.check_alive()?;
        self.records.write().expect("records lock").clear();
        self.dropped.store(true, Ordering::Release);
        Ok(())
    }
}

fn parent_range(parent: u64) -> std::ops::RangeInclusive<StoreKey> {
    StoreKey { parent, minor: 0 }..=StoreKey {
        parent,
        minor: u16::MAX,
    }
}

// ============================================================================
// Tests
// ============================================================================
