//! Drop-table race scenario.
//!
//! While an exercise phase runs, a driver thread drops the backing table.
//! That changes which outcomes are "expected": operations racing the drop
//! may fail without being anomalies, and operations strictly after a
//! successful drop must fail — with one allowance for a read that still
//! observes stale data, retried once at absolute consistency.
//!
//! The scenario is an [`OpInterceptor`] injected into the scheduler plus a
//! DDL driver with a watchdog timeout, not a subclass of the exercise
//! engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::ops::{Observation, OpKind, Operation};
use crate::phase::{InterceptVerdict, OpInterceptor};
use crate::store::{StoreClient, StoreError};

/// Lifecycle of the schema mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropState {
    /// The drop has not been requested.
    Before,
    /// The drop is in flight.
    Started,
    /// The drop succeeded.
    Finished,
    /// The drop failed or timed out.
    Error,
}

/// The drop-table scenario: shared between the DDL driver thread and the
/// exercise workers (through the interceptor seam).
#[derive(Debug)]
pub struct DropTableScenario {
    state: AtomicU8,
    /// Issuance stamps for in-flight operations.
    clock: AtomicU64,
    /// Stamp taken when the drop succeeded; `u64::MAX` until then.
    dropped_at: AtomicU64,
}

const STATE_BEFORE: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_FINISHED: u8 = 2;
const STATE_ERROR: u8 = 3;

impl Default for DropTableScenario {
    fn default() -> Self {
        Self::new()
    }
}

impl DropTableScenario {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_BEFORE),
            clock: AtomicU64::new(0),
            dropped_at: AtomicU64::new(u64::MAX),
        }
    }

    pub fn state(&self) -> DropState {
        match self.state.load(Ordering::Acquire) {
            STATE_BEFORE => DropState::Before,
            STATE_STARTED => DropState::Started,
            STATE_FINISHED => DropState::Finished,
            _ => DropState::Error,
        }
    }

    fn next_stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel)
    }

    /// Runs the schema drop with a watchdog.
    ///
    /// The drop executes on a side thread; if it does not return within
    /// `budget`, the watchdog's timeout fires first, the (eventual) result is
    /// discarded, and the scenario ends in [`DropState::Error`]. Transient
    /// failures are retried while budget remains.
    pub fn run_drop<S: StoreClient + 'static>(
        &self,
        store: Arc<S>,
        op_timeout: Duration,
        budget: Duration,
    ) -> Result<(), HarnessError> {
        self.state
            .compare_exchange(
                STATE_BEFORE,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| HarnessError::DropFailed("drop already started".to_string()))?;

        let deadline = Instant::now() + budget;
        loop {
            let (tx, rx) = mpsc::channel();
            let worker_store = Arc::clone(&store);
            thread::spawn(move || {
                let _ = tx.send(worker_store.drop_table(op_timeout));
            });

            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Ok(())) => {
                    self.dropped_at.store(self.next_stamp(), Ordering::Release);
                    self.state.store(STATE_FINISHED, Ordering::Release);
                    info!("table drop completed");
                    return Ok(());
                }
                Ok(Err(err)) if err.is_transient() && Instant::now() < deadline => {
                    debug!(error = %err, "table drop failed transiently; retrying");
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(Err(err)) => {
                    self.state.store(STATE_ERROR, Ordering::Release);
                    return Err(HarnessError::Store(err));
                }
                Err(_) => {
                    // Watchdog fired; the worker's result is discarded.
                    self.state.store(STATE_ERROR, Ordering::Release);
                    return Err(HarnessError::DropFailed(format!(
                        "drop did not complete within {budget:?}"
                    )));
                }
            }
        }
    }

    /// Scenario verdict: the schema mutation itself must have succeeded.
    pub fn succeeded(&self) -> bool {
        self.state() == DropState::Finished
    }
}

impl OpInterceptor for DropTableScenario {
    fn before_op(&self, _op: &Operation) -> u64 {
        self.next_stamp()
    }

    fn after_op(
        &self,
        op: &Operation,
        result: Result<&Observation, &StoreError>,
        token: u64,
        retried_absolute: bool,
    ) -> InterceptVerdict {
        match self.state() {
            DropState::Before => InterceptVerdict::Continue,
            DropState::Started | DropState::Error => match result {
                // Racing the drop: failure is tolerated, success is ordinary.
                Err(StoreError::TableMissing(_)) => {
                    debug!(index = op.index, "operation failed during table drop");
                    InterceptVerdict::Expected
                }
                _ => InterceptVerdict::Continue,
            },
            DropState::Finished => {
                let dropped_at = self.dropped_at.load(Ordering::Acquire);
                match result {
                    Err(StoreError::TableMissing(_)) => InterceptVerdict::Expected,
                    Err(_) => InterceptVerdict::Continue,
                    Ok(_) if token < dropped_at => {
                        // Issued while the drop was in flight. The store does
                        // not expose whether the operation landed before or
                        // after the drop, so the model decides: a genuinely
                        // post-drop observation will fail normal
                        // verification on its own.
                        warn!(index = op.index, "operation succeeded after drop(!)");
                        InterceptVerdict::Continue
                    }
                    Ok(_) => {
                        // Issued strictly after a successful drop: it must
                        // fail, except a read gets one stale observation when
                        // retried at absolute consistency.
                        if matches!(op.kind, OpKind::Read(_)) && !retried_absolute {
                            InterceptVerdict::RetryAbsolute
                        } else {
                            InterceptVerdict::Unexpected(
                                "operation succeeded after table drop".to_string(),
                            )
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;
    use crate::ops::ReadKind;
    use crate::store::WriteOutcome;

    fn read_op() -> Operation {
        Operation {
            index: 0,
            first_thread: true,
            keynum: 0,
            kind: OpKind::Read(ReadKind::Get),
            value: None,
        }
    }

    fn update_op() -> Operation {
        Operation {
            index: 0,
            first_thread: true,
            keynum: 0,
            kind: OpKind::Update(crate::ops::UpdateKind::Put),
            value: Some(vec![1]),
        }
    }

    #[test]
    fn drop_lifecycle() {
        let scenario = DropTableScenario::new();
        assert_eq!(scenario.state(), DropState::Before);

        let store = Arc::new(MemStore::reliable());
        scenario
            .run_drop(Arc::clone(&store), Duration::from_secs(1), Duration::from_secs(5))
            .expect("drop succeeds");
        assert_eq!(scenario.state(), DropState::Finished);
        assert!(scenario.succeeded());

        // Single use.
        assert!(
            scenario
                .run_drop(store, Duration::from_secs(1), Duration::from_secs(5))
                .is_err()
        );
    }

    #[test]
    fn before_drop_everything_continues() {
        let scenario = DropTableScenario::new();
        let op = read_op();
        let token = scenario.before_op(&op);
        let observation = Observation::Value { found: None };
        assert_eq!(
            scenario.after_op(&op, Ok(&observation), token, false),
            InterceptVerdict::Continue
        );
    }

    #[test]
    fn table_missing_is_expected_once_started() {
        let scenario = DropTableScenario::new();
        let op = update_op();
        let token = scenario.before_op(&op);
        scenario.state.store(STATE_STARTED, Ordering::Release);

        let err = StoreError::TableMissing("gone".to_string());
        assert_eq!(
            scenario.after_op(&op, Err(&err), token, false),
            InterceptVerdict::Expected
        );
    }

    #[test]
    fn racing_success_defers_to_model_verification() {
        let scenario = DropTableScenario::new();
        let op = update_op();
        // Issued before the drop succeeds...
        let token = scenario.before_op(&op);

        let store = Arc::new(MemStore::reliable());
        scenario
            .run_drop(store, Duration::from_secs(1), Duration::from_secs(5))
            .expect("drop succeeds");

        // ...and observed after it: logged, then judged by the model like
        // any other outcome (the store cannot say which side of the drop it
        // actually landed on).
        let observation = Observation::Write(WriteOutcome {
            previous: None,
            version: None,
            success: true,
        });
        assert_eq!(
            scenario.after_op(&op, Ok(&observation), token, false),
            InterceptVerdict::Continue
        );
    }

    #[test]
    fn post_drop_read_gets_one_absolute_retry() {
        let scenario = DropTableScenario::new();
        let store = Arc::new(MemStore::reliable());
        scenario
            .run_drop(store, Duration::from_secs(1), Duration::from_secs(5))
            .expect("drop succeeds");

        let op = read_op();
        // Issued after the drop succeeded.
        let token = scenario.before_op(&op);
        let observation = Observation::Value { found: None };

        assert_eq!(
            scenario.after_op(&op, Ok(&observation), token, false),
            InterceptVerdict::RetryAbsolute
        );
        // The second stale observation is a genuine anomaly.
        assert!(matches!(
            scenario.after_op(&op, Ok(&observation), token, true),
            InterceptVerdict::Unexpected(_)
        ));

        // Updates get no such allowance.
        let update = update_op();
        let token = scenario.before_op(&update);
        let write = Observation::Write(WriteOutcome::default());
        assert!(matches!(
            scenario.after_op(&update, Ok(&write), token, false),
            InterceptVerdict::Unexpected(_)
        ));

        // Failing after the drop is what should happen.
        let err = StoreError::TableMissing("gone".to_string());
        assert_eq!(
            scenario.after_op(&op, Err(&err), token, false),
            InterceptVerdict::Expected
        );
    }

    #[test]
    fn watchdog_times_out_slow_drop() {
        use crate::args::{Consistency, Durability};
        use crate::store::{
            BatchOp, Direction, PartitionId, StoreKey, Value, ValueVersion, Version,
        };

        /// Store whose drop never returns in time.
        struct StuckStore;

        impl StoreClient for StuckStore {
            fn get(
                &self,
                _: StoreKey,
                _: Consistency,
                _: Duration,
            ) -> Result<Option<ValueVersion>, StoreError> {
                Ok(None)
            }
            fn multi_get(
                &self,
                _: u64,
                _: Consistency,
                _: Duration,
            ) -> Result<Vec<(StoreKey, ValueVersion)>, StoreError> {
                Ok(Vec::new())
            }
            fn multi_get_keys(
                &self,
                _: u64,
                _: Consistency,
                _: Duration,
            ) -> Result<Vec<StoreKey>, StoreError> {
                Ok(Vec::new())
            }
            fn multi_get_iterator<'a>(
                &'a self,
                _: u64,
                _: Consistency,
                _: Duration,
            ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError>
            {
                Ok(Box::new(std::iter::empty()))
            }
            fn put(
                &self,
                _: StoreKey,
                _: Value,
                _: Durability,
                _: Duration,
            ) -> Result<WriteOutcome, StoreError> {
                Ok(WriteOutcome::default())
            }
            fn put_if_absent(
                &self,
                _: StoreKey,
                _: Value,
                _: Durability,
                _: Duration,
            ) -> Result<WriteOutcome, StoreError> {
                Ok(WriteOutcome::default())
            }
            fn put_if_present(
                &self,
                _: StoreKey,
                _: Value,
                _: Durability,
                _: Duration,
            ) -> Result<WriteOutcome, StoreError> {
                Ok(WriteOutcome::default())
            }
            fn put_if_version(
                &self,
                _: StoreKey,
                _: Value,
                _: Version,
                _: Durability,
                _: Duration,
            ) -> Result<WriteOutcome, StoreError> {
                Ok(WriteOutcome::default())
            }
            fn delete(
                &self,
                _: StoreKey,
                _: Durability,
                _: Duration,
            ) -> Result<WriteOutcome, StoreError> {
                Ok(WriteOutcome::default())
            }
            fn delete_if_version(
                &self,
                _: StoreKey,
                _: Version,
                _: Durability,
                _: Duration,
            ) -> Result<WriteOutcome, StoreError> {
                Ok(WriteOutcome::default())
            }
            fn multi_delete(
                &self,
                _: StoreKey,
                _: Durability,
                _: Duration,
            ) -> Result<u64, StoreError> {
                Ok(0)
            }
            fn execute_batch(
                &self,
                _: Vec<BatchOp>,
                _: Durability,
                _: Duration,
            ) -> Result<Vec<WriteOutcome>, StoreError> {
                Ok(Vec::new())
            }
            fn store_iterator<'a>(
                &'a self,
                _: Direction,
                _: Consistency,
                _: usize,
                _: Duration,
            ) -> Result<Box<dyn Iterator<Item = (StoreKey, ValueVersion)> + 'a>, StoreError>
            {
                Ok(Box::new(std::iter::empty()))
            }
            fn partition_of(&self, _: StoreKey) -> PartitionId {
                PartitionId(0)
            }
            fn drop_table(&self, _: Duration) -> Result<(), StoreError> {
                thread::sleep(Duration::from_secs(30));
                Ok(())
            }
        }

        let scenario = DropTableScenario::new();
        let err = scenario
            .run_drop(
                Arc::new(StuckStore),
                Duration::from_secs(1),
                Duration::from_millis(50),
            )
            .expect_err("watchdog should fire");
        assert!(matches!(err, HarnessError::DropFailed(_)));
        assert_eq!(scenario.state(), DropState::Error);
        assert!(!scenario.succeeded());
    }
}
