//! Phase scheduling: populate, exercise, check, clean.
//!
//! A phase drives N worker threads over a contiguous index range split into
//! blocks of [`BLOCK_COUNT`] indices. Exercise pairs threads (`first_thread`
//! true/false) over the same range with a reusable barrier at every block
//! boundary, so both writers finish block k before either starts k+1 — that
//! bound is what keeps the two-candidate verification window sound.
//!
//! Worker threads check a stop flag between operations and between blocks;
//! in-flight operations always complete. A block that exceeds its timeout is
//! a hard failure (the store is deemed unresponsive), never a silent skip.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{error, info};

use crate::args::{Consistency, Durability};
use crate::error::HarnessError;
use crate::keynum::{BLOCK_COUNT, KeynumModel, TtlConfig, check_block_aligned};
use crate::ops::{Observation, OpContext, OpGenerator, Operation};
use crate::store::{Direction, PartitionId, StoreClient, StoreError};
use crate::verify::{PairProgress, Tallies, TallySnapshot, Verifier};

// ============================================================================
// Phase identity and state
// ============================================================================

/// The four test stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Populate,
    Exercise,
    Check,
    Clean,
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseName::Populate => "populate",
            PhaseName::Exercise => "exercise",
            PhaseName::Check => "check",
            PhaseName::Clean => "clean",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle of one phase on one harness instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Before,
    Active,
    Passed,
    Failed,
}

/// Atomic cell guarding single use of a phase.
#[derive(Debug)]
struct PhaseCell {
    state: AtomicU8,
}

impl PhaseCell {
    const BEFORE: u8 = 0;
    const ACTIVE: u8 = 1;
    const PASSED: u8 = 2;
    const FAILED: u8 = 3;

    fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::BEFORE),
        }
    }

    fn load(&self) -> PhaseState {
        match self.state.load(Ordering::Acquire) {
            Self::BEFORE => PhaseState::Before,
            Self::ACTIVE => PhaseState::Active,
            Self::PASSED => PhaseState::Passed,
            _ => PhaseState::Failed,
        }
    }

    /// Moves `Before -> Active`, rejecting reuse.
    fn try_begin(&self, phase: PhaseName) -> Result<(), HarnessError> {
        self.state
            .compare_exchange(
                Self::BEFORE,
                Self::ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| HarnessError::PhaseReuse {
                phase,
                state: self.load(),
            })
    }

    fn finish(&self, passed: bool) {
        let terminal = if passed { Self::PASSED } else { Self::FAILED };
        self.state.store(terminal, Ordering::Release);
    }
}

// ============================================================================
// Operation interceptor
// ============================================================================

/// Verdict an interceptor returns for one completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptVerdict {
    /// No opinion; run normal verification.
    Continue,
    /// The outcome is expected in the scenario; count it as a success.
    Expected,
    /// The outcome is a genuine anomaly.
    Unexpected(String),
    /// Re-execute once with absolute consistency, then ask again.
    RetryAbsolute,
}

/// Pluggable strategy called around every operation of a phase.
///
/// Scenarios that change what outcomes are "expected" (the drop-table race)
/// inject one of these instead of overriding scheduler behavior.
pub trait OpInterceptor: Send + Sync {
    /// Called at issuance; the returned token is handed back to
    /// [`Self::after_op`].
    fn before_op(&self, _op: &Operation) -> u64 {
        0
    }

    /// Called with the operation's result before normal verification.
    fn after_op(
        &self,
        _op: &Operation,
        _result: Result<&Observation, &StoreError>,
        _token: u64,
        _retried_absolute: bool,
    ) -> InterceptVerdict {
        InterceptVerdict::Continue
    }
}

/// Interceptor that never intervenes.
struct NoopInterceptor;

impl OpInterceptor for NoopInterceptor {}

/// Shared interceptors: a scenario driver usually keeps its own handle while
/// the harness holds another.
impl<T: OpInterceptor + ?Sized> OpInterceptor for std::sync::Arc<T> {
    fn before_op(&self, op: &Operation) -> u64 {
        (**self).before_op(op)
    }

    fn after_op(
        &self,
        op: &Operation,
        result: Result<&Observation, &StoreError>,
        token: u64,
        retried_absolute: bool,
    ) -> InterceptVerdict {
        (**self).after_op(op, result, token, retried_absolute)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a harness instance.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Process-wide seed; fixes all pseudo-randomness for the run.
    pub seed: i64,
    /// Percentage of exercise operations that are reads.
    pub read_percent: u8,
    /// Sampling percentage for the bulk-put path.
    pub bulk_put_percent: u8,
    /// Read-staleness policy for store reads.
    pub consistency: Consistency,
    /// Write-durability policy for store writes.
    pub durability: Durability,
    /// Per-operation store timeout.
    pub op_timeout: Duration,
    /// Hard limit for one block of operations.
    pub block_timeout: Duration,
    /// Transient-fault retries per operation.
    pub max_retries: u32,
    /// Sleep between retries.
    pub retry_backoff: Duration,
    /// Target total throughput, across all threads of a phase.
    pub throttle_ops_per_sec: Option<u64>,
    /// Synthetic TTL policy.
    pub ttl: TtlConfig,
    /// Restrict the run to keys in these partitions.
    pub partitions: Option<BTreeSet<PartitionId>>,
    /// Treat the store as already exercised when checking, even if the
    /// exercise phase did not run on this instance (cross-process runs).
    pub assume_exercised: bool,
    /// Progress log interval, in blocks.
    pub report_interval_blocks: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            read_percent: 50,
            bulk_put_percent: 0,
            consistency: Consistency::NoneRequired,
            durability: Durability::CommitNoSync,
            op_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(60),
            max_retries: 10,
            retry_backoff: Duration::from_millis(2),
            throttle_ops_per_sec: None,
            ttl: TtlConfig::default(),
            partitions: None,
            assume_exercised: false,
            report_interval_blocks: 64,
        }
    }
}

impl HarnessConfig {
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_read_percent(mut self, read_percent: u8) -> Self {
        self.read_percent = read_percent;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_throttle(mut self, ops_per_sec: u64) -> Self {
        self.throttle_ops_per_sec = Some(ops_per_sec);
        self
    }

    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_partitions(mut self, partitions: BTreeSet<PartitionId>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    fn validate(&self) -> Result<(), HarnessError> {
        if self.read_percent > 100 {
            return Err(HarnessError::config(format!(
                "read_percent {} out of range 0..=100",
                self.read_percent
            )));
        }
        if self.bulk_put_percent > 100 {
            return Err(HarnessError::config(format!(
                "bulk_put_percent {} out of range 0..=100",
                self.bulk_put_percent
            )));
        }
        if self.report_interval_blocks == 0 {
            return Err(HarnessError::config(
                "report_interval_blocks must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Phase report
// ============================================================================

/// Single end-of-phase summary: the only user-visible output of a phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: PhaseName,
    pub start: u64,
    pub count: u64,
    pub threads: usize,
    pub elapsed_secs: f64,
    pub tallies: TallySnapshot,
    pub passed: bool,
}

impl PhaseReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}..{}) {}: {} ok, {} failed, {} unexpected results, {} unexpected exceptions ({:.2}s)",
            self.phase,
            self.start,
            self.start + self.count,
            if self.passed { "PASSED" } else { "FAILED" },
            self.tallies.succeeded,
            self.tallies.failed,
            self.tallies.unexpected_results,
            self.tallies.unexpected_exceptions,
            self.elapsed_secs,
        )
    }
}

// ============================================================================
// Throttle
// ============================================================================

/// Sleep-pacing to a per-thread ops/sec share.
struct Throttle {
    interval: Option<Duration>,
    next: Instant,
}

impl Throttle {
    fn new(total_ops_per_sec: Option<u64>, threads: usize) -> Self {
        let interval = total_ops_per_sec.map(|total| {
            let per_thread = (total as f64 / threads as f64).max(1.0);
            Duration::from_secs_f64(1.0 / per_thread)
        });
        Self {
            interval,
            next: Instant::now(),
        }
    }

    fn pace(&mut self) {
        if let Some(interval) = self.interval {
            let now = Instant::now();
            if now < self.next {
                std::thread::sleep(self.next - now);
            }
            self.next += interval;
        }
    }
}

// ============================================================================
// Pair synchronization
// ============================================================================

/// Shared state for one exercise thread pair.
struct PairSync {
    barrier: Barrier,
    progress: PairProgress,
    /// Set before the barrier when either thread wants to stop, so both
    /// observe the same decision after it.
    halt: AtomicBool,
}

impl PairSync {
    fn new(chunk_start: u64) -> Self {
        Self {
            barrier: Barrier::new(2),
            progress: PairProgress::new(chunk_start),
            halt: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// The phase-driving harness over an injected store client.
pub struct Harness<S: StoreClient> {
    store: S,
    config: HarnessConfig,
    model: KeynumModel,
    tallies: Tallies,
    stop: AtomicBool,
    blocks_done: AtomicU64,
    populate_cell: PhaseCell,
    exercise_cell: PhaseCell,
    check_cell: PhaseCell,
    clean_cell: PhaseCell,
    interceptor: Box<dyn OpInterceptor>,
}

impl<S: StoreClient> Harness<S> {
    /// Builds a harness. Fails fast on invalid configuration or cipher
    /// construction.
    pub fn new(store: S, config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let model = KeynumModel::new(config.seed, config.ttl)?;
        Ok(Self {
            store,
            config,
            model,
            tallies: Tallies::default(),
            stop: AtomicBool::new(false),
            blocks_done: AtomicU64::new(0),
            populate_cell: PhaseCell::new(),
            exercise_cell: PhaseCell::new(),
            check_cell: PhaseCell::new(),
            clean_cell: PhaseCell::new(),
            interceptor: Box::new(NoopInterceptor),
        })
    }

    /// Installs an operation interceptor (e.g. the drop-table scenario).
    pub fn with_interceptor(mut self, interceptor: Box<dyn OpInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn model(&self) -> &KeynumModel {
        &self.model
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn tallies(&self) -> TallySnapshot {
        self.tallies.snapshot()
    }

    /// Requests a cooperative stop; in-flight operations complete first.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn phase_state(&self, phase: PhaseName) -> PhaseState {
        self.cell(phase).load()
    }

    fn cell(&self, phase: PhaseName) -> &PhaseCell {
        match phase {
            PhaseName::Populate => &self.populate_cell,
            PhaseName::Exercise => &self.exercise_cell,
            PhaseName::Check => &self.check_cell,
            PhaseName::Clean => &self.clean_cell,
        }
    }

    fn base_ctx(&self) -> OpContext {
        OpContext {
            consistency: self.config.consistency,
            durability: self.config.durability,
            timeout: self.config.op_timeout,
            retrying: false,
            absolute_override: false,
        }
    }

    fn thread_rng(&self, phase: PhaseName, thread: usize) -> StdRng {
        let salt = match phase {
            PhaseName::Populate => 0x01u64,
            PhaseName::Exercise => 0x02,
            PhaseName::Check => 0x03,
            PhaseName::Clean => 0x04,
        };
        StdRng::seed_from_u64(
            (self.config.seed as u64)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .rotate_left(17)
                ^ (salt << 56)
                ^ ((thread as u64) << 32),
        )
    }

    fn in_partitions(&self, keynum: u64) -> bool {
        match &self.config.partitions {
            Some(partitions) => self
                .model
                .keynum_in_partitions(keynum, &self.store, partitions),
            None => true,
        }
    }

    /// Retries transient faults up to the configured budget.
    ///
    /// Returns the observation plus whether any retry happened, so the
    /// verifier can widen its window accordingly.
    fn execute_with_retry(
        &self,
        op: &Operation,
        mut ctx: OpContext,
    ) -> Result<(Observation, bool), StoreError> {
        let mut attempt = 0u32;
        loop {
            ctx.retrying = attempt > 0;
            match op.execute(&self.store, &self.model, &ctx) {
                Ok(observation) => return Ok((observation, ctx.retrying)),
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    std::thread::sleep(self.config.retry_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn note_block_done(&self, phase: PhaseName, total_blocks: u64) {
        let done = self.blocks_done.fetch_add(1, Ordering::AcqRel) + 1;
        if done % self.config.report_interval_blocks == 0 || done == total_blocks {
            let tallies = self.tallies.snapshot();
            info!(
                phase = %phase,
                blocks_done = done,
                total_blocks,
                succeeded = tallies.succeeded,
                unexpected_results = tallies.unexpected_results,
                "progress"
            );
        }
    }

    fn check_block_timeout(&self, phase: PhaseName, block_start: u64, began: Instant) {
        if began.elapsed() > self.config.block_timeout {
            self.tallies.block_timeouts.fetch_add(1, Ordering::Relaxed);
            error!(
                phase = %phase,
                block_start,
                elapsed_ms = began.elapsed().as_millis() as u64,
                "block exceeded timeout; store deemed unresponsive"
            );
            self.request_stop();
        }
    }

    fn begin_phase(
        &self,
        phase: PhaseName,
        start: i64,
        count: i64,
        threads: usize,
    ) -> Result<(u64, u64, TallySnapshot), HarnessError> {
        if threads == 0 {
            return Err(HarnessError::config("thread count must be at least 1"));
        }
        let (start, count) = check_block_aligned(start, count)?;
        self.cell(phase).try_begin(phase)?;
        self.blocks_done.store(0, Ordering::Release);
        Ok((start, count, self.tallies.snapshot()))
    }

    fn finish_phase(
        &self,
        phase: PhaseName,
        start: u64,
        count: u64,
        threads: usize,
        before: TallySnapshot,
        began: Instant,
    ) -> PhaseReport {
        let tallies = self.tallies.snapshot().since(&before);
        let passed = tallies.clean();
        self.cell(phase).finish(passed);
        let report = PhaseReport {
            phase,
            start,
            count,
            threads,
            elapsed_secs: began.elapsed().as_secs_f64(),
            tallies,
            passed,
        };
        info!(phase = %phase, passed, "{report}");
        report
    }

    // ------------------------------------------------------------------------
    // Populate
    // ------------------------------------------------------------------------

    /// Writes the baseline value for every index in `[start, start + count)`.
    pub fn populate(
        &self,
        start: i64,
        count: i64,
        threads: usize,
    ) -> Result<PhaseReport, HarnessError> {
        let phase = PhaseName::Populate;
        let (start, count, before) = self.begin_phase(phase, start, count, threads)?;
        let began = Instant::now();

        self.run_simple_phase(phase, start, count, threads, |verifier, op, index| {
            match self.execute_with_retry(op, self.base_ctx()) {
                Ok((Observation::Write(outcome), retried)) => {
                    let valid = match (&outcome.previous, retried) {
                        (None, _) => outcome.success,
                        (Some(prev), true) => prev.value == self.model.populate_value(index),
                        (Some(_), false) => false,
                    };
                    verifier.record(op, valid, "populate put");
                }
                Ok(_) => verifier.record(op, false, "populate returned a non-write result"),
                Err(err) => {
                    verifier.record_exception(index, true, &err.to_string());
                    return false;
                }
            }
            true
        });

        Ok(self.finish_phase(phase, start, count, threads, before, began))
    }

    // ------------------------------------------------------------------------
    // Exercise
    // ------------------------------------------------------------------------

    /// Runs paired racing writers over `[start, start + count)`.
    ///
    /// `pairs` thread pairs are spawned; each pair's two threads cover the
    /// same sub-range with roles `first_thread` true/false, synchronized at
    /// block boundaries.
    pub fn exercise(
        &self,
        start: i64,
        count: i64,
        pairs: usize,
    ) -> Result<PhaseReport, HarnessError> {
        let phase = PhaseName::Exercise;
        let (start, count, before) = self.begin_phase(phase, start, count, pairs)?;
        let began = Instant::now();
        let total_blocks = count / BLOCK_COUNT;

        let chunks = split_blocks(start, count, pairs);
        let pair_sync: Vec<PairSync> = chunks
            .iter()
            .map(|(chunk_start, _)| PairSync::new(*chunk_start))
            .collect();

        std::thread::scope(|scope| {
            for (pair, (chunk_start, chunk_count)) in chunks.iter().copied().enumerate() {
                let sync = &pair_sync[pair];
                for first_thread in [true, false] {
                    scope.spawn(move || {
                        self.exercise_worker(
                            pair,
                            pairs,
                            first_thread,
                            chunk_start,
                            chunk_count,
                            sync,
                            total_blocks,
                        );
                    });
                }
            }
        });

        Ok(self.finish_phase(phase, start, count, pairs, before, began))
    }

    fn exercise_worker(
        &self,
        pair: usize,
        pairs: usize,
        first_thread: bool,
        start: u64,
        count: u64,
        sync: &PairSync,
        total_blocks: u64,
    ) {
        let phase = PhaseName::Exercise;
        let verifier = Verifier::new(
            &self.model,
            self.config.read_percent,
            self.config.consistency,
            &self.tallies,
        );
        let generator = OpGenerator::new(
            &self.model,
            self.config.read_percent,
            self.config.bulk_put_percent,
        );
        let thread_id = pair * 2 + usize::from(!first_thread);
        let mut rng = self.thread_rng(phase, thread_id);
        let mut throttle = Throttle::new(self.config.throttle_ops_per_sec, pairs * 2);
        // Set when this thread hits an unexpected exception; it stops
        // executing but keeps joining barriers so its partner can finish.
        let mut dead = false;

        let mut block_start = start;
        while block_start < start + count {
            let began = Instant::now();
            for index in block_start..block_start + BLOCK_COUNT {
                if dead || self.stop_requested() {
                    break;
                }
                let op = generator.exercise_op(index, first_thread, &mut rng);
                if !self.in_partitions(op.keynum) {
                    sync.progress.record_done(first_thread, index);
                    continue;
                }

                self.run_exercise_op(&op, &verifier, &sync.progress, &mut dead);
                sync.progress.record_done(first_thread, index);
                throttle.pace();
            }

            self.check_block_timeout(phase, block_start, began);
            // The halt decision must be made before the barrier so both
            // threads of the pair observe the same answer after it; a
            // unilateral exit would strand the partner at the next barrier.
            if self.stop_requested() {
                sync.halt.store(true, Ordering::Release);
            }
            sync.barrier.wait();
            if first_thread {
                self.note_block_done(phase, total_blocks);
            }
            if sync.halt.load(Ordering::Acquire) {
                break;
            }
            block_start += BLOCK_COUNT;
        }
    }

    fn run_exercise_op(
        &self,
        op: &Operation,
        verifier: &Verifier<'_>,
        progress: &PairProgress,
        dead: &mut bool,
    ) {
        let token = self.interceptor.before_op(op);
        // Sampled before the op executes: progress published by then is
        // guaranteed to precede this operation, so it may legally shrink the
        // acceptance window. Later progress may not.
        let partner_next = progress.partner_next(op.first_thread);
        let mut retried_absolute = false;
        let mut result = self.execute_with_retry(op, self.base_ctx());

        loop {
            let verdict = self.interceptor.after_op(
                op,
                result.as_ref().map(|(observation, _)| observation),
                token,
                retried_absolute,
            );
            match verdict {
                InterceptVerdict::RetryAbsolute if !retried_absolute => {
                    retried_absolute = true;
                    let ctx = OpContext {
                        absolute_override: true,
                        retrying: true,
                        ..self.base_ctx()
                    };
                    result = self.execute_with_retry(op, ctx);
                    continue;
                }
                InterceptVerdict::RetryAbsolute | InterceptVerdict::Expected => {
                    self.tallies.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                InterceptVerdict::Unexpected(detail) => {
                    verifier.record_unexpected(op.index, op.first_thread, op.keynum, &detail);
                }
                InterceptVerdict::Continue => {
                    match &result {
                        Ok((Observation::Value { found }, _)) => {
                            let valid =
                                verifier.verify_exercise_read(op, found.as_ref(), partner_next);
                            verifier.record(op, valid, "exercise read value");
                        }
                        Ok((Observation::Present { present }, _)) => {
                            let valid = verifier.verify_exercise_present(op, *present);
                            verifier.record(op, valid, "exercise key-present check");
                        }
                        Ok((Observation::Write(outcome), retried)) => {
                            let valid = verifier.verify_exercise_update(
                                op,
                                outcome,
                                partner_next,
                                *retried,
                            );
                            verifier.record(op, valid, "exercise update outcome");
                        }
                        Err(err) => {
                            verifier.record_exception(
                                op.index,
                                op.first_thread,
                                &err.to_string(),
                            );
                            *dead = true;
                        }
                    }
                }
            }
            break;
        }
    }

    // ------------------------------------------------------------------------
    // Check
    // ------------------------------------------------------------------------

    /// Reads and verifies every index in `[start, start + count)`.
    pub fn check(
        &self,
        start: i64,
        count: i64,
        threads: usize,
    ) -> Result<PhaseReport, HarnessError> {
        let phase = PhaseName::Check;
        let (start, count, before) = self.begin_phase(phase, start, count, threads)?;
        let began = Instant::now();
        let exercised =
            self.config.assume_exercised || self.exercise_cell.load() != PhaseState::Before;

        self.run_simple_phase(phase, start, count, threads, |verifier, op, index| {
            match self.execute_with_retry(op, self.base_ctx()) {
                Ok((Observation::Value { found }, _)) => {
                    let valid = verifier.verify_final_value(op.keynum, found.as_ref(), exercised);
                    verifier.record(op, valid, "check read");
                }
                Ok(_) => verifier.record(op, false, "check returned a non-value result"),
                Err(err) => {
                    verifier.record_exception(index, true, &err.to_string());
                    return false;
                }
            }
            true
        });

        Ok(self.finish_phase(phase, start, count, threads, before, began))
    }

    // ------------------------------------------------------------------------
    // Clean
    // ------------------------------------------------------------------------

    /// Deletes every index in `[start, start + count)`, verifying the
    /// previous values, then scans the store to confirm extinction.
    pub fn clean(
        &self,
        start: i64,
        count: i64,
        threads: usize,
    ) -> Result<PhaseReport, HarnessError> {
        let phase = PhaseName::Clean;
        let (start, count, before) = self.begin_phase(phase, start, count, threads)?;
        let began = Instant::now();
        let exercised =
            self.config.assume_exercised || self.exercise_cell.load() != PhaseState::Before;

        self.run_simple_phase(phase, start, count, threads, |verifier, op, index| {
            match self.execute_with_retry(op, self.base_ctx()) {
                Ok((Observation::Write(outcome), retried)) => {
                    let previous = outcome.previous.as_ref();
                    let valid = if previous.is_none() && retried {
                        // Our own earlier attempt may have removed it.
                        true
                    } else {
                        verifier.verify_final_value(op.keynum, previous, exercised)
                    };
                    verifier.record(op, valid, "clean delete previous value");
                }
                Ok(_) => verifier.record(op, false, "clean returned a non-write result"),
                Err(err) => {
                    verifier.record_exception(index, true, &err.to_string());
                    return false;
                }
            }
            true
        });

        if !self.stop_requested() {
            self.scan_for_survivors(start, count);
        }

        Ok(self.finish_phase(phase, start, count, threads, before, began))
    }

    /// Extinction scan: any record still present in the cleaned range is an
    /// unexpected result.
    fn scan_for_survivors(&self, start: u64, count: u64) {
        let verifier = Verifier::new(
            &self.model,
            self.config.read_percent,
            self.config.consistency,
            &self.tallies,
        );
        let iter = self.store.store_iterator(
            Direction::Forward,
            Consistency::Absolute,
            1024,
            self.config.op_timeout,
        );
        match iter {
            Ok(entries) => {
                for (key, vv) in entries {
                    let keynum = self.model.key_to_keynum(key);
                    let index = self.model.raw_keynum_to_index(keynum);
                    if (start..start + count).contains(&index) && self.in_partitions(keynum) {
                        let detail = match crate::keynum::decode_value(&vv.value) {
                            Some((tag, written_at, _)) => format!(
                                "record survived clean extinction scan (tag {tag:#04x}, written at index {written_at})"
                            ),
                            None => "record survived clean extinction scan (foreign value)"
                                .to_string(),
                        };
                        verifier.record_unexpected(index, true, keynum, &detail);
                    }
                }
            }
            Err(err) => {
                verifier.record_exception(start, true, &format!("extinction scan failed: {err}"));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shared worker loop for the unpaired phases
    // ------------------------------------------------------------------------

    fn run_simple_phase<F>(
        &self,
        phase: PhaseName,
        start: u64,
        count: u64,
        threads: usize,
        per_index: F,
    ) where
        F: Fn(&Verifier<'_>, &Operation, u64) -> bool + Sync,
    {
        let total_blocks = count / BLOCK_COUNT;
        let chunks = split_blocks(start, count, threads);
        let per_index = &per_index;

        std::thread::scope(|scope| {
            for (chunk_start, chunk_count) in chunks.iter().copied() {
                scope.spawn(move || {
                    let verifier = Verifier::new(
                        &self.model,
                        self.config.read_percent,
                        self.config.consistency,
                        &self.tallies,
                    );
                    let generator = OpGenerator::new(
                        &self.model,
                        self.config.read_percent,
                        self.config.bulk_put_percent,
                    );
                    let mut throttle =
                        Throttle::new(self.config.throttle_ops_per_sec, threads);

                    let mut block_start = chunk_start;
                    'blocks: while block_start < chunk_start + chunk_count {
                        let began = Instant::now();
                        for index in block_start..block_start + BLOCK_COUNT {
                            if self.stop_requested() {
                                break 'blocks;
                            }
                            // A record whose synthetic TTL has already lapsed
                            // is never written; check later verifies absence.
                            if phase == PhaseName::Populate && self.model.is_expired(index) {
                                continue;
                            }
                            let op = match phase {
                                PhaseName::Populate => generator.populate_op(index),
                                PhaseName::Check => generator.check_op(index),
                                PhaseName::Clean => generator.clean_op(index),
                                PhaseName::Exercise => unreachable!("exercise uses paired workers"),
                            };
                            if !self.in_partitions(op.keynum) {
                                continue;
                            }
                            if !per_index(&verifier, &op, index) {
                                break 'blocks;
                            }
                            throttle.pace();
                        }
                        self.check_block_timeout(phase, block_start, began);
                        self.note_block_done(phase, total_blocks);
                        block_start += BLOCK_COUNT;
                    }
                });
            }
        });
    }
}

// ============================================================================
// Range splitting
// ============================================================================

/// Splits a block-aligned range into per-thread contiguous block-aligned
/// chunks. Threads beyond the block count get empty chunks.
fn split_blocks(start: u64, count: u64, threads: usize) -> Vec<(u64, u64)> {
    let blocks = count / BLOCK_COUNT;
    let threads_u64 = threads as u64;
    let base = blocks / threads_u64;
    let remainder = blocks % threads_u64;

    let mut chunks = Vec::with_capacity(threads);
    let mut next = start;
    for thread in 0..threads_u64 {
        let chunk_blocks = base + u64::from(thread < remainder);
        chunks.push((next, chunk_blocks * BLOCK_COUNT));
        next += chunk_blocks * BLOCK_COUNT;
    }
    chunks
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_blocks_covers_range_contiguously() {
        let chunks = split_blocks(0, 10 * BLOCK_COUNT, 3);
        assert_eq!(chunks.len(), 3);
        let mut next = 0;
        for (chunk_start, chunk_count) in &chunks {
            assert_eq!(*chunk_start, next);
            assert_eq!(chunk_count % BLOCK_COUNT, 0);
            next += chunk_count;
        }
        assert_eq!(next, 10 * BLOCK_COUNT);
        // First threads absorb the remainder blocks.
        assert_eq!(chunks[0].1, 4 * BLOCK_COUNT);
        assert_eq!(chunks[1].1, 3 * BLOCK_COUNT);
    }

    #[test]
    fn split_blocks_with_more_threads_than_blocks() {
        let chunks = split_blocks(64, BLOCK_COUNT, 4);
        assert_eq!(chunks[0], (64, BLOCK_COUNT));
        assert!(chunks[1..].iter().all(|(_, count)| *count == 0));
    }

    #[test]
    fn phase_cell_single_use() {
        let cell = PhaseCell::new();
        assert_eq!(cell.load(), PhaseState::Before);
        cell.try_begin(PhaseName::Populate).expect("first begin");
        let err = cell.try_begin(PhaseName::Populate).expect_err("reuse");
        assert!(matches!(
            err,
            HarnessError::PhaseReuse {
                phase: PhaseName::Populate,
                state: PhaseState::Active
            }
        ));
        cell.finish(true);
        assert_eq!(cell.load(), PhaseState::Passed);
        assert!(cell.try_begin(PhaseName::Populate).is_err());
    }

    #[test]
    fn throttle_paces_to_target() {
        let mut throttle = Throttle::new(Some(2000), 2);
        let began = Instant::now();
        for _ in 0..10 {
            throttle.pace();
        }
        // 10 ops at 1000 ops/sec/thread needs ~9ms of pacing.
        assert!(began.elapsed() >= Duration::from_millis(8));
    }

    #[test]
    fn throttle_disabled_does_not_sleep() {
        let mut throttle = Throttle::new(None, 4);
        let began = Instant::now();
        for _ in 0..1000 {
            throttle.pace();
        }
        assert!(began.elapsed() < Duration::from_millis(50));
    }
}
