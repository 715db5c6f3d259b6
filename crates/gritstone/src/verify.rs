//! Two-candidate result verification.
//!
//! Two writer threads race over the same keynum space during exercise, so an
//! observation can rarely be checked against a single expected value.
//! Instead the verifier recomputes, from the model alone, every state the
//! record could legally be in:
//!
//! - the populate-time baseline (or absence, when the synthetic TTL expired),
//! - the first writer's update at its index for the keynum, if that slot is
//!   an update,
//! - the second writer's update likewise.
//!
//! The partner thread's progress counter can *shrink* this window in exactly
//! one case: an absolute-consistency read made after the partner completed an
//! unconditional overwrite cannot legally observe the baseline any more.
//! Because the counter is monotonic and read with acquire ordering, a stale
//! read only under-reports progress — it widens the window back toward the
//! baseline, never narrows it below correctness.
//!
//! Mismatches are tallied and logged up to a cap; they never stop other
//! threads. The phase verdict at the end is simply "no unexpected results
//! and no unexpected exceptions".

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::warn;

use crate::args::Consistency;
use crate::keynum::KeynumModel;
use crate::ops::{Operation, UpdateKind};
use crate::store::{Value, ValueVersion, WriteOutcome};

/// Cap on individually logged mismatches, to bound log volume.
pub const MAX_REPORTED: u64 = 20;

// ============================================================================
// Tallies
// ============================================================================

/// Shared per-phase counters. Mutated by any worker thread, read at phase end.
#[derive(Debug, Default)]
pub struct Tallies {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub unexpected_results: AtomicU64,
    pub unexpected_exceptions: AtomicU64,
    pub block_timeouts: AtomicU64,
    /// Mismatches logged so far (capped at [`MAX_REPORTED`]); not part of
    /// the snapshot.
    reported: AtomicU64,
}

/// Point-in-time copy of the tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub unexpected_results: u64,
    pub unexpected_exceptions: u64,
    pub block_timeouts: u64,
}

impl Tallies {
    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            succeeded: self.succeeded.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            unexpected_results: self.unexpected_results.load(Ordering::Acquire),
            unexpected_exceptions: self.unexpected_exceptions.load(Ordering::Acquire),
            block_timeouts: self.block_timeouts.load(Ordering::Acquire),
        }
    }
}

impl TallySnapshot {
    /// Counter deltas since `earlier`.
    pub fn since(&self, earlier: &TallySnapshot) -> TallySnapshot {
        TallySnapshot {
            succeeded: self.succeeded - earlier.succeeded,
            failed: self.failed - earlier.failed,
            unexpected_results: self.unexpected_results - earlier.unexpected_results,
            unexpected_exceptions: self.unexpected_exceptions - earlier.unexpected_exceptions,
            block_timeouts: self.block_timeouts - earlier.block_timeouts,
        }
    }

    /// The phase verdict: nothing unexpected, nothing failed.
    pub fn clean(&self) -> bool {
        self.failed == 0
            && self.unexpected_results == 0
            && self.unexpected_exceptions == 0
            && self.block_timeouts == 0
    }
}

// ============================================================================
// Pair progress
// ============================================================================

/// The one cross-thread data dependency: each writer publishes the index it
/// has completed, and its partner reads it during verification.
#[derive(Debug)]
pub struct PairProgress {
    first_next: AtomicU64,
    second_next: AtomicU64,
}

impl PairProgress {
    /// Both roles start with nothing completed before `start`.
    pub fn new(start: u64) -> Self {
        Self {
            first_next: AtomicU64::new(start),
            second_next: AtomicU64::new(start),
        }
    }

    /// Publishes that `index` has completed for a role.
    pub fn record_done(&self, first_thread: bool, index: u64) {
        let cell = if first_thread {
            &self.first_next
        } else {
            &self.second_next
        };
        cell.store(index + 1, Ordering::Release);
    }

    /// The partner role's next-unfinished index.
    pub fn partner_next(&self, first_thread: bool) -> u64 {
        let cell = if first_thread {
            &self.second_next
        } else {
            &self.first_next
        };
        cell.load(Ordering::Acquire)
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// One legal end state a writer role could leave a record in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Written(Value),
    Deleted,
}

/// Every state a record could legally be in, recomputed from the model.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Populate-time value; `None` when the synthetic TTL has expired.
    pub baseline: Option<Value>,
    /// First writer's update, when its slot for this keynum is an update.
    pub first: Option<Candidate>,
    /// Second writer's update likewise.
    pub second: Option<Candidate>,
}

impl CandidateSet {
    fn role(&self, first_thread: bool) -> Option<&Candidate> {
        if first_thread {
            self.first.as_ref()
        } else {
            self.second.as_ref()
        }
    }

    /// Whether any included candidate deletes the record.
    fn any_delete(&self) -> bool {
        matches!(self.first, Some(Candidate::Deleted))
            || matches!(self.second, Some(Candidate::Deleted))
    }

    /// Whether `value` matches any included written candidate.
    fn matches_written(&self, value: &[u8]) -> bool {
        [&self.first, &self.second].into_iter().any(|candidate| {
            matches!(candidate, Some(Candidate::Written(expected)) if expected == value)
        })
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Decides whether observations are consistent with the deterministic model.
pub struct Verifier<'a> {
    model: &'a KeynumModel,
    read_percent: u8,
    consistency: Consistency,
    tallies: &'a Tallies,
}

impl<'a> Verifier<'a> {
    pub fn new(
        model: &'a KeynumModel,
        read_percent: u8,
        consistency: Consistency,
        tallies: &'a Tallies,
    ) -> Self {
        Self {
            model,
            read_percent,
            consistency,
            tallies,
        }
    }

    /// Recomputes the candidate states for a keynum.
    pub fn candidates(&self, keynum: u64) -> CandidateSet {
        let raw = self.model.raw_keynum_to_index(keynum);
        let baseline = if self.model.is_expired(raw) {
            None
        } else {
            Some(self.model.populate_value(raw))
        };
        let kind = UpdateKind::at(keynum);

        let per_role = |first_thread: bool| {
            let index = self.model.role_index(raw, first_thread);
            if self.model.is_read_op(index, first_thread, self.read_percent) {
                None
            } else if kind.is_delete() {
                Some(Candidate::Deleted)
            } else {
                Some(Candidate::Written(
                    self.model.exercise_value(index, first_thread),
                ))
            }
        };

        CandidateSet {
            baseline,
            first: per_role(true),
            second: per_role(false),
        }
    }

    /// Whether the baseline is still an acceptable observation for a reader
    /// in role `first_thread`, given the partner's published progress.
    ///
    /// Only an absolute-consistency read that provably follows the partner's
    /// unconditional overwrite may reject the baseline. A stale (lower)
    /// `partner_next` keeps the baseline acceptable — widening, never
    /// narrowing.
    fn baseline_acceptable(&self, keynum: u64, first_thread: bool, partner_next: u64) -> bool {
        if self.consistency != Consistency::Absolute {
            return true;
        }
        let raw = self.model.raw_keynum_to_index(keynum);
        let partner_index = self.model.role_index(raw, !first_thread);
        let partner_is_update =
            !self.model.is_read_op(partner_index, !first_thread, self.read_percent);
        let partner_overwrites =
            partner_is_update && UpdateKind::at(keynum).is_unconditional_put();
        !(partner_overwrites && partner_next > partner_index)
    }

    /// Verifies a value observed by an exercise read.
    pub fn verify_exercise_read(
        &self,
        op: &Operation,
        found: Option<&ValueVersion>,
        partner_next: u64,
    ) -> bool {
        let set = self.candidates(op.keynum);
        match found {
            Some(vv) => {
                if let Some(Candidate::Written(expected)) = set.role(!op.first_thread) {
                    if *expected == vv.value {
                        return true;
                    }
                }
                set.baseline.as_deref() == Some(vv.value.as_slice())
                    && self.baseline_acceptable(op.keynum, op.first_thread, partner_next)
            }
            None => {
                set.baseline.is_none()
                    || matches!(set.role(!op.first_thread), Some(Candidate::Deleted))
            }
        }
    }

    /// Verifies a key-present observation during exercise.
    pub fn verify_exercise_present(&self, op: &Operation, present: bool) -> bool {
        let set = self.candidates(op.keynum);
        if present {
            // Present is legal whenever anything could have written it.
            set.baseline.is_some()
                || matches!(set.first, Some(Candidate::Written(_)))
                || matches!(set.second, Some(Candidate::Written(_)))
        } else {
            set.baseline.is_none() || set.any_delete()
        }
    }

    /// Verifies the normalized outcome of an exercise update.
    pub fn verify_exercise_update(
        &self,
        op: &Operation,
        outcome: &WriteOutcome,
        partner_next: u64,
        retrying: bool,
    ) -> bool {
        let kind = UpdateKind::at(op.keynum);
        if kind == UpdateKind::MultiDelete {
            // Count-only primitive: the partner may already have removed the
            // record, so either count is legal and there is no previous value
            // to compare.
            return true;
        }

        let set = self.candidates(op.keynum);
        let my_value = self.model.exercise_value(op.index, op.first_thread);

        // Conditional kinds must report a coherent (success, previous) pair.
        let coherent = match kind {
            UpdateKind::PutIfAbsent => outcome.success == outcome.previous.is_none(),
            UpdateKind::PutIfPresent => !outcome.success || outcome.previous.is_some(),
            _ => true,
        };
        if !coherent {
            return false;
        }

        // The window for the pre-existing value: the partner's write, the
        // baseline, or — only on a retry — our own earlier attempt. A record
        // this thread has not written yet can never already hold its value.
        match &outcome.previous {
            Some(prev) => {
                if retrying && prev.value == my_value {
                    // An earlier identical attempt already landed.
                    return true;
                }
                if matches!(
                    set.role(!op.first_thread),
                    Some(Candidate::Written(expected)) if *expected == prev.value
                ) {
                    return true;
                }
                set.baseline.as_deref() == Some(prev.value.as_slice())
                    && self.baseline_acceptable(op.keynum, op.first_thread, partner_next)
            }
            None => {
                // Absence before this write is legal if the record expired,
                // the partner deletes it, or our own earlier retry removed it.
                set.baseline.is_none()
                    || matches!(set.role(!op.first_thread), Some(Candidate::Deleted))
                    || (retrying && kind.is_delete())
            }
        }
    }

    /// Verifies a value observed after exercise completed (check phase), or
    /// before it ran (`exercised == false`).
    pub fn verify_final_value(
        &self,
        keynum: u64,
        found: Option<&ValueVersion>,
        exercised: bool,
    ) -> bool {
        let set = self.candidates(keynum);
        match found {
            Some(vv) => {
                if set.baseline.as_deref() == Some(vv.value.as_slice()) {
                    return true;
                }
                exercised && set.matches_written(&vv.value)
            }
            None => {
                if set.baseline.is_none() {
                    return true;
                }
                exercised && set.any_delete()
            }
        }
    }

    /// Key-present form of [`Self::verify_final_value`].
    pub fn verify_final_present(&self, keynum: u64, present: bool, exercised: bool) -> bool {
        let set = self.candidates(keynum);
        if present {
            set.baseline.is_some()
                || (exercised
                    && (matches!(set.first, Some(Candidate::Written(_)))
                        || matches!(set.second, Some(Candidate::Written(_)))))
        } else {
            set.baseline.is_none() || (exercised && set.any_delete())
        }
    }

    // ------------------------------------------------------------------------
    // Tallying
    // ------------------------------------------------------------------------

    /// Records an operation's verification verdict.
    pub fn record(&self, op: &Operation, valid: bool, detail: &str) {
        if valid {
            self.tallies.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.record_unexpected(op.index, op.first_thread, op.keynum, detail);
        }
    }

    /// Tallies an unexpected result, logging up to the cap.
    pub fn record_unexpected(&self, index: u64, first_thread: bool, keynum: u64, detail: &str) {
        self.tallies
            .unexpected_results
            .fetch_add(1, Ordering::Relaxed);
        if self.tallies.reported.fetch_add(1, Ordering::Relaxed) < MAX_REPORTED {
            warn!(index, first_thread, keynum, detail, "unexpected result");
        }
    }

    /// Tallies an unexpected exception, logging up to the cap.
    pub fn record_exception(&self, index: u64, first_thread: bool, detail: &str) {
        self.tallies
            .unexpected_exceptions
            .fetch_add(1, Ordering::Relaxed);
        if self.tallies.reported.fetch_add(1, Ordering::Relaxed) < MAX_REPORTED {
            warn!(index, first_thread, detail, "unexpected exception");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keynum::TtlConfig;
    use crate::ops::{OpGenerator, OpKind, ReadKind};
    use crate::store::Version;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model() -> KeynumModel {
        KeynumModel::new(42, TtlConfig::default()).expect("model")
    }

    fn vv(value: Value) -> ValueVersion {
        ValueVersion {
            value,
            version: Version(1),
        }
    }

    /// Finds an index whose keynum schedules the given predicate on kinds,
    /// with both roles updating (read_percent = 0 guarantees that).
    fn index_with_kind(m: &KeynumModel, want: impl Fn(UpdateKind) -> bool) -> u64 {
        (0..1000u64)
            .find(|&i| want(UpdateKind::at(m.exercise_index_to_keynum(i, true))))
            .expect("kind present in range")
    }

    fn read_op(m: &KeynumModel, index: u64, first_thread: bool) -> Operation {
        Operation {
            index,
            first_thread,
            keynum: m.exercise_index_to_keynum(index, first_thread),
            kind: OpKind::Read(ReadKind::Get),
            value: None,
        }
    }

    #[test]
    fn read_accepts_either_writer_or_baseline() {
        let m = model();
        let tallies = Tallies::default();
        // read_percent 0: both roles update every slot.
        let verifier = Verifier::new(&m, 0, Consistency::NoneRequired, &tallies);

        let index = index_with_kind(&m, |k| k == UpdateKind::Put);
        let op = read_op(&m, index, true);
        let raw = m.raw_keynum_to_index(op.keynum);
        let partner_index = m.role_index(raw, false);

        let baseline = m.populate_value(raw);
        let partner_value = m.exercise_value(partner_index, false);

        assert!(verifier.verify_exercise_read(&op, Some(&vv(baseline)), 0));
        assert!(verifier.verify_exercise_read(&op, Some(&vv(partner_value)), 0));
        assert!(!verifier.verify_exercise_read(&op, Some(&vv(b"garbage".to_vec())), 0));
        // Populate wrote it and nobody deletes it: absence is a mismatch.
        assert!(!verifier.verify_exercise_read(&op, None, 0));
    }

    #[test]
    fn absolute_read_rejects_baseline_after_partner_overwrite() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::Absolute, &tallies);

        let index = index_with_kind(&m, |k| k == UpdateKind::Put);
        let op = read_op(&m, index, true);
        let raw = m.raw_keynum_to_index(op.keynum);
        let partner_index = m.role_index(raw, false);
        let baseline = m.populate_value(raw);

        // Partner has not reached its slot: baseline still fine.
        assert!(verifier.verify_exercise_read(&op, Some(&vv(baseline.clone())), partner_index));
        // Partner published completion of its slot: baseline now stale.
        assert!(!verifier.verify_exercise_read(&op, Some(&vv(baseline)), partner_index + 1));
        // Partner's own value is of course accepted.
        let partner_value = m.exercise_value(partner_index, false);
        assert!(verifier.verify_exercise_read(&op, Some(&vv(partner_value)), partner_index + 1));
    }

    #[test]
    fn absence_accepted_when_partner_deletes() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::NoneRequired, &tallies);

        let index = index_with_kind(&m, UpdateKind::is_delete);
        let op = read_op(&m, index, true);
        assert!(verifier.verify_exercise_read(&op, None, 0));
    }

    #[test]
    fn update_previous_window() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::NoneRequired, &tallies);

        let index = index_with_kind(&m, |k| k == UpdateKind::Put);
        let generator = OpGenerator::new(&m, 0, 0);
        let mut rng = StdRng::seed_from_u64(1);
        let op = generator.exercise_op(index, true, &mut rng);
        let raw = m.raw_keynum_to_index(op.keynum);
        let partner_index = m.role_index(raw, false);

        let good = WriteOutcome {
            previous: Some(vv(m.populate_value(raw))),
            version: Some(Version(9)),
            success: true,
        };
        assert!(verifier.verify_exercise_update(&op, &good, 0, false));

        let partner_prev = WriteOutcome {
            previous: Some(vv(m.exercise_value(partner_index, false))),
            version: Some(Version(9)),
            success: true,
        };
        assert!(verifier.verify_exercise_update(&op, &partner_prev, 0, false));

        let bad = WriteOutcome {
            previous: Some(vv(b"junk".to_vec())),
            version: Some(Version(9)),
            success: true,
        };
        assert!(!verifier.verify_exercise_update(&op, &bad, 0, false));
    }

    #[test]
    fn retry_accepts_own_prior_write() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::NoneRequired, &tallies);

        let index = index_with_kind(&m, |k| k == UpdateKind::Put);
        let generator = OpGenerator::new(&m, 0, 0);
        let mut rng = StdRng::seed_from_u64(1);
        let op = generator.exercise_op(index, true, &mut rng);

        let own_prior = WriteOutcome {
            previous: Some(vv(m.exercise_value(index, true))),
            version: Some(Version(9)),
            success: true,
        };
        // Only a retry may see its own value as the previous value.
        assert!(!verifier.verify_exercise_update(&op, &own_prior, 0, false));
        assert!(verifier.verify_exercise_update(&op, &own_prior, 0, true));
    }

    #[test]
    fn if_absent_coherence() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::NoneRequired, &tallies);

        let index = index_with_kind(&m, |k| k == UpdateKind::PutIfAbsent);
        let generator = OpGenerator::new(&m, 0, 0);
        let mut rng = StdRng::seed_from_u64(1);
        let op = generator.exercise_op(index, true, &mut rng);
        let raw = m.raw_keynum_to_index(op.keynum);

        // success with a previous value is incoherent regardless of value.
        let incoherent = WriteOutcome {
            previous: Some(vv(m.populate_value(raw))),
            version: Some(Version(3)),
            success: true,
        };
        assert!(!verifier.verify_exercise_update(&op, &incoherent, 0, false));

        let declined = WriteOutcome {
            previous: Some(vv(m.populate_value(raw))),
            version: None,
            success: false,
        };
        assert!(verifier.verify_exercise_update(&op, &declined, 0, false));
    }

    #[test]
    fn final_value_window() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::Absolute, &tallies);

        let index = index_with_kind(&m, |k| k == UpdateKind::Put);
        let keynum = m.exercise_index_to_keynum(index, true);
        let raw = m.raw_keynum_to_index(keynum);

        let baseline = m.populate_value(raw);
        let first = m.exercise_value(m.role_index(raw, true), true);
        let second = m.exercise_value(m.role_index(raw, false), false);

        // Before exercise only the baseline is legal.
        assert!(verifier.verify_final_value(keynum, Some(&vv(baseline.clone())), false));
        assert!(!verifier.verify_final_value(keynum, Some(&vv(first.clone())), false));
        assert!(!verifier.verify_final_value(keynum, None, false));

        // After exercise any of the three is legal; absence still is not,
        // because this keynum's kind writes rather than deletes.
        for value in [baseline, first, second] {
            assert!(verifier.verify_final_value(keynum, Some(&vv(value)), true));
        }
        assert!(!verifier.verify_final_value(keynum, None, true));
        assert!(!verifier.verify_final_value(keynum, Some(&vv(b"junk".to_vec())), true));
    }

    #[test]
    fn final_absence_after_delete_kind() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::Absolute, &tallies);

        let index = index_with_kind(&m, UpdateKind::is_delete);
        let keynum = m.exercise_index_to_keynum(index, true);

        assert!(verifier.verify_final_value(keynum, None, true));
        assert!(!verifier.verify_final_value(keynum, None, false));
    }

    #[test]
    fn expired_records_verify_as_absent() {
        let ttl = TtlConfig {
            min_days: 1,
            max_days: 10,
            current_day: 11,
        };
        let m = KeynumModel::new(42, ttl).expect("model");
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 0, Consistency::Absolute, &tallies);

        let expired = (0..500u64).find(|&i| m.is_expired(i)).expect("expired index");
        let keynum = m.index_to_keynum(expired);
        assert!(verifier.verify_final_value(keynum, None, false));
        assert!(verifier.verify_final_present(keynum, false, false));
    }

    #[test]
    fn tallies_record_and_cap() {
        let m = model();
        let tallies = Tallies::default();
        let verifier = Verifier::new(&m, 50, Consistency::Absolute, &tallies);
        let op = read_op(&m, 0, true);

        verifier.record(&op, true, "ok");
        verifier.record(&op, false, "bad value");
        verifier.record_exception(1, false, "boom");

        let snapshot = tallies.snapshot();
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.unexpected_results, 1);
        assert_eq!(snapshot.unexpected_exceptions, 1);
        assert!(!snapshot.clean());
    }

    #[test]
    fn pair_progress_visibility() {
        let progress = PairProgress::new(0);
        assert_eq!(progress.partner_next(true), 0);
        progress.record_done(false, 5);
        assert_eq!(progress.partner_next(true), 6);
        assert_eq!(progress.partner_next(false), 0);
    }
}
