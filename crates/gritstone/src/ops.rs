//! Randomized test-operation generation.
//!
//! Operations are a tagged enum dispatched through one capability method
//! ([`Operation::execute`]); per-kind data rides in the operation itself.
//!
//! Two selection disciplines, on purpose:
//!
//! - **Update kinds cycle**: the kind is the permuted index (the keynum)
//!   modulo the kind list, so a full block exercises every update kind
//!   equally. Coverage is a guarantee here, not a probability.
//! - **Read kinds are inverse-cost weighted**: weights are normalized so the
//!   total is ~1000 and each read path gets roughly equal *time* rather than
//!   equal count. Reads never mutate state, so this choice may come from the
//!   per-thread RNG without breaking verification.

use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;

use crate::args::Consistency;
use crate::keynum::KeynumModel;
use crate::store::{BatchOp, StoreClient, StoreError, Value, ValueVersion, WriteOutcome};

// ============================================================================
// Operation kinds
// ============================================================================

/// Read operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Get,
    MultiGet,
    MultiGetKeys,
    MultiGetIterator,
}

impl ReadKind {
    pub const ALL: [ReadKind; 4] = [
        ReadKind::Get,
        ReadKind::MultiGet,
        ReadKind::MultiGetKeys,
        ReadKind::MultiGetIterator,
    ];

    /// Relative cost of one call, in units of a point get.
    pub fn relative_cost(self) -> u32 {
        match self {
            ReadKind::Get => 1,
            ReadKind::MultiGetKeys => 8,
            ReadKind::MultiGet => 10,
            ReadKind::MultiGetIterator => 12,
        }
    }

    /// Inverse-cost selection weights, normalized to sum to ~1000.
    pub fn weights() -> [u32; 4] {
        let inverse_total: f64 = Self::ALL
            .iter()
            .map(|kind| 1.0 / f64::from(kind.relative_cost()))
            .sum();
        let mut weights = [0u32; 4];
        for (weight, kind) in weights.iter_mut().zip(Self::ALL) {
            *weight =
                (1000.0 / f64::from(kind.relative_cost()) / inverse_total).round() as u32;
        }
        weights
    }

    /// Draws a read kind from the weighted pool.
    pub fn choose(rng: &mut StdRng) -> ReadKind {
        let weights = Self::weights();
        let total: u32 = weights.iter().sum();
        let mut draw = rng.gen_range(0..total);
        for (kind, weight) in Self::ALL.into_iter().zip(weights) {
            if draw < weight {
                return kind;
            }
            draw -= weight;
        }
        ReadKind::Get
    }
}

/// Update operation kinds, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Put,
    PutIfAbsent,
    PutIfPresent,
    PutIfVersion,
    Delete,
    DeleteIfVersion,
    MultiDelete,
    ExecuteBatchPut,
}

impl UpdateKind {
    pub const CYCLE: [UpdateKind; 8] = [
        UpdateKind::Put,
        UpdateKind::PutIfAbsent,
        UpdateKind::PutIfPresent,
        UpdateKind::PutIfVersion,
        UpdateKind::Delete,
        UpdateKind::DeleteIfVersion,
        UpdateKind::MultiDelete,
        UpdateKind::ExecuteBatchPut,
    ];

    /// The update kind scheduled for a keynum.
    ///
    /// Both racing roles see the same keynum, so both schedule the same kind;
    /// a block of consecutive indices covers every kind because the keynum's
    /// low bits are the in-block offset.
    pub fn at(keynum: u64) -> UpdateKind {
        Self::CYCLE[(keynum % Self::CYCLE.len() as u64) as usize]
    }

    /// Whether this kind removes the record.
    pub fn is_delete(self) -> bool {
        matches!(
            self,
            UpdateKind::Delete | UpdateKind::DeleteIfVersion | UpdateKind::MultiDelete
        )
    }

    /// Whether this kind writes unconditionally when it executes.
    pub fn is_unconditional_put(self) -> bool {
        matches!(self, UpdateKind::Put | UpdateKind::ExecuteBatchPut)
    }
}

/// Any operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read(ReadKind),
    Update(UpdateKind),
    /// Bulk-load path; gated by sampling, outside the weighted pools.
    BulkPut,
}

// ============================================================================
// Operation context
// ============================================================================

/// Per-operation request context, passed by value down the call chain.
///
/// Consistency overrides live here rather than in thread-local state so the
/// concurrency contract stays explicit.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    pub consistency: Consistency,
    pub durability: crate::args::Durability,
    pub timeout: Duration,
    /// True when this execution is a retry of an identical earlier attempt.
    pub retrying: bool,
    /// Strengthens reads to absolute consistency for this operation only.
    pub absolute_override: bool,
}

impl OpContext {
    pub fn effective_consistency(&self) -> Consistency {
        if self.absolute_override {
            Consistency::Absolute
        } else {
            self.consistency
        }
    }
}

// ============================================================================
// Observations
// ============================================================================

/// Normalized result of one executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A value-level observation of the operation's own key.
    Value { found: Option<ValueVersion> },
    /// A key-present-only observation.
    Present { present: bool },
    /// A write outcome.
    Write(WriteOutcome),
}

// ============================================================================
// Operation
// ============================================================================

/// One scheduled operation: reconstructed on demand from (seed, index), never
/// persisted.
#[derive(Debug, Clone)]
pub struct Operation {
    pub index: u64,
    pub first_thread: bool,
    pub keynum: u64,
    pub kind: OpKind,
    /// Payload for write kinds.
    pub value: Option<Value>,
}

impl Operation {
    /// Executes this operation against the store and normalizes the result.
    pub fn execute(
        &self,
        store: &dyn StoreClient,
        model: &KeynumModel,
        ctx: &OpContext,
    ) -> Result<Observation, StoreError> {
        let key = model.keynum_to_key(self.keynum);
        let consistency = ctx.effective_consistency();

        match self.kind {
            OpKind::Read(ReadKind::Get) => {
                let found = store.get(key, consistency, ctx.timeout)?;
                Ok(Observation::Value { found })
            }
            OpKind::Read(ReadKind::MultiGet) => {
                let entries = store.multi_get(key.parent, consistency, ctx.timeout)?;
                let found = entries.into_iter().find(|(k, _)| *k == key).map(|(_, vv)| vv);
                Ok(Observation::Value { found })
            }
            OpKind::Read(ReadKind::MultiGetKeys) => {
                let keys = store.multi_get_keys(key.parent, consistency, ctx.timeout)?;
                Ok(Observation::Present {
                    present: keys.contains(&key),
                })
            }
            OpKind::Read(ReadKind::MultiGetIterator) => {
                let mut iter = store.multi_get_iterator(key.parent, consistency, ctx.timeout)?;
                let found = iter.find(|(k, _)| *k == key).map(|(_, vv)| vv);
                Ok(Observation::Value { found })
            }
            OpKind::Update(kind) => self.execute_update(kind, key, store, ctx),
            OpKind::BulkPut => {
                let outcome = store.put(key, self.payload(), ctx.durability, ctx.timeout)?;
                Ok(Observation::Write(outcome))
            }
        }
    }

    fn execute_update(
        &self,
        kind: UpdateKind,
        key: crate::store::StoreKey,
        store: &dyn StoreClient,
        ctx: &OpContext,
    ) -> Result<Observation, StoreError> {
        let outcome = match kind {
            UpdateKind::Put => store.put(key, self.payload(), ctx.durability, ctx.timeout)?,
            UpdateKind::PutIfAbsent => {
                store.put_if_absent(key, self.payload(), ctx.durability, ctx.timeout)?
            }
            UpdateKind::PutIfPresent => {
                store.put_if_present(key, self.payload(), ctx.durability, ctx.timeout)?
            }
            UpdateKind::PutIfVersion => {
                // Read-then-conditional-put; falls back to if-absent when the
                // record is currently missing.
                match store.get(key, Consistency::Absolute, ctx.timeout)? {
                    Some(current) => store.put_if_version(
                        key,
                        self.payload(),
                        current.version,
                        ctx.durability,
                        ctx.timeout,
                    )?,
                    None => store.put_if_absent(key, self.payload(), ctx.durability, ctx.timeout)?,
                }
            }
            UpdateKind::Delete => store.delete(key, ctx.durability, ctx.timeout)?,
            UpdateKind::DeleteIfVersion => {
                match store.get(key, Consistency::Absolute, ctx.timeout)? {
                    Some(current) => store.delete_if_version(
                        key,
                        current.version,
                        ctx.durability,
                        ctx.timeout,
                    )?,
                    None => WriteOutcome::default(),
                }
            }
            UpdateKind::MultiDelete => {
                let count = store.multi_delete(key, ctx.durability, ctx.timeout)?;
                WriteOutcome {
                    previous: None,
                    version: None,
                    success: count > 0,
                }
            }
            UpdateKind::ExecuteBatchPut => {
                let mut outcomes = store.execute_batch(
                    vec![BatchOp::Put {
                        key,
                        value: self.payload(),
                    }],
                    ctx.durability,
                    ctx.timeout,
                )?;
                outcomes.pop().unwrap_or_default()
            }
        };
        Ok(Observation::Write(outcome))
    }

    fn payload(&self) -> Value {
        self.value.clone().unwrap_or_default()
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Builds the operation for each (index, role) slot of a phase.
pub struct OpGenerator<'a> {
    model: &'a KeynumModel,
    read_percent: u8,
    bulk_put_percent: u8,
}

impl<'a> OpGenerator<'a> {
    pub fn new(model: &'a KeynumModel, read_percent: u8, bulk_put_percent: u8) -> Self {
        Self {
            model,
            read_percent,
            bulk_put_percent,
        }
    }

    /// The exercise operation for an (index, role) slot.
    pub fn exercise_op(&self, index: u64, first_thread: bool, rng: &mut StdRng) -> Operation {
        let keynum = self.model.exercise_index_to_keynum(index, first_thread);
        if self.model.is_read_op(index, first_thread, self.read_percent) {
            Operation {
                index,
                first_thread,
                keynum,
                kind: OpKind::Read(ReadKind::choose(rng)),
                value: None,
            }
        } else {
            let scheduled = UpdateKind::at(keynum);
            // The bulk path only substitutes for kinds that write; swapping a
            // delete for a bulk put would falsify the expected state.
            let kind = if !scheduled.is_delete() && self.choose_bulk_put(rng) {
                OpKind::BulkPut
            } else {
                OpKind::Update(scheduled)
            };
            Operation {
                index,
                first_thread,
                keynum,
                kind,
                value: Some(self.model.exercise_value(index, first_thread)),
            }
        }
    }

    /// The populate operation for an index.
    pub fn populate_op(&self, index: u64) -> Operation {
        Operation {
            index,
            first_thread: true,
            keynum: self.model.index_to_keynum(index),
            kind: OpKind::Update(UpdateKind::Put),
            value: Some(self.model.populate_value(index)),
        }
    }

    /// The check-phase read for an index.
    pub fn check_op(&self, index: u64) -> Operation {
        Operation {
            index,
            first_thread: true,
            keynum: self.model.index_to_keynum(index),
            kind: OpKind::Read(ReadKind::Get),
            value: None,
        }
    }

    /// The clean-phase delete for an index.
    pub fn clean_op(&self, index: u64) -> Operation {
        Operation {
            index,
            first_thread: true,
            keynum: self.model.index_to_keynum(index),
            kind: OpKind::Update(UpdateKind::Delete),
            value: None,
        }
    }

    /// External sampling decision gating the bulk-load path.
    fn choose_bulk_put(&self, rng: &mut StdRng) -> bool {
        self.bulk_put_percent > 0 && rng.gen_range(0..100u8) < self.bulk_put_percent
    }
}

// ============================================================================
// Tests
// ============================================================================
