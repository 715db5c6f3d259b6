//! # Gritstone: deterministic stress testing for key-value stores
//!
//! Gritstone exercises a distributed key-value store through four phases —
//! populate, exercise, check, clean — running concurrent randomized
//! operation streams against known keys and verifying every observation
//! against a deterministic, recomputable model of what should be stored.
//! It is glue code and test-operation generators over an injected store
//! client, not a storage engine.
//!
//! ## Philosophy
//!
//! - **Reproducibility**: one 64-bit seed fixes every key, value, and
//!   operation choice; same seed, same run, same bugs.
//! - **Recoverable identity**: keys are scattered by a keyed, invertible
//!   permutation, so any observed record maps back to the operation that
//!   must have produced it.
//! - **Race-tolerant verification**: two writer threads race over each
//!   record on purpose; an observation is judged against every state the
//!   model says the record could legally be in, never a single value.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Phase Scheduler                          │
//! │   populate ── exercise (paired writers) ── check ── clean        │
//! │                                                                  │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────────────┐  │
//! │  │ KeynumModel  │  │ OpGenerator   │  │ Verifier              │  │
//! │  │ (index <->   │  │ (weighted     │  │ (two-candidate        │  │
//! │  │  keynum)     │  │  read/update) │  │  acceptance window)   │  │
//! │  └──────────────┘  └───────────────┘  └───────────────────────┘  │
//! │                                                                  │
//! │                  StoreClient (injected backend)                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```
//! use gritstone::{Harness, HarnessConfig, MemStore};
//!
//! let config = HarnessConfig::default().with_seed(42).with_read_percent(50);
//! let harness = Harness::new(MemStore::reliable(), config).unwrap();
//!
//! let report = harness.populate(0, 64, 1).unwrap();
//! assert!(report.passed);
//! let report = harness.exercise(0, 64, 1).unwrap();
//! assert!(report.passed);
//! ```

pub mod args;
pub mod descriptor;
pub mod droptable;
mod error;
pub mod keynum;
pub mod memstore;
pub mod ops;
pub mod phase;
pub mod store;
pub mod verify;

pub use args::{ArgError, Consistency, Durability, ReplicaAckPolicy, SyncPolicy};
pub use descriptor::SchemaDescriptor;
pub use droptable::{DropState, DropTableScenario};
pub use error::HarnessError;
pub use keynum::{
    BLOCK_COUNT, KeynumModel, MAX_INDEX, MINOR_KEY_MAX, TtlConfig, check_block_aligned,
    decode_value,
};
pub use memstore::{MemStore, MemStoreConfig};
pub use ops::{Observation, OpContext, OpGenerator, OpKind, Operation, ReadKind, UpdateKind};
pub use phase::{
    Harness, HarnessConfig, InterceptVerdict, OpInterceptor, PhaseName, PhaseReport, PhaseState,
};
pub use store::{
    BatchOp, Direction, PartitionId, StoreClient, StoreError, StoreKey, Value, ValueVersion,
    Version, WriteOutcome,
};
pub use verify::{Candidate, CandidateSet, MAX_REPORTED, PairProgress, Tallies, TallySnapshot, Verifier};
