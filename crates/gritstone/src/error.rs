//! Harness error taxonomy.
//!
//! Configuration errors and fatal internal errors propagate out of the phase
//! entry points; everything that happens per operation is caught at the
//! operation boundary and converted into tallies and capped log entries.

use std::path::PathBuf;

use thiserror::Error;

use crate::phase::{PhaseName, PhaseState};
use crate::store::StoreError;

/// Errors surfaced by the harness entry points.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad index/count ranges, invalid percentages, malformed arguments.
    /// Raised synchronously before any operation executes.
    #[error("configuration error: {0}")]
    Config(String),

    /// A phase method was invoked on an instance whose phase is not in the
    /// `Before` state.
    #[error("phase {phase} cannot start from state {state:?}")]
    PhaseReuse { phase: PhaseName, state: PhaseState },

    /// Cipher/key construction failed. Indicates a broken test environment,
    /// not a store bug.
    #[error(transparent)]
    Cipher(#[from] gritstone_permute::CipherError),

    /// The drop-table scenario's schema mutation did not succeed within its
    /// retry/timeout budget.
    #[error("schema drop did not complete: {0}")]
    DropFailed(String),

    /// I/O failure on the schema-descriptor hand-off file.
    #[error("failed to access descriptor {path}: {source}")]
    DescriptorIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The schema-descriptor hand-off file is not valid JSON.
    #[error("malformed descriptor {path}: {source}")]
    DescriptorFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A store failure that escaped the per-operation boundary (only the
    /// drop-table DDL path reports store errors this way).
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl HarnessError {
    /// Shorthand for a [`HarnessError::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        HarnessError::Config(msg.into())
    }
}
