//! Keyed reversible integer permutations for the Gritstone harness.
//!
//! Gritstone decides which key and value belong at every operation index by
//! running the index through a keyed pseudo-random bijection. This crate
//! provides that bijection in two layers:
//!
//! - [`FeedbackCipher`]: AES-256 in byte-feedback (CFB-8) mode, so encrypting
//!   n bytes yields exactly n bytes and is exactly invertible.
//! - [`KeynumPermutation`]: `transform`/`untransform` over the 8-, 40-, 48-,
//!   and 64-bit unsigned integer domains, keyed by the run seed.
//!
//! Every instance shares one fixed initialization vector. An IV normally
//! exists to randomize repeated encryptions; here the requirement is the
//! opposite — one seed must map one input to the same output across threads,
//! processes, and replayed runs. Resistance to cryptanalysis is explicitly
//! not a goal of this crate.

mod cipher;
mod permutation;

pub use cipher::{CipherError, FeedbackCipher};
pub use permutation::KeynumPermutation;
