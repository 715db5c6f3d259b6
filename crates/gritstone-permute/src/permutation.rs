//! Seed-keyed bijections over the keynum integer domains.

use crate::cipher::{CipherError, FeedbackCipher};

/// Largest value in the 48-bit keynum domain.
pub const MAX_48: u64 = (1 << 48) - 1;

/// Largest value in the 40-bit parent-key domain.
pub const MAX_40: u64 = (1 << 40) - 1;

/// A keyed, invertible pseudo-random bijection over fixed-width integers.
///
/// For a fixed seed, `transform` is a bijection on the relevant domain and
/// `untransform` is its exact inverse. Outputs have no simple arithmetic
/// relationship to inputs, which is what spreads keys evenly across the
/// store's partition space while keeping them exactly recoverable.
pub struct KeynumPermutation {
    cipher: FeedbackCipher,
}

impl KeynumPermutation {
    /// Builds the permutation for `seed`.
    ///
    /// Construction fails only on key-derivation failure, which indicates a
    /// broken environment and is fatal to the run.
    pub fn new(seed: i64) -> Result<Self, CipherError> {
        Ok(Self {
            cipher: FeedbackCipher::new(seed)?,
        })
    }

    /// Permutes a 48-bit value.
    pub fn transform48(&self, x: u64) -> u64 {
        debug_assert!(x <= MAX_48);
        self.cipher.encrypt_int(x, 6)
    }

    /// Inverse of [`Self::transform48`].
    pub fn untransform48(&self, x: u64) -> u64 {
        debug_assert!(x <= MAX_48);
        self.cipher.decrypt_int(x, 6)
    }

    /// Permutes a 40-bit value.
    pub fn transform40(&self, x: u64) -> u64 {
        debug_assert!(x <= MAX_40);
        self.cipher.encrypt_int(x, 5)
    }

    /// Inverse of [`Self::transform40`].
    pub fn untransform40(&self, x: u64) -> u64 {
        debug_assert!(x <= MAX_40);
        self.cipher.decrypt_int(x, 5)
    }

    /// Permutes a single byte.
    pub fn transform8(&self, x: u8) -> u8 {
        self.cipher.encrypt_int(u64::from(x), 1) as u8
    }

    /// Inverse of [`Self::transform8`].
    pub fn untransform8(&self, x: u8) -> u8 {
        self.cipher.decrypt_int(u64::from(x), 1) as u8
    }

    /// Permutes the full 64-bit domain.
    pub fn transform64(&self, x: u64) -> u64 {
        self.cipher.encrypt_int(x, 8)
    }

    /// Inverse of [`Self::transform64`].
    pub fn untransform64(&self, x: u64) -> u64 {
        self.cipher.decrypt_int(x, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_40_and_48() {
        let perm = KeynumPermutation::new(42).expect("permutation");
        for x in [0u64, 1, 1000, MAX_40, MAX_48 >> 1] {
            if x <= MAX_40 {
                assert_eq!(perm.untransform40(perm.transform40(x)), x);
            }
            assert_eq!(perm.untransform48(perm.transform48(x)), x);
        }
        assert_eq!(perm.untransform48(perm.transform48(MAX_48)), MAX_48);
    }

    #[test]
    fn round_trip_8_full_domain() {
        let perm = KeynumPermutation::new(42).expect("permutation");
        for x in 0..=255u8 {
            assert_eq!(perm.untransform8(perm.transform8(x)), x);
        }
    }

    #[test]
    fn transform_is_not_identity() {
        // Guards against a no-op bug. A permutation may fix a point or two,
        // but fixing most of a sample means nothing was transformed.
        let perm = KeynumPermutation::new(1701).expect("permutation");
        let moved = (0..256u64)
            .filter(|&x| perm.transform48(x) != x)
            .count();
        assert!(moved > 250, "only {moved}/256 inputs moved");
    }

    #[test]
    fn zero_round_trips() {
        let perm = KeynumPermutation::new(0).expect("permutation");
        assert_eq!(perm.untransform48(perm.transform48(0)), 0);
        assert_eq!(perm.untransform64(perm.transform64(0)), 0);
    }

    #[test]
    fn proptest_round_trip_40() {
        use proptest::prelude::*;

        proptest!(|(seed: i64, x in 0u64..(1 << 40))| {
            let perm = KeynumPermutation::new(seed).unwrap();
            prop_assert_eq!(perm.untransform40(perm.transform40(x)), x);
        });
    }
}
