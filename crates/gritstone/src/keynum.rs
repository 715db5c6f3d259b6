//! Deterministic keynum/index model.
//!
//! Every operation the harness issues is identified by a monotonic `index`;
//! the record it touches is identified by a `keynum` — the 48-bit permuted
//! identity of that index. The permutation scatters parent keys
//! unpredictably across the store while remaining exactly invertible, so
//! that any observed record can be mapped back to the operation that must
//! have produced it.
//!
//! Keynum layout: the high 40 bits are the permuted parent component, the
//! low [`MINOR_KEY_BITS`] bits the minor component, so one parent key holds
//! up to [`MINOR_KEY_MAX`] minor keys and consecutive indices fill one
//! parent before moving to the next (scattered) one.

use std::collections::BTreeSet;

use gritstone_permute::KeynumPermutation;

use crate::error::HarnessError;
use crate::store::{PartitionId, StoreClient, StoreKey, Value};

/// Indices per block; progress is checkpointed at block granularity and all
/// phase ranges must be multiples of this.
pub const BLOCK_COUNT: u64 = 64;

/// Bits of the keynum reserved for the minor-key component.
pub const MINOR_KEY_BITS: u32 = 8;

/// Maximum minor keys per parent key.
pub const MINOR_KEY_MAX: u64 = 1 << MINOR_KEY_BITS;

const MINOR_KEY_MASK: u64 = MINOR_KEY_MAX - 1;

/// Largest legal operation index; fills the 48-bit keynum space exactly.
pub const MAX_INDEX: u64 = (1 << 48) - 1;

/// Fixed length of every stored value.
pub const VALUE_LEN: usize = 16;

const TAG_POPULATE: u8 = 0x10;
const TAG_EXERCISE_FIRST: u8 = 0x21;
const TAG_EXERCISE_SECOND: u8 = 0x22;

// ============================================================================
// TTL configuration
// ============================================================================

/// Synthetic time-to-live policy.
///
/// TTL days are hashed from (seed, index); a record is treated as expired
/// when its day is non-zero and strictly before `current_day`. Expiry is a
/// pure function of configuration so runs replay identically across
/// processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlConfig {
    /// Smallest TTL day assigned (0 allows "no TTL" records).
    pub min_days: u32,
    /// Largest TTL day assigned; 0 disables TTL entirely.
    pub max_days: u32,
    /// The day "now" is on, for expiry decisions.
    pub current_day: u32,
}

// ============================================================================
// Keynum model
// ============================================================================

/// The deterministic model of what should be in the store.
///
/// Immutable once constructed; one instance serves every thread of a phase.
pub struct KeynumModel {
    perm: KeynumPermutation,
    ttl: TtlConfig,
}

impl KeynumModel {
    /// Builds the model for a run seed.
    pub fn new(seed: i64, ttl: TtlConfig) -> Result<Self, HarnessError> {
        Ok(Self {
            perm: KeynumPermutation::new(seed)?,
            ttl,
        })
    }

    /// Maps an operation index to its keynum.
    pub fn index_to_keynum(&self, index: u64) -> u64 {
        debug_assert!(index <= MAX_INDEX);
        let parent = self.perm.transform40(index >> MINOR_KEY_BITS);
        (parent << MINOR_KEY_BITS) | (index & MINOR_KEY_MASK)
    }

    /// Inverse of [`Self::index_to_keynum`], ignoring TTL state.
    pub fn raw_keynum_to_index(&self, keynum: u64) -> u64 {
        let parent_index = self.perm.untransform40(keynum >> MINOR_KEY_BITS);
        (parent_index << MINOR_KEY_BITS) | (keynum & MINOR_KEY_MASK)
    }

    /// Maps a keynum back to the index that produced it, or `-1` when the
    /// index's synthetic TTL has expired and no value is expected.
    pub fn keynum_to_index(&self, keynum: u64) -> i64 {
        let index = self.raw_keynum_to_index(keynum);
        if self.is_expired(index) {
            -1
        } else {
            index as i64
        }
    }

    /// The index at which the given writer role touches the block position
    /// that `index` names.
    ///
    /// The first thread walks each block forward; its partner walks the same
    /// block in reverse, so the pair collides on every key of the block at
    /// different offsets. The mapping is an involution, which is what makes
    /// each role's keynum stream individually invertible.
    pub fn role_index(&self, index: u64, first_thread: bool) -> u64 {
        if first_thread {
            index
        } else {
            let block = index / BLOCK_COUNT;
            let offset = index % BLOCK_COUNT;
            block * BLOCK_COUNT + (BLOCK_COUNT - 1 - offset)
        }
    }

    /// Maps an exercise index to a keynum for the given writer role.
    pub fn exercise_index_to_keynum(&self, index: u64, first_thread: bool) -> u64 {
        self.index_to_keynum(self.role_index(index, first_thread))
    }

    /// Inverse of [`Self::exercise_index_to_keynum`] for the given role, with
    /// the same `-1` TTL sentinel as [`Self::keynum_to_index`].
    pub fn keynum_to_exercise_index(&self, keynum: u64, first_thread: bool) -> i64 {
        let raw = self.raw_keynum_to_index(keynum);
        if self.is_expired(raw) {
            -1
        } else {
            self.role_index(raw, first_thread) as i64
        }
    }

    /// Splits a keynum into its store key.
    pub fn keynum_to_key(&self, keynum: u64) -> StoreKey {
        StoreKey {
            parent: keynum >> MINOR_KEY_BITS,
            minor: (keynum & MINOR_KEY_MASK) as u16,
        }
    }

    /// Rebuilds a keynum from a store key.
    pub fn key_to_keynum(&self, key: StoreKey) -> u64 {
        (key.parent << MINOR_KEY_BITS) | u64::from(key.minor)
    }

    // ------------------------------------------------------------------------
    // TTL
    // ------------------------------------------------------------------------

    /// TTL day assigned to an index. Pure: same seed and index, same day.
    pub fn index_to_ttl_days(&self, index: u64) -> u32 {
        if self.ttl.max_days == 0 {
            return 0;
        }
        let span = u64::from(self.ttl.max_days - self.ttl.min_days) + 1;
        self.ttl.min_days + (self.perm.transform64(index) % span) as u32
    }

    /// Whether the record at `index` is past its synthetic TTL.
    pub fn is_expired(&self, index: u64) -> bool {
        let days = self.index_to_ttl_days(index);
        days != 0 && days < self.ttl.current_day
    }

    // ------------------------------------------------------------------------
    // Read/update split
    // ------------------------------------------------------------------------

    /// Whether the exercise operation at (index, role) is a read.
    ///
    /// This decision must be recomputable by the verifier, so it hashes the
    /// tagged index through the permutation rather than drawing from the
    /// per-thread RNG.
    pub fn is_read_op(&self, index: u64, first_thread: bool, read_percent: u8) -> bool {
        let tagged = index | (u64::from(!first_thread) << 63);
        (self.perm.transform64(tagged) % 100) < u64::from(read_percent)
    }

    // ------------------------------------------------------------------------
    // Expected values
    // ------------------------------------------------------------------------

    /// The value populate writes for an index.
    pub fn populate_value(&self, index: u64) -> Value {
        encode_value(TAG_POPULATE, index, self.index_to_keynum(index))
    }

    /// The value an exercise update writes at (index, role).
    pub fn exercise_value(&self, index: u64, first_thread: bool) -> Value {
        let tag = if first_thread {
            TAG_EXERCISE_FIRST
        } else {
            TAG_EXERCISE_SECOND
        };
        encode_value(tag, index, self.exercise_index_to_keynum(index, first_thread))
    }

    // ------------------------------------------------------------------------
    // Partition restriction
    // ------------------------------------------------------------------------

    /// Whether a keynum falls in the configured partition subset.
    pub fn keynum_in_partitions(
        &self,
        keynum: u64,
        store: &dyn StoreClient,
        partitions: &BTreeSet<PartitionId>,
    ) -> bool {
        partitions.contains(&store.partition_of(self.keynum_to_key(keynum)))
    }
}

/// Encodes a `(tag, index, keynum)` triple into the fixed value layout.
fn encode_value(tag: u8, index: u64, keynum: u64) -> Value {
    let mut value = vec![0u8; VALUE_LEN];
    value[0] = tag;
    value[1..9].copy_from_slice(&index.to_be_bytes());
    value[9..15].copy_from_slice(&keynum.to_be_bytes()[2..]);
    value[15] = value[..15].iter().fold(0xA5, |acc, b| acc ^ b);
    value
}

/// Decodes a stored value back into `(tag, index, keynum)` for diagnostics.
///
/// Returns `None` for foreign or corrupt bytes.
pub fn decode_value(value: &[u8]) -> Option<(u8, u64, u64)> {
    if value.len() != VALUE_LEN {
        return None;
    }
    let checksum = value[..15].iter().fold(0xA5, |acc, b| acc ^ b);
    if checksum != value[15] {
        return None;
    }
    let mut index_bytes = [0u8; 8];
    index_bytes.copy_from_slice(&value[1..9]);
    let mut keynum_bytes = [0u8; 8];
    keynum_bytes[2..].copy_from_slice(&value[9..15]);
    Some((
        value[0],
        u64::from_be_bytes(index_bytes),
        u64::from_be_bytes(keynum_bytes),
    ))
}

/// Validates that a phase range is non-negative and block-aligned.
///
/// Returns the validated `(start, count)` as unsigned values.
pub fn check_block_aligned(start: i64, count: i64) -> Result<(u64, u64), HarnessError> {
    if start < 0 || count < 0 {
        return Err(HarnessError::config(format!(
            "start ({start}) and count ({count}) must be non-negative"
        )));
    }
    let (start, count) = (start as u64, count as u64);
    if start % BLOCK_COUNT != 0 || count % BLOCK_COUNT != 0 {
        return Err(HarnessError::config(format!(
            "start ({start}) and count ({count}) must be multiples of the block size ({BLOCK_COUNT})"
        )));
    }
    if start.checked_add(count).is_none_or(|end| end > MAX_INDEX + 1) {
        return Err(HarnessError::config(format!(
            "start ({start}) + count ({count}) exceeds the maximum index ({MAX_INDEX})"
        )));
    }
    Ok((start, count))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn model(seed: i64) -> KeynumModel {
        KeynumModel::new(seed, TtlConfig::default()).expect("model")
    }

    #[test]
    fn index_keynum_round_trip() {
        let m = model(42);
        for index in [0u64, 1, 63, 64, 255, 256, 1_000_000, MAX_INDEX] {
            let keynum = m.index_to_keynum(index);
            assert_eq!(m.keynum_to_index(keynum), index as i64);
        }
    }

    #[test]
    fn index_zero_round_trips() {
        let m = model(0);
        assert_eq!(m.keynum_to_index(m.index_to_keynum(0)), 0);
    }

    #[test]
    fn max_index_stays_in_48_bits() {
        let m = model(42);
        assert!(m.index_to_keynum(MAX_INDEX) <= MAX_INDEX);
    }

    #[test]
    fn exercise_round_trip_per_role() {
        let m = model(42);
        for index in [0u64, 5, 63, 64, 130, 4096] {
            for first_thread in [true, false] {
                let keynum = m.exercise_index_to_keynum(index, first_thread);
                assert_eq!(
                    m.keynum_to_exercise_index(keynum, first_thread),
                    index as i64,
                    "index {index} role {first_thread}"
                );
            }
        }
    }

    #[test]
    fn paired_roles_cover_the_same_block_keynums() {
        let m = model(42);
        let mut first: Vec<u64> = (0..BLOCK_COUNT)
            .map(|i| m.exercise_index_to_keynum(i, true))
            .collect();
        let mut second: Vec<u64> = (0..BLOCK_COUNT)
            .map(|i| m.exercise_index_to_keynum(i, false))
            .collect();
        assert_ne!(first, second, "roles should not walk in the same order");
        first.sort_unstable();
        second.sort_unstable();
        assert_eq!(first, second, "roles must race over the same records");
    }

    #[test]
    fn minor_keys_bounded_per_parent() {
        let m = model(42);
        for index in 0..(MINOR_KEY_MAX * 2) {
            let key = m.keynum_to_key(m.index_to_keynum(index));
            assert!(u64::from(key.minor) < MINOR_KEY_MAX);
        }
        // One full parent's worth of consecutive indices lands on one parent.
        let parents: BTreeSet<u64> = (0..MINOR_KEY_MAX)
            .map(|i| m.keynum_to_key(m.index_to_keynum(i)).parent)
            .collect();
        assert_eq!(parents.len(), 1);
    }

    #[test]
    fn parents_are_scattered() {
        let m = model(42);
        let a = m.keynum_to_key(m.index_to_keynum(0)).parent;
        let b = m.keynum_to_key(m.index_to_keynum(MINOR_KEY_MAX)).parent;
        assert_ne!(a, b);
        assert!(b != a + 1, "adjacent parents should not be adjacent keys");
    }

    #[test]
    fn ttl_days_pure_and_in_range() {
        let ttl = TtlConfig {
            min_days: 1,
            max_days: 30,
            current_day: 10,
        };
        let m = KeynumModel::new(42, ttl).expect("model");
        for index in 0..500u64 {
            let days = m.index_to_ttl_days(index);
            assert_eq!(days, m.index_to_ttl_days(index));
            assert!((1..=30).contains(&days));
        }
    }

    #[test]
    fn expired_index_maps_to_sentinel() {
        let ttl = TtlConfig {
            min_days: 1,
            max_days: 30,
            // Everything with a TTL has expired.
            current_day: 31,
        };
        let m = KeynumModel::new(42, ttl).expect("model");
        let expired = (0..200u64).find(|&i| m.is_expired(i)).expect("some index expires");
        assert_eq!(m.keynum_to_index(m.index_to_keynum(expired)), -1);
        assert_eq!(
            m.keynum_to_exercise_index(m.exercise_index_to_keynum(expired, false), false),
            -1
        );
    }

    #[test]
    fn ttl_disabled_never_expires() {
        let m = model(42);
        for index in 0..100u64 {
            assert_eq!(m.index_to_ttl_days(index), 0);
            assert!(!m.is_expired(index));
        }
    }

    #[test]
    fn read_update_split_is_deterministic() {
        let m = model(42);
        let split: Vec<bool> = (0..BLOCK_COUNT).map(|i| m.is_read_op(i, true, 50)).collect();
        assert_eq!(
            split,
            (0..BLOCK_COUNT).map(|i| m.is_read_op(i, true, 50)).collect::<Vec<bool>>()
        );
        // Roles decide independently.
        assert_ne!(
            split,
            (0..BLOCK_COUNT).map(|i| m.is_read_op(i, false, 50)).collect::<Vec<bool>>()
        );
        // Extremes are exact.
        assert!((0..100).all(|i| !m.is_read_op(i, true, 0)));
        assert!((0..100).all(|i| m.is_read_op(i, true, 100)));
    }

    #[test]
    fn value_encoding_round_trips() {
        let m = model(42);
        let value = m.populate_value(1234);
        let (tag, index, keynum) = decode_value(&value).expect("decodes");
        assert_eq!(tag, TAG_POPULATE);
        assert_eq!(index, 1234);
        assert_eq!(keynum, m.index_to_keynum(1234));

        let ex = m.exercise_value(77, false);
        let (tag, index, _) = decode_value(&ex).expect("decodes");
        assert_eq!(tag, TAG_EXERCISE_SECOND);
        assert_eq!(index, 77);

        assert!(decode_value(b"junk").is_none());
        let mut corrupt = m.populate_value(1);
        corrupt[3] ^= 0xff;
        assert!(decode_value(&corrupt).is_none());
    }

    #[test]
    fn block_alignment_enforced() {
        assert!(check_block_aligned(0, 0).is_ok());
        assert!(check_block_aligned(64, 128).is_ok());
        assert!(check_block_aligned(37, 64).is_err());
        assert!(check_block_aligned(64, 37).is_err());
        assert!(check_block_aligned(-64, 64).is_err());
        assert!(check_block_aligned(0, -1).is_err());
    }

    #[test]
    fn proptest_round_trip() {
        use proptest::prelude::*;

        proptest!(|(seed: i64, index in 0u64..=MAX_INDEX)| {
            let m = KeynumModel::new(seed, TtlConfig::default()).unwrap();
            prop_assert_eq!(m.keynum_to_index(m.index_to_keynum(index)), index as i64);
        });
    }
}
