//! Bucket geometry: the prime strata and the raw-hash location math.
//!
//! The table is not a single power-of-two array but a sequence of *strata*
//! whose cumulative sizes are the primes in [`PRIMES`]. Stratum `i` spans the
//! raw-hash range `PRIMES[i - 1]..PRIMES[i]`, so appending a stratum extends
//! the addressable range without invalidating the (layer, slot) location of
//! any raw hash below the old limit.
//!
//! The tables are paired per pointer width and satisfy, for every index `i`:
//!
//! - `POW_MASKS[i] < PRIMES[i + 1] < POW_MASKS[i + 1]`
//! - `POW_MASKS[i + 1] = 2 * POW_MASKS[i] + 1` (consecutive all-ones masks)
//! - `PRIMES[i + 1] > PRIMES[i] + POW_MASKS[i]`
//! - `POW_MASKS[i] - PRIMES[i] < PRIMES[0]`
//!
//! The last two bound where an entry can land when the active layer advances:
//! either in the newly appended stratum, or below `PRIMES[0]` at a slot index
//! *smaller* than its previous one. The migration sweep in `map` relies on
//! this ordering.

/// Cumulative slot counts; stratum `i` holds `PRIMES[i] - PRIMES[i - 1]`
/// slots. Changing these values changes the placement of every key.
#[cfg(target_pointer_width = "32")]
pub(crate) const PRIMES: [usize; MAX_LAYERS] = [
    757, 1783, 3833, 7937, 16141, 32537, 65327, 130873, 261977, 524123, 1048433, 2097013, 4194167,
    8388473, 16777121, 33554341, 67108777, 134217649, 268435399, 536870869, 1073741789, 2147483629,
    4294967291,
];

/// Cumulative slot counts; stratum `i` holds `PRIMES[i] - PRIMES[i - 1]`
/// slots. Changing these values changes the placement of every key.
#[cfg(target_pointer_width = "64")]
pub(crate) const PRIMES: [usize; MAX_LAYERS] = [
    2633,
    6733,
    14929,
    31321,
    64091,
    129643,
    260723,
    522883,
    1047173,
    2095759,
    4192919,
    8387231,
    16775849,
    33553103,
    67107569,
    134216461,
    268434193,
    536869651,
    1073740571,
    2147482417,
    4294966099,
    8589933397,
    17179867997,
    34359737227,
    68719475599,
    137438952341,
    274877905823,
    549755812831,
    1099511626727,
    2199023254517,
    4398046510073,
    8796093021181,
    17592186043451,
    35184372087881,
    70368744176729,
    140737488354413,
    281474976709757,
    562949953420457,
    1125899906841811,
    2251799813684467,
    4503599627369863,
    9007199254740397,
];

/// All-ones masks, one bit wider per layer; `POW_MASKS[i]` has
/// `LOWEST_EXPONENT + 1 + i` set bits. A key's hash is masked with the
/// active layer's entry before the prime reduction.
#[cfg(target_pointer_width = "32")]
pub(crate) const POW_MASKS: [usize; MAX_LAYERS] = [
    (1 << 10) - 1,
    (1 << 11) - 1,
    (1 << 12) - 1,
    (1 << 13) - 1,
    (1 << 14) - 1,
    (1 << 15) - 1,
    (1 << 16) - 1,
    (1 << 17) - 1,
    (1 << 18) - 1,
    (1 << 19) - 1,
    (1 << 20) - 1,
    (1 << 21) - 1,
    (1 << 22) - 1,
    (1 << 23) - 1,
    (1 << 24) - 1,
    (1 << 25) - 1,
    (1 << 26) - 1,
    (1 << 27) - 1,
    (1 << 28) - 1,
    (1 << 29) - 1,
    (1 << 30) - 1,
    (1 << 31) - 1,
    4294967295,
];

/// All-ones masks, one bit wider per layer; `POW_MASKS[i]` has
/// `LOWEST_EXPONENT + 1 + i` set bits. A key's hash is masked with the
/// active layer's entry before the prime reduction.
#[cfg(target_pointer_width = "64")]
pub(crate) const POW_MASKS: [usize; MAX_LAYERS] = [
    (1 << 12) - 1,
    (1 << 13) - 1,
    (1 << 14) - 1,
    (1 << 15) - 1,
    (1 << 16) - 1,
    (1 << 17) - 1,
    (1 << 18) - 1,
    (1 << 19) - 1,
    (1 << 20) - 1,
    (1 << 21) - 1,
    (1 << 22) - 1,
    (1 << 23) - 1,
    (1 << 24) - 1,
    (1 << 25) - 1,
    (1 << 26) - 1,
    (1 << 27) - 1,
    (1 << 28) - 1,
    (1 << 29) - 1,
    (1 << 30) - 1,
    (1 << 31) - 1,
    (1 << 32) - 1,
    (1 << 33) - 1,
    (1 << 34) - 1,
    (1 << 35) - 1,
    (1 << 36) - 1,
    (1 << 37) - 1,
    (1 << 38) - 1,
    (1 << 39) - 1,
    (1 << 40) - 1,
    (1 << 41) - 1,
    (1 << 42) - 1,
    (1 << 43) - 1,
    (1 << 44) - 1,
    (1 << 45) - 1,
    (1 << 46) - 1,
    (1 << 47) - 1,
    (1 << 48) - 1,
    (1 << 49) - 1,
    (1 << 50) - 1,
    (1 << 51) - 1,
    (1 << 52) - 1,
    (1 << 53) - 1,
];

/// Number of strata the prime table can address. The table never grows past
/// this; growth requests beyond it saturate at the final prime.
#[cfg(target_pointer_width = "32")]
pub(crate) const MAX_LAYERS: usize = 23;
#[cfg(target_pointer_width = "64")]
pub(crate) const MAX_LAYERS: usize = 42;

/// `log2(POW_MASKS[0] + 1) - 1`: the exponent below which every raw hash
/// belongs to layer 0.
#[cfg(target_pointer_width = "32")]
pub(crate) const LOWEST_EXPONENT: u32 = 9;
#[cfg(target_pointer_width = "64")]
pub(crate) const LOWEST_EXPONENT: u32 = 11;

/// `2^LOWEST_EXPONENT`.
const LOWEST_POW: usize = 1 << LOWEST_EXPONENT;

/// Cumulative slot count *below* `layer`, i.e. `PRIMES[layer - 1]` with the
/// convention that it is 0 for layer 0.
#[inline]
pub(crate) fn prime_below(layer: usize) -> usize {
    if layer == 0 {
        0
    } else {
        PRIMES[layer - 1]
    }
}

/// Slot count of stratum `layer`.
#[inline]
pub(crate) fn layer_len(layer: usize) -> usize {
    PRIMES[layer] - prime_below(layer)
}

/// Reduces a key hash to a raw index in `0..PRIMES[last_layer]`, the virtual
/// concatenation of all strata up to and including `last_layer`.
#[inline]
pub(crate) fn raw_hash(hash: usize, last_layer: usize) -> usize {
    (hash & POW_MASKS[last_layer]) % PRIMES[last_layer]
}

/// Maps a raw index to its `(layer, slot)` position.
#[inline]
pub(crate) fn locate(raw: usize) -> (usize, usize) {
    // Raw indices below 2^LOWEST_EXPONENT all belong to layer 0; boosting
    // them by LOWEST_POW keeps the log2 in range without a special case.
    let boosted = if raw < LOWEST_POW { raw + LOWEST_POW } else { raw };
    let mut layer = (boosted.ilog2() - LOWEST_EXPONENT) as usize;
    // The mask admits raw indices past the layer's prime; those spill into
    // the next stratum.
    if raw >= PRIMES[layer] {
        layer += 1;
    }
    (layer, raw - prime_below(layer))
}
