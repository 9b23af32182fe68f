use crate::types::ShardId;

/// DJB2-style hash over UTF-16 code units, folded back-to-front.
///
/// Every pod must compute identical values for the same entity id, so the
/// arithmetic is pinned to 32-bit wrapping operations: `h = (h * 33) ^ code`
/// starting from `h = 5381`, iterating code units from the last to the
/// first. Changing this function requires a cluster-wide version bump.
pub fn djb2_reverse(s: &str) -> i32 {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut h: i32 = 5381;
    for &code in units.iter().rev() {
        h = h.wrapping_mul(33) ^ (code as i32);
    }
    h
}

/// Re-mix a raw hash to smooth the high bit: clears bit 30 and ORs in a
/// copy of bit 31, treating the input as a 32-bit unsigned value.
pub fn hash_optimize(n: i32) -> i32 {
    let u = n as u32;
    ((u & 0xBFFF_FFFF) | ((u >> 1) & 0x4000_0000)) as i32
}

/// Compute the shard for an entity id within `[0, number_of_shards)`.
///
/// # Panics
///
/// Panics if `number_of_shards` is zero.
pub fn shard_for_entity(entity_id: &str, number_of_shards: u32) -> ShardId {
    assert!(
        number_of_shards >= 1,
        "number_of_shards must be >= 1, got {number_of_shards}"
    );
    let mixed = hash_optimize(djb2_reverse(entity_id));
    ShardId::new(mixed.unsigned_abs() % number_of_shards)
}
