//! Deterministic seed derivation.
//!
//! All randomness in the engine flows from two 32-bit derivations: a
//! per-cell base seed (global seed + hashed cell id) and a per-permutation
//! seed (base seed + index times a prime). Simulations never touch the OS
//! entropy pool, so a (global_seed, cell_id, perm_index) triple maps to the
//! same draw stream on every platform.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

/// The cell hash is reduced modulo this stride before being added to the
/// global seed, keeping per-cell offsets in a compact range.
pub const SEED_STRIDE: u32 = 1_000_000;

/// Prime multiplier spreading adjacent permutation indices apart.
pub const PERM_PRIME: u32 = 1_000_003;

/// First 4 bytes of SHA-256 of the cell id, big-endian.
pub fn cell_hash(cell_id: &str) -> u32 {
    let digest = Sha256::digest(cell_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Stable per-cell base seed.
pub fn base_seed(global_seed: u32, cell_id: &str) -> u32 {
    global_seed.wrapping_add(cell_hash(cell_id) % SEED_STRIDE)
}

/// Stable per-permutation seed.
pub fn sim_seed(base_seed: u32, perm_index: u32) -> u32 {
    base_seed.wrapping_add(perm_index.wrapping_mul(PERM_PRIME))
}

/// The simulation PRNG: one documented ChaCha8 stream per permutation.
pub fn sim_rng(base_seed: u32, perm_index: u32) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(sim_seed(base_seed, perm_index) as u64)
}
