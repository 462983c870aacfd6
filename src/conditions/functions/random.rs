use rand::Rng;
use sha2::{Digest, Sha256};

/// Non-negative random value in the same range as a 63-bit random int.
pub(crate) fn random() -> i64 {
    rand::thread_rng().gen_range(0..=i64::MAX)
}

/// Deterministic random value for `key` and `seed`: SHA-256 over the key followed by the seed in
/// lowercase hex, first 8 digest bytes read little endian, reduced to `[0, 2^62)`.
pub(crate) fn random_for_key(key: &str, seed: i64) -> i64 {
    let seed_hex = if seed < 0 {
        format!("-{:x}", seed.unsigned_abs())
    } else {
        format!("{seed:x}")
    };

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(seed_hex.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(prefix) % (1 << 62)) as i64
}
