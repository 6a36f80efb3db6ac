use rand::Rng;

/// Largest seed the UI accepts, `i32::MAX`.
pub const MAX_SEED: u32 = i32::MAX as u32;

/// Uniform in `[0, MAX_SEED]`.
pub fn random_seed() -> u32 {
    rand::rng().random_range(0..=MAX_SEED)
}
