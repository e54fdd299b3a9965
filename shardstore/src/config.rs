/// Configuration for building the perfect hash index of a shard
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Average number of keys per displacement bucket (default: 5)
    pub lambda: usize,

    /// Number of hash seeds to try before giving up on the key set (default: 64)
    pub max_seed_attempts: u32,

    /// First seed tried; later attempts derive from it (default: fixed, so builds are reproducible)
    pub seed: u64,

    /// Whether finalize fsyncs the file before and after writing the header (default: true)
    pub sync_on_finalize: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            lambda: 5,
            max_seed_attempts: 64,
            seed: 0x5048_5348_4152_4431,
            sync_on_finalize: true,
        }
    }
}

impl BuildConfig {
    pub(crate) fn lambda(&self) -> usize {
        self.lambda.max(1)
    }

    pub(crate) fn seed_for_attempt(&self, attempt: u32) -> u64 {
        // odd multiplier keeps successive seeds distinct
        self.seed
            .wrapping_add((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}
