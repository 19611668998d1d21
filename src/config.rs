//! Tunables for arena growth.

/// Bytes reserved from the provider the first time anything is allocated.
pub const HEAP_INITIAL_SIZE: usize = 1024 * 1024;

/// After the initial reservation, each growth at least multiplies the arena
/// size by this factor.
pub const HEAP_GROW_FACTOR: usize = 2;

/// How a [`RawAlloc`](../allocators/struct.RawAlloc.html) sizes its requests
/// to the arena provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of the first reservation, independent of the first request. It is
    /// raised to the smallest usable block if set lower.
    pub initial_size: usize,
    /// Growth factor applied to the current arena size on exhaustion. A factor
    /// of 1 (or 0) means the arena only grows by what the request needs.
    pub growth_factor: usize,
}

impl ArenaConfig {
    pub const fn new() -> Self {
        ArenaConfig {
            initial_size: HEAP_INITIAL_SIZE,
            growth_factor: HEAP_GROW_FACTOR,
        }
    }

    pub const fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub const fn with_growth_factor(mut self, growth_factor: usize) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    /// How many bytes to request from the provider when an arena of
    /// `arena_size` bytes cannot fit a block needing `block_bytes` (header
    /// included).
    ///
    /// Returns `None` if the computation overflows.
    pub fn growth_size(&self, arena_size: usize, block_bytes: usize) -> Option<usize> {
        let factor = self.growth_factor.max(1);
        let scaled = arena_size.saturating_mul(factor - 1);
        let wanted = scaled.max(block_bytes);
        if wanted == usize::MAX {
            return None;
        }
        Some(wanted)
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_at_least_doubles() {
        let config = ArenaConfig::new();
        assert_eq!(config.growth_size(4096, 64), Some(4096));
        assert_eq!(config.growth_size(4096, 10_000), Some(10_000));
    }

    #[test]
    fn growth_factor_one_only_fits_request() {
        let config = ArenaConfig::new().with_growth_factor(1);
        assert_eq!(config.growth_size(1 << 20, 96), Some(96));

        let config = ArenaConfig::new().with_growth_factor(0);
        assert_eq!(config.growth_size(1 << 20, 96), Some(96));
    }

    #[test]
    fn growth_factor_three_triples() {
        let config = ArenaConfig::new().with_growth_factor(3);
        assert_eq!(config.growth_size(1000, 16), Some(2000));
    }

    #[test]
    fn saturated_growth_is_refused() {
        let config = ArenaConfig::new();
        assert_eq!(config.growth_size(usize::MAX, 16), None);
    }
}
