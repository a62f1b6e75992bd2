/// Tunables for one runtime. Sizes are per heap.
#[derive(Clone, Copy, Debug)]
pub struct GcConfig {
    pub gen0_size: usize,
    pub gen1_size: usize,
    pub gen2_size: usize,
    pub loh_size: usize,
    /// Allocations of at least this many bytes (header included) go to the
    /// large-object segment no matter what generation was requested.
    pub large_object_threshold: usize,
    pub card_size: usize,
    pub brick_size: usize,
    pub tlab_size: usize,
    /// Number of heaps; 0 means one per logical CPU.
    pub heap_count: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gen0_size: 1024 * 1024,
            gen1_size: 1024 * 1024,
            gen2_size: 2 * 1024 * 1024,
            loh_size: 2 * 1024 * 1024,
            large_object_threshold: 85_000,
            card_size: 256,
            brick_size: 2048,
            tlab_size: 32 * 1024,
            heap_count: 0,
        }
    }
}

impl GcConfig {
    pub fn with_heap_count(mut self, n: usize) -> Self {
        self.heap_count = n;
        self
    }

    pub(crate) fn resolved_heap_count(&self) -> usize {
        if self.heap_count != 0 {
            return self.heap_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_card_granule_is_at_least_64() {
        let config = GcConfig::default();
        assert!(config.card_size >= 64);
        assert_eq!(config.large_object_threshold, 85_000);
    }
}
