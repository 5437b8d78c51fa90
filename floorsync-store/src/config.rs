//! Store configuration, fixed at construction time.

use std::time::Duration;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long an optimistic edit may stay visible without a server answer
    /// (default: 10s)
    pub mutation_timeout: Duration,
    /// How many resolved transaction ids to remember after pruning, so late
    /// acknowledgements are recognized (default: 1024)
    pub retired_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mutation_timeout: Duration::from_secs(10),
            retired_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Short timeout and a small ledger, for tests.
    pub fn for_testing() -> Self {
        Self {
            mutation_timeout: Duration::from_millis(200),
            retired_capacity: 16,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }
}
