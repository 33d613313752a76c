//! Cache configuration

use std::time::Duration;

/// Configuration for a cache node
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a write waits for a contended key lock
    pub lock_acquisition_timeout: Duration,

    /// Number of members owning each key in distributed mode
    pub num_owners: usize,

    /// Seed for the key placement hash
    pub hash_seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_acquisition_timeout: Duration::from_secs(10),
            num_owners: 2,
            hash_seed: 0,
        }
    }
}

impl CacheConfig {
    /// Create a new config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock acquisition timeout
    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    /// Set the number of owners per key
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners.max(1);
        self
    }

    /// Set the placement hash seed
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }
}
