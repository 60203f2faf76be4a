//! Approximate trace-id membership set.
//!
//! Gates emission of trace-id index rows: each observed trace id should
//! produce exactly one index entry. The set is byte-bounded and evicting,
//! so a false negative after eviction costs one duplicate index row, which
//! the read path tolerates. Nothing survives a restart.

use moka::sync::Cache;

/// Default byte budget of the dedup set.
pub const DEFAULT_DEDUP_CAPACITY_BYTES: u64 = 32 * 1024 * 1024;

/// Thread-safe, size-bounded set of recently seen trace ids.
pub struct TraceIdDedup {
    cache: Cache<Box<[u8]>, ()>,
}

impl TraceIdDedup {
    /// Create a set bounded to roughly `capacity_bytes` of key data.
    pub fn new(capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .weigher(|key: &Box<[u8]>, _: &()| key.len() as u32)
            .max_capacity(capacity_bytes)
            .build();
        Self { cache }
    }

    pub fn has(&self, trace_id: &str) -> bool {
        self.cache.contains_key(trace_id.as_bytes())
    }

    pub fn insert(&self, trace_id: &str) {
        self.cache
            .insert(trace_id.as_bytes().to_vec().into_boxed_slice(), ());
    }
}

impl Default for TraceIdDedup {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY_BYTES)
    }
}
