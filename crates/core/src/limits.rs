//! Operational limits and tunable constants
//!
//! Every limit the engine enforces lives here, with the documented
//! defaults. Implementations of the KV contract and the engine both take
//! a `KvLimits` at construction time; tests shrink them with
//! [`KvLimits::with_small_limits`] to exercise splitting and segmentation
//! without building megabyte values.

use std::time::Duration;

/// Estimated byte cost of a `set` mutation, beyond its key.
pub const MUTATION_SET_OVERHEAD: usize = 67;
/// Estimated byte cost of a `delete`, numeric, or `check` operation.
pub const MUTATION_SMALL_OVERHEAD: usize = 3;
/// Estimated byte cost of an `enqueue` mutation, before per-key costs.
pub const MUTATION_ENQUEUE_OVERHEAD: usize = 96;

/// Tunable operational constants.
#[derive(Debug, Clone)]
pub struct KvLimits {
    /// Maximum mutations in one atomic commit (default: 1000).
    pub atomic_mutation_limit: usize,

    /// Maximum versionstamp checks in one atomic commit (default: 100).
    pub atomic_check_limit: usize,

    /// Maximum estimated payload bytes in one atomic commit
    /// (default: 800 KiB).
    pub atomic_size_limit: usize,

    /// Maximum accumulated key bytes in one atomic commit
    /// (default: 80 KiB).
    pub atomic_key_size_limit: usize,

    /// Maximum keys per `get_many` call (default: 10).
    pub get_many_key_limit: usize,

    /// Maximum byte length of a single stored value chunk
    /// (default: 64 KiB). Encoded documents are segmented at this size.
    pub value_byte_limit: usize,

    /// Queue redelivery backoff, milliseconds per attempt
    /// (default: 100, 200, 400, 800, 1600).
    pub queue_backoff_schedule: Vec<u64>,

    /// Lower clamp for an interval scheduler's first delivery
    /// (default: 1 s) so the listener is registered before delivery.
    pub min_interval_start_delay: Duration,

    /// Lower clamp for a loop scheduler's first delivery (default: 1 s).
    pub min_loop_start_delay: Duration,
}

impl Default for KvLimits {
    fn default() -> Self {
        KvLimits {
            atomic_mutation_limit: 1000,
            atomic_check_limit: 100,
            atomic_size_limit: 800 * 1024,
            atomic_key_size_limit: 80 * 1024,
            get_many_key_limit: 10,
            value_byte_limit: 64 * 1024,
            queue_backoff_schedule: vec![100, 200, 400, 800, 1600],
            min_interval_start_delay: Duration::from_secs(1),
            min_loop_start_delay: Duration::from_secs(1),
        }
    }
}

impl KvLimits {
    /// Small limits for tests that exercise batch splitting and value
    /// segmentation without large inputs.
    pub fn with_small_limits() -> Self {
        KvLimits {
            atomic_mutation_limit: 10,
            atomic_check_limit: 4,
            atomic_size_limit: 2048,
            atomic_key_size_limit: 512,
            get_many_key_limit: 3,
            value_byte_limit: 64,
            queue_backoff_schedule: vec![10, 20],
            min_interval_start_delay: Duration::from_millis(10),
            min_loop_start_delay: Duration::from_millis(10),
        }
    }
}
