//! Observability snapshots.
//!
//! Snapshots are taken under a shared control-region lock, so each one is
//! internally consistent; successive snapshots may of course disagree.

use crate::time::Timestamp;

/// Point-in-time queue statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStats {
    /// Product capacity the queue was created with.
    pub capacity: u64,
    /// Products currently resident.
    pub product_count: u64,
    /// Free regions in the data segment.
    pub free_count: u64,
    /// Unused region-table slots.
    pub empty_count: u64,
    /// Data bytes held by resident products.
    pub bytes_used: u64,
    /// Total data-segment bytes.
    pub bytes_total: u64,
    /// Largest free extent; an insert needing more must evict.
    pub max_free_extent: u64,
    /// High-water mark of resident products.
    pub max_products: u64,
    /// High-water mark of data bytes in use.
    pub highwater_bytes: u64,
    /// High-water mark of free regions.
    pub max_free_regions: u64,
    /// Low-water mark of empty region-table slots.
    pub min_empty_slots: u64,
    /// Age of the oldest resident product, as a duration.
    pub age_oldest: Option<Timestamp>,
    /// Whether the queue has ever evicted a product.
    pub is_full: bool,
}

/// The minimum-virtual-residence-time sample: the shortest time any
/// evicted product spent in the queue, with the occupancy observed when
/// that minimum was recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct MvrtMetrics {
    /// The minimum residence time, as a duration. `None` until the first
    /// eviction (or after a clear).
    pub min_virt_res_time: Option<Timestamp>,
    /// Data bytes in use when the sample was taken.
    pub bytes_used: u64,
    /// Products resident when the sample was taken.
    pub slots_used: u64,
}
