//! Tiered batch cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`tier`]: Tier kinds and per-tier byte ledgers
//! - [`allocator`]: Capacity reservation across the ordered tiers
//! - [`entry`]: Cache entries, metadata and the entry table
//! - [`evictor`]: Spill victim selection (oldest unpinned first)
//! - [`prefetcher`]: Promotion of entries consumers will pull next
//! - [`queue`]: Per-channel waitable FIFO queues
//! - [`machine`]: The cache machine tying it all together
//! - [`metrics`]: Prometheus counters and gauges

pub mod allocator;
pub mod entry;
pub mod error;
pub mod evictor;
pub mod machine;
pub mod metrics;
pub mod prefetcher;
pub mod queue;
pub mod tier;
