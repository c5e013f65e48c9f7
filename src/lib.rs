//! batch-cache-tier: tiered cache machine for intermediate query batches.
//!
//! Buffers tabular batches flowing between query operators so producers and
//! consumers never have to run in lockstep. Batches are placed in the fastest
//! storage tier with room and spilled down the hierarchy under pressure:
//!   Accelerator memory (hot) → Host memory (warm) → Local disk (cold)
//!
//! Consumers pull by identifier or in arrival order, blocking until a batch
//! arrives or the producer signals end-of-stream.

pub mod batch;
pub mod cache;
pub mod config;
pub mod store;

pub use batch::{Column, DataType, TabularBatch};
pub use cache::error::{CacheError, Result};
pub use cache::machine::{CacheMachine, PulledBatch};
