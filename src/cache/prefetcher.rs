//! Prefetching: promotes entries that consumers are about to pull.
//!
//! FIFO consumers take the head of each channel next, so those entries are
//! the ones worth pulling back out of slow tiers. Promotions only use free
//! capacity; the prefetcher never spills anything to make room.

use crate::cache::entry::{EntryId, EntryTable};
use crate::cache::tier::TierId;
use crate::config::PromotionConfig;

/// A promotion request: move an entry from its current tier toward tier 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    pub entry_id: EntryId,
    pub current_tier: TierId,
    pub byte_size: u64,
}

pub struct Prefetcher {
    config: PromotionConfig,
}

impl Prefetcher {
    pub fn new(config: PromotionConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.prefetch_depth > 0
    }

    /// Entries at the head of each channel that sit below tier 0, oldest
    /// first. Entries being read or written are skipped.
    pub fn compute_requests(&self, table: &EntryTable) -> Vec<PromotionRequest> {
        if !self.enabled() {
            return Vec::new();
        }

        let mut requests: Vec<PromotionRequest> = table
            .channel_names()
            .flat_map(|channel| table.head(channel, self.config.prefetch_depth))
            .filter(|e| e.tier > 0 && e.pins == 0)
            .map(|e| PromotionRequest {
                entry_id: e.id,
                current_tier: e.tier,
                byte_size: e.byte_size,
            })
            .collect();

        requests.sort_by_key(|r| r.entry_id);
        requests
    }
}
