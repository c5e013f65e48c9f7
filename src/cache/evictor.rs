//! Spill policy: decides which entries leave a tier when it runs out of room.
//!
//! Nothing has been consumed yet at spill time, so recency of use carries no
//! signal. Entries are ranked by arrival instead: the oldest entry in the
//! tier is spilled first. Pinned entries are never candidates.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::cache::entry::{CacheEntry, EntryId};
use crate::cache::tier::TierId;

/// A spill candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillCandidate {
    pub entry_id: EntryId,
    pub byte_size: u64,
    pub current_tier: TierId,
}

// Lower entry ID = earlier arrival = spilled first.
impl Ord for SpillCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        Reverse(self.entry_id).cmp(&Reverse(other.entry_id))
    }
}

impl PartialOrd for SpillCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Select entries from `tier`, oldest first, until their combined size
    /// covers `bytes_needed`. May return less than needed when the tier does
    /// not hold enough spillable data.
    pub fn select_victims<'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry>,
        tier: TierId,
        bytes_needed: u64,
    ) -> Vec<SpillCandidate> {
        let mut heap: BinaryHeap<SpillCandidate> = entries
            .filter(|e| e.tier == tier && e.is_spillable())
            .map(|e| SpillCandidate {
                entry_id: e.id,
                byte_size: e.byte_size,
                current_tier: e.tier,
            })
            .collect();

        let mut victims = Vec::new();
        let mut covered = 0u64;
        while covered < bytes_needed {
            match heap.pop() {
                Some(candidate) => {
                    covered += candidate.byte_size;
                    victims.push(candidate);
                }
                None => break,
            }
        }
        victims
    }
}
