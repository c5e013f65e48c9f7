//! Tier allocator: capacity reservation across the ordered tier list.
//!
//! The allocator only answers "does it fit" questions. Making room by
//! spilling needs the entry table and the stores, so the cache machine
//! drives that and comes back here to reserve.

use tracing::trace;

use crate::cache::error::CacheError;
use crate::cache::tier::{TierId, TierLedger};

#[derive(Debug)]
pub struct TierAllocator {
    /// Ledgers ordered fastest → slowest.
    tiers: Vec<TierLedger>,
}

impl TierAllocator {
    pub fn new(tiers: Vec<TierLedger>) -> Self {
        Self { tiers }
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn ledger(&self, tier: TierId) -> &TierLedger {
        &self.tiers[tier]
    }

    pub fn ledgers(&self) -> &[TierLedger] {
        &self.tiers
    }

    pub fn free(&self, tier: TierId) -> u64 {
        self.tiers[tier].free()
    }

    /// Atomically (under the machine lock) reserve `bytes` in `tier`.
    pub fn try_reserve(&mut self, tier: TierId, bytes: u64) -> bool {
        let ok = self.tiers[tier].try_reserve(bytes);
        trace!(tier, bytes, ok, "Reserve");
        ok
    }

    pub fn release(&mut self, tier: TierId, bytes: u64) -> Result<(), CacheError> {
        trace!(tier, bytes, "Release");
        self.tiers[tier].release(bytes)
    }

    /// Reserve in the fastest tier strictly faster than `below` with free room.
    pub fn reserve_faster_than(&mut self, below: TierId, bytes: u64) -> Option<TierId> {
        (0..below.min(self.tiers.len())).find(|&tier| self.try_reserve(tier, bytes))
    }

    /// Whether any tier could ever hold `bytes`, even when empty.
    pub fn can_ever_fit(&self, bytes: u64) -> bool {
        self.tiers.iter().any(|t| t.capacity() >= bytes)
    }

    /// Whether `tier` is the slowest tier.
    pub fn is_slowest(&self, tier: TierId) -> bool {
        tier + 1 >= self.tiers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tier::TierKind;

    fn allocator() -> TierAllocator {
        TierAllocator::new(vec![
            TierLedger::new("device", TierKind::Device, 100),
            TierLedger::new("host", TierKind::Host, 1000),
        ])
    }

    #[test]
    fn test_try_reserve_and_release() {
        let mut alloc = allocator();
        assert!(alloc.try_reserve(0, 60));
        assert!(!alloc.try_reserve(0, 60));
        assert_eq!(alloc.free(0), 40);
        alloc.release(0, 60).unwrap();
        assert_eq!(alloc.free(0), 100);
    }

    #[test]
    fn test_reserve_faster_than() {
        let mut alloc = allocator();
        assert_eq!(alloc.reserve_faster_than(1, 50), Some(0));
        assert_eq!(alloc.reserve_faster_than(1, 60), None);
        assert_eq!(alloc.reserve_faster_than(0, 1), None);
    }

    #[test]
    fn test_can_ever_fit() {
        let alloc = allocator();
        assert!(alloc.can_ever_fit(1000));
        assert!(!alloc.can_ever_fit(1001));
        assert!(alloc.is_slowest(1));
        assert!(!alloc.is_slowest(0));
    }
}
