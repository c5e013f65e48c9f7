//! Prometheus metrics for a cache machine instance.
//!
//! Each instance owns its own registry so several machines (and tests) can
//! coexist in one process.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::entry::EntryTable;
use crate::cache::tier::TierLedger;

pub struct CacheMetrics {
    registry: Registry,
    batches_added: IntCounterVec,
    batches_pulled: IntCounterVec,
    spills: IntCounterVec,
    promotions: IntCounterVec,
    capacity_exhausted: IntCounter,
    tier_used_bytes: IntGaugeVec,
    tier_entries: IntGaugeVec,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("batch_cache".to_string()), None)?;

        let batches_added = IntCounterVec::new(
            Opts::new("batches_added_total", "Batches accepted by add"),
            &["channel"],
        )?;
        let batches_pulled = IntCounterVec::new(
            Opts::new("batches_pulled_total", "Batches delivered to consumers"),
            &["channel"],
        )?;
        let spills = IntCounterVec::new(
            Opts::new("spills_total", "Entries demoted to a slower tier"),
            &["from", "to"],
        )?;
        let promotions = IntCounterVec::new(
            Opts::new("promotions_total", "Entries promoted to a faster tier"),
            &["from", "to"],
        )?;
        let capacity_exhausted = IntCounter::new(
            "capacity_exhausted_total",
            "Adds rejected because no tier could hold the batch",
        )?;
        let tier_used_bytes = IntGaugeVec::new(
            Opts::new("tier_used_bytes", "Bytes reserved per tier"),
            &["tier"],
        )?;
        let tier_entries = IntGaugeVec::new(
            Opts::new("tier_entries", "Entries resident per tier"),
            &["tier"],
        )?;

        registry.register(Box::new(batches_added.clone()))?;
        registry.register(Box::new(batches_pulled.clone()))?;
        registry.register(Box::new(spills.clone()))?;
        registry.register(Box::new(promotions.clone()))?;
        registry.register(Box::new(capacity_exhausted.clone()))?;
        registry.register(Box::new(tier_used_bytes.clone()))?;
        registry.register(Box::new(tier_entries.clone()))?;

        Ok(Self {
            registry,
            batches_added,
            batches_pulled,
            spills,
            promotions,
            capacity_exhausted,
            tier_used_bytes,
            tier_entries,
        })
    }

    pub fn record_add(&self, channel: &str) {
        self.batches_added.with_label_values(&[channel]).inc();
    }

    pub fn record_pull(&self, channel: &str) {
        self.batches_pulled.with_label_values(&[channel]).inc();
    }

    pub fn record_spill(&self, from: &str, to: &str) {
        self.spills.with_label_values(&[from, to]).inc();
    }

    pub fn record_promotion(&self, from: &str, to: &str) {
        self.promotions.with_label_values(&[from, to]).inc();
    }

    pub fn record_capacity_exhausted(&self) {
        self.capacity_exhausted.inc();
    }

    /// Refresh the per-tier gauges from the ledgers and entry table.
    pub fn observe_tiers(&self, ledgers: &[TierLedger], table: &EntryTable) {
        for (tier, ledger) in ledgers.iter().enumerate() {
            self.tier_used_bytes
                .with_label_values(&[ledger.name()])
                .set(ledger.used() as i64);
            self.tier_entries
                .with_label_values(&[ledger.name()])
                .set(table.count_in_tier(tier) as i64);
        }
    }

    pub fn spills_between(&self, from: &str, to: &str) -> u64 {
        self.spills.with_label_values(&[from, to]).get()
    }

    pub fn promotions_between(&self, from: &str, to: &str) -> u64 {
        self.promotions.with_label_values(&[from, to]).get()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tier::TierKind;

    #[test]
    fn test_render_contains_counters() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.record_add("join");
        metrics.record_spill("device", "host");
        metrics.observe_tiers(
            &[TierLedger::new("device", TierKind::Device, 10)],
            &EntryTable::new(),
        );

        let text = metrics.render().unwrap();
        assert!(text.contains("batch_cache_batches_added_total{channel=\"join\"} 1"));
        assert!(text.contains("batch_cache_tier_used_bytes{tier=\"device\"} 0"));
        assert_eq!(metrics.spills_between("device", "host"), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = CacheMetrics::new().unwrap();
        let b = CacheMetrics::new().unwrap();
        a.record_pull("c");
        assert!(!b.render().unwrap().contains("batches_pulled_total{"));
    }
}
