//! Runtime configuration for batch-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Tier capacities, channel backlog limits, duplicate policies and promotion
//! knobs all live here.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::tier::TierKind;

/// Command-line arguments for the workload simulator.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "batch-cache-sim",
    about = "Drive producers and consumers through a tiered cache machine"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "cache.json")]
    pub config: PathBuf,

    /// Number of concurrent producer tasks.
    #[arg(long, default_value_t = 4)]
    pub producers: usize,

    /// Batches added by each producer.
    #[arg(long, default_value_t = 64)]
    pub batches: usize,

    /// Rows per batch.
    #[arg(long, default_value_t = 4096)]
    pub rows: usize,

    /// Number of output channels the producers fan out to.
    #[arg(long, default_value_t = 2)]
    pub channels: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage tiers, fastest first.
    pub tiers: Vec<TierConfig>,

    /// Defaults for every channel.
    pub channels: ChannelConfig,

    /// Per-channel overrides keyed by channel name.
    pub channel_overrides: HashMap<String, ChannelConfig>,

    /// Promotion settings.
    pub promotion: PromotionConfig,

    /// Disk tier compression settings.
    pub compression: CompressionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig {
                    name: "device".to_string(),
                    kind: TierKind::Device,
                    capacity: 1024 * 1024 * 1024, // 1 GB
                    path: None,
                },
                TierConfig {
                    name: "host".to_string(),
                    kind: TierKind::Host,
                    capacity: 8 * 1024 * 1024 * 1024, // 8 GB
                    path: None,
                },
                TierConfig {
                    name: "disk".to_string(),
                    kind: TierKind::Disk,
                    capacity: 20 * 1024 * 1024 * 1024, // 20 GB
                    path: Some(PathBuf::from("/tmp/batch-cache")),
                },
            ],
            channels: ChannelConfig::default(),
            channel_overrides: HashMap::new(),
            promotion: PromotionConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// One storage tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Display name (e.g. "device").
    pub name: String,

    /// Storage medium.
    pub kind: TierKind,

    /// Capacity budget in bytes.
    pub capacity: u64,

    /// Spill directory; required for disk tiers.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// What happens when a producer reuses an identifier on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Identifiers are unique for the channel's lifetime.
    #[default]
    Reject,
    /// Duplicates coexist; identifier pulls take the oldest.
    Allow,
    /// A still-queued entry with the same identifier is replaced.
    Replace,
}

/// Per-channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum queued entries before `add` blocks (0 = unbounded).
    pub backlog_limit: usize,

    /// Duplicate identifier handling.
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backlog_limit: 0,
            duplicate_policy: DuplicatePolicy::Reject,
        }
    }
}

/// Promotion of entries back toward faster tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Move an entry into the fastest tier with free room before reading it.
    pub promote_on_pull: bool,

    /// After each pull, promote up to this many queued entries per channel
    /// (0 = disabled).
    pub prefetch_depth: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            promote_on_pull: false,
            prefetch_depth: 2,
        }
    }
}

/// Compression settings for the disk tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to disk.
    pub disk_zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            disk_zstd_compression: true,
            zstd_level: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration with the given (name, kind, capacity) tiers.
    pub fn with_tiers(tiers: &[(&str, TierKind, u64)]) -> Self {
        Self {
            tiers: tiers
                .iter()
                .map(|&(name, kind, capacity)| TierConfig {
                    name: name.to_string(),
                    kind,
                    capacity,
                    path: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Reject configurations the cache machine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tiers.is_empty() {
            anyhow::bail!("at least one storage tier is required");
        }
        for tier in &self.tiers {
            if tier.capacity == 0 {
                anyhow::bail!("tier '{}' has zero capacity", tier.name);
            }
            if tier.kind == TierKind::Disk && tier.path.is_none() {
                anyhow::bail!("disk tier '{}' needs a path", tier.name);
            }
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            anyhow::bail!("zstd_level must be within 1-22");
        }
        Ok(())
    }

    /// Effective settings for a channel.
    pub fn channel(&self, name: &str) -> ChannelConfig {
        self.channel_overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.channels.clone())
    }

    /// Total bytes across all tiers.
    pub fn total_capacity(&self) -> u64 {
        self.tiers.iter().map(|t| t.capacity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.tiers.len(), 3);
        assert_eq!(cfg.tiers[0].kind, TierKind::Device);
        assert_eq!(cfg.channels.duplicate_policy, DuplicatePolicy::Reject);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "tiers": [{"name": "a", "kind": "device", "capacity": 100}],
                "channel_overrides": {"join": {"duplicate_policy": "allow"}}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.tiers[0].capacity, 100);
        assert_eq!(cfg.channel("join").duplicate_policy, DuplicatePolicy::Allow);
        assert_eq!(cfg.channel("other").duplicate_policy, DuplicatePolicy::Reject);
        assert!(cfg.compression.disk_zstd_compression);
    }

    #[test]
    fn test_disk_tier_requires_path() {
        let cfg = Config::with_tiers(&[("d", TierKind::Disk, 10)]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_tiers_rejected() {
        let cfg = Config::with_tiers(&[]);
        assert!(cfg.validate().is_err());
    }
}
