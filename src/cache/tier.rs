//! Storage tier definitions and capacity ledgers.
//!
//! Tiers are ranked by their position in the configured list (0 = fastest).
//! A ledger tracks how many bytes of a tier's capacity are reserved.

use serde::{Deserialize, Serialize};

use crate::cache::error::CacheError;

/// Index of a tier in the machine's ordered tier list (lower = faster).
pub type TierId = usize;

/// The medium a tier lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Accelerator memory (hot).
    Device,
    /// Host RAM (warm).
    Host,
    /// Local disk (cold).
    Disk,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Device => write!(f, "DEVICE"),
            TierKind::Host => write!(f, "HOST"),
            TierKind::Disk => write!(f, "DISK"),
        }
    }
}

/// Capacity bookkeeping for a single tier.
#[derive(Debug, Clone)]
pub struct TierLedger {
    name: String,
    kind: TierKind,
    capacity: u64,
    used: u64,
}

impl TierLedger {
    pub fn new(name: impl Into<String>, kind: TierKind, capacity: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            capacity,
            used: 0,
        }
    }

    /// Reserve `bytes` if they fit. Never lets `used` exceed `capacity`.
    pub fn try_reserve(&mut self, bytes: u64) -> bool {
        if bytes > self.free() {
            return false;
        }
        self.used += bytes;
        true
    }

    /// Return previously reserved bytes.
    pub fn release(&mut self, bytes: u64) -> Result<(), CacheError> {
        if bytes > self.used {
            return Err(CacheError::CorruptEntry(format!(
                "tier '{}' released {bytes} bytes with only {} reserved",
                self.name, self.used
            )));
        }
        self.used -= bytes;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn free(&self) -> u64 {
        self.capacity - self.used
    }
}

/// Point-in-time view of one tier, for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub name: String,
    pub kind: TierKind,
    /// Capacity budget in bytes.
    pub capacity: u64,
    /// Total bytes reserved in this tier.
    pub bytes_used: u64,
    /// Number of entries resident in this tier.
    pub entry_count: usize,
}

impl TierStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }
}
