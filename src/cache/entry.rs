//! Cache entries and the entry table.
//!
//! An entry is the bookkeeping record for one cached batch, independent of
//! where its bytes live. Entries are created on `add`, keep their identity
//! across promotion and demotion (only the tier index changes), and are
//! destroyed on pull or replacement.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::cache::error::CacheError;
use crate::cache::tier::TierId;

/// Machine-wide entry identifier. Allocated in arrival order, so a lower ID
/// was added earlier regardless of channel.
pub type EntryId = u64;

/// Metadata key that keeps an entry out of spill selection.
pub const PINNED_KEY: &str = "pinned";

/// Free-form key → value metadata attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata(BTreeMap<String, String>);

impl EntryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Metadata that marks the entry as never spillable.
    pub fn pinned() -> Self {
        Self::new().with(PINNED_KEY, "true")
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_pinned(&self) -> bool {
        self.get(PINNED_KEY) == Some("true")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EntryMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Bookkeeping record for one cached batch.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: EntryId,
    pub channel: String,
    pub identifier: String,
    /// Current tier. The only field that changes after creation.
    pub tier: TierId,
    pub byte_size: u64,
    /// Arrival order within the channel.
    pub sequence: u64,
    pub metadata: EntryMetadata,
    /// Marks the final batch of its channel.
    pub is_last: bool,
    /// In-flight writers/readers. Non-zero blocks any tier move.
    pub pins: u32,
}

impl CacheEntry {
    /// Whether spill selection may move this entry.
    pub fn is_spillable(&self) -> bool {
        self.pins == 0 && !self.metadata.is_pinned()
    }
}

/// What the caller supplies for a new entry; the table assigns ID and sequence.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub channel: String,
    pub identifier: String,
    pub tier: TierId,
    pub byte_size: u64,
    pub metadata: EntryMetadata,
    pub is_last: bool,
}

#[derive(Debug, Default)]
struct ChannelIndex {
    /// Live entries per identifier, oldest first.
    by_identifier: HashMap<String, BTreeSet<EntryId>>,
    /// Live entries by sequence number.
    by_sequence: BTreeMap<u64, EntryId>,
    next_sequence: u64,
}

/// Arena of live entries plus per-channel indexes.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: HashMap<EntryId, CacheEntry>,
    channels: HashMap<String, ChannelIndex>,
    next_id: EntryId,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry, pinned once for the caller that will write its bytes.
    ///
    /// Fails with `DuplicateIdentifier` when the identifier is live on the
    /// channel and `allow_duplicates` is false.
    pub fn insert(
        &mut self,
        new: NewEntry,
        allow_duplicates: bool,
    ) -> Result<&CacheEntry, CacheError> {
        let index = self.channels.entry(new.channel.clone()).or_default();
        let live = index
            .by_identifier
            .get(&new.identifier)
            .is_some_and(|ids| !ids.is_empty());
        if live && !allow_duplicates {
            return Err(CacheError::DuplicateIdentifier {
                channel: new.channel,
                identifier: new.identifier,
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let sequence = index.next_sequence;
        index.next_sequence += 1;

        index
            .by_identifier
            .entry(new.identifier.clone())
            .or_default()
            .insert(id);
        index.by_sequence.insert(sequence, id);

        let entry = CacheEntry {
            id,
            channel: new.channel,
            identifier: new.identifier,
            tier: new.tier,
            byte_size: new.byte_size,
            sequence,
            metadata: new.metadata,
            is_last: new.is_last,
            pins: 1,
        };
        Ok(self.entries.entry(id).or_insert(entry))
    }

    /// Remove an entry. Removing an absent entry is an invariant violation.
    pub fn remove(&mut self, id: EntryId) -> Result<CacheEntry, CacheError> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| CacheError::CorruptEntry(format!("entry {id} removed twice")))?;

        if let Some(index) = self.channels.get_mut(&entry.channel) {
            index.by_sequence.remove(&entry.sequence);
            if let Some(ids) = index.by_identifier.get_mut(&entry.identifier) {
                ids.remove(&id);
                if ids.is_empty() {
                    index.by_identifier.remove(&entry.identifier);
                }
            }
        }
        Ok(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    /// Look up an entry that must exist.
    pub fn expect(&self, id: EntryId) -> Result<&CacheEntry, CacheError> {
        self.entries
            .get(&id)
            .ok_or_else(|| CacheError::CorruptEntry(format!("entry {id} missing from table")))
    }

    fn expect_mut(&mut self, id: EntryId) -> Result<&mut CacheEntry, CacheError> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| CacheError::CorruptEntry(format!("entry {id} missing from table")))
    }

    /// Change an entry's tier. Capacity must already be reserved at `tier`.
    pub fn set_tier(&mut self, id: EntryId, tier: TierId) -> Result<(), CacheError> {
        self.expect_mut(id)?.tier = tier;
        Ok(())
    }

    pub fn pin(&mut self, id: EntryId) -> Result<(), CacheError> {
        self.expect_mut(id)?.pins += 1;
        Ok(())
    }

    pub fn unpin(&mut self, id: EntryId) -> Result<(), CacheError> {
        let entry = self.expect_mut(id)?;
        if entry.pins == 0 {
            return Err(CacheError::CorruptEntry(format!("entry {id} unpinned while not pinned")));
        }
        entry.pins -= 1;
        Ok(())
    }

    /// Oldest live entry with `identifier` on `channel`.
    pub fn oldest_live(&self, channel: &str, identifier: &str) -> Option<EntryId> {
        self.channels
            .get(channel)?
            .by_identifier
            .get(identifier)?
            .first()
            .copied()
    }

    pub fn contains_identifier(&self, channel: &str, identifier: &str) -> bool {
        self.oldest_live(channel, identifier).is_some()
    }

    /// The first `limit` live entries of a channel in sequence order.
    pub fn head(&self, channel: &str, limit: usize) -> Vec<&CacheEntry> {
        self.channels
            .get(channel)
            .map(|index| {
                index
                    .by_sequence
                    .values()
                    .filter_map(|id| self.entries.get(id))
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn in_tier(&self, tier: TierId) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values().filter(move |e| e.tier == tier)
    }

    /// Bytes in `tier` that spill selection is allowed to move.
    pub fn spillable_bytes(&self, tier: TierId) -> u64 {
        self.in_tier(tier)
            .filter(|e| e.is_spillable())
            .map(|e| e.byte_size)
            .sum()
    }

    /// Sum of entry sizes in `tier`.
    pub fn bytes_in_tier(&self, tier: TierId) -> u64 {
        self.in_tier(tier).map(|e| e.byte_size).sum()
    }

    pub fn count_in_tier(&self, tier: TierId) -> usize {
        self.in_tier(tier).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(channel: &str, identifier: &str, size: u64) -> NewEntry {
        NewEntry {
            channel: channel.into(),
            identifier: identifier.into(),
            tier: 0,
            byte_size: size,
            metadata: EntryMetadata::new(),
            is_last: false,
        }
    }

    #[test]
    fn test_sequence_is_per_channel() {
        let mut table = EntryTable::new();
        let a0 = table.insert(new_entry("a", "x", 1), false).unwrap().sequence;
        let b0 = table.insert(new_entry("b", "x", 1), false).unwrap().sequence;
        let a1 = table.insert(new_entry("a", "y", 1), false).unwrap().sequence;

        assert_eq!((a0, b0, a1), (0, 0, 1));
    }

    #[test]
    fn test_duplicate_identifier_policy() {
        let mut table = EntryTable::new();
        table.insert(new_entry("c", "x", 1), false).unwrap();

        let err = table.insert(new_entry("c", "x", 1), false).unwrap_err();
        assert!(matches!(err, CacheError::DuplicateIdentifier { .. }));

        let dup = table.insert(new_entry("c", "x", 1), true).unwrap().id;
        assert_eq!(table.oldest_live("c", "x"), Some(0));
        assert_eq!(dup, 1);
    }

    #[test]
    fn test_remove_twice_is_corruption() {
        let mut table = EntryTable::new();
        let id = table.insert(new_entry("c", "x", 10), false).unwrap().id;

        let entry = table.remove(id).unwrap();
        assert_eq!(entry.identifier, "x");
        assert!(!table.contains_identifier("c", "x"));

        let err = table.remove(id).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_pins_block_spilling() {
        let mut table = EntryTable::new();
        let id = table.insert(new_entry("c", "x", 10), false).unwrap().id;
        assert_eq!(table.spillable_bytes(0), 0); // pinned for the writer

        table.unpin(id).unwrap();
        assert_eq!(table.spillable_bytes(0), 10);
        assert!(table.unpin(id).is_err());
    }

    #[test]
    fn test_metadata_pinned_entry_never_spillable() {
        let mut table = EntryTable::new();
        let mut entry = new_entry("c", "x", 10);
        entry.metadata = EntryMetadata::pinned();
        let id = table.insert(entry, false).unwrap().id;
        table.unpin(id).unwrap();

        assert_eq!(table.spillable_bytes(0), 0);
    }

    #[test]
    fn test_head_in_sequence_order() {
        let mut table = EntryTable::new();
        for name in ["a", "b", "c"] {
            table.insert(new_entry("c", name, 1), false).unwrap();
        }
        let first = table.remove(0).unwrap();
        assert_eq!(first.identifier, "a");

        let head: Vec<_> = table.head("c", 5).iter().map(|e| e.identifier.clone()).collect();
        assert_eq!(head, vec!["b", "c"]);
    }
}
