//! Cache machine: the coordinator between producers, consumers and tiers.
//!
//! The machine:
//! - Places each added batch in the fastest tier with room, spilling older
//!   entries down the hierarchy when needed
//! - Hands entries to consumers through one waitable queue per channel
//! - Materializes and destroys entries on pull, optionally promoting first
//! - Keeps tier accounting and the entry table consistent under one lock
//!
//! Lock order is state lock → queue lock. Queue waits never hold the state
//! lock, so independent channels only contend on capacity reservation.
//!
//! Work that touches the state lock and the stores runs on spawned tasks
//! sharing one `MachineCore`, so it always completes even when the caller's
//! future is dropped. A dropped `add` rolls its entry back; a dropped pull
//! returns its claimed slot to the queue.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::TabularBatch;
use crate::cache::allocator::TierAllocator;
use crate::cache::entry::{CacheEntry, EntryId, EntryMetadata, EntryTable, NewEntry};
use crate::cache::error::{CacheError, Result};
use crate::cache::evictor::Evictor;
use crate::cache::metrics::CacheMetrics;
use crate::cache::prefetcher::Prefetcher;
use crate::cache::queue::{ChannelState, Lookup, QueueError, Slot, WaitableQueue};
use crate::cache::tier::{TierId, TierKind, TierLedger, TierStats};
use crate::config::{Config, DuplicatePolicy};
use crate::store::disk::DiskStore;
use crate::store::memory::MemoryStore;
use crate::store::TierStore;

/// A batch handed to a consumer, with the bookkeeping it travelled with.
#[derive(Debug, Clone)]
pub struct PulledBatch {
    pub identifier: String,
    pub sequence: u64,
    pub metadata: EntryMetadata,
    pub is_last: bool,
    pub batch: TabularBatch,
}

/// Everything guarded by the machine's single state lock.
struct MachineState {
    table: EntryTable,
    allocator: TierAllocator,
}

/// State shared between the machine and its background tasks.
struct MachineCore {
    config: Arc<Config>,

    state: Mutex<MachineState>,

    /// One store per tier, same order as the ledgers.
    stores: Vec<Arc<dyn TierStore>>,

    evictor: Evictor,

    prefetcher: Prefetcher,

    metrics: CacheMetrics,

    /// Set once an invariant violation has been observed.
    poisoned: AtomicBool,
}

/// A batch on its way into the cache.
struct AddRequest {
    identifier: String,
    batch: TabularBatch,
    metadata: EntryMetadata,
    is_last: bool,
}

type ReadOutcome = Result<(TierId, TabularBatch)>;

pub struct CacheMachine {
    core: Arc<MachineCore>,

    /// Disk stores again, for cleanup on shutdown.
    disk_stores: Vec<Arc<DiskStore>>,

    channels: RwLock<HashMap<String, Arc<WaitableQueue>>>,

    /// Next channel index `wait_for_any` starts scanning from.
    round_robin: AtomicUsize,
}

impl CacheMachine {
    /// Build a cache machine with the configured tiers.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;

        let mut stores: Vec<Arc<dyn TierStore>> = Vec::with_capacity(config.tiers.len());
        let mut disk_stores = Vec::new();
        for tier in &config.tiers {
            match tier.kind {
                TierKind::Device | TierKind::Host => {
                    stores.push(Arc::new(MemoryStore::new(tier.kind)));
                }
                TierKind::Disk => {
                    let path = tier.path.as_deref().ok_or_else(|| {
                        CacheError::InvalidConfig(format!("disk tier '{}' needs a path", tier.name))
                    })?;
                    let store = Arc::new(DiskStore::new(path, config.compression.clone()).await?);
                    disk_stores.push(store.clone());
                    stores.push(store);
                }
            }
        }

        let ledgers = config
            .tiers
            .iter()
            .map(|t| TierLedger::new(t.name.clone(), t.kind, t.capacity))
            .collect();

        for (rank, tier) in config.tiers.iter().enumerate() {
            info!(rank, name = %tier.name, kind = %tier.kind, capacity = tier.capacity, "Tier configured");
        }

        let core = MachineCore {
            state: Mutex::new(MachineState {
                table: EntryTable::new(),
                allocator: TierAllocator::new(ledgers),
            }),
            stores,
            evictor: Evictor::new(),
            prefetcher: Prefetcher::new(config.promotion.clone()),
            metrics: CacheMetrics::new()?,
            poisoned: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            core: Arc::new(core),
            disk_stores,
            channels: RwLock::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
        })
    }

    // ─── Producer surface ──────────────────────────────────────────────────

    /// Cache `batch` on `channel` under `identifier`.
    ///
    /// Blocks while the channel is at its backlog limit. When `is_last` is set
    /// the channel is marked finished after the push. May spill unrelated
    /// entries to slower tiers to make room.
    ///
    /// Dropping the returned future abandons the add: an entry still waiting
    /// for backlog room is rolled back.
    pub async fn add(
        &self,
        channel: &str,
        identifier: impl Into<String>,
        batch: TabularBatch,
        metadata: EntryMetadata,
        is_last: bool,
    ) -> Result<()> {
        let request = AddRequest {
            identifier: identifier.into(),
            batch,
            metadata,
            is_last,
        };
        self.add_inner(channel, request, None)
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// [`CacheMachine::add`] that gives up with `Cancelled` when `cancel`
    /// fires while waiting for backlog room, rolling the entry back.
    pub async fn add_cancellable(
        &self,
        channel: &str,
        identifier: impl Into<String>,
        batch: TabularBatch,
        metadata: EntryMetadata,
        is_last: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = AddRequest {
            identifier: identifier.into(),
            batch,
            metadata,
            is_last,
        };
        self.add_inner(channel, request, Some(cancel))
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// Stop accepting batches on `channel`. Idempotent.
    pub fn mark_finished(&self, channel: &str) {
        finish_channel(&self.channel(channel));
    }

    async fn add_inner(
        &self,
        channel: &str,
        request: AddRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.core.ensure_usable()?;
        let queue = self.channel(channel);

        // Dropping this future cancels the task's backlog wait.
        let token = cancel
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new);
        let _abandon = token.clone().drop_guard();

        let core = self.core.clone();
        tokio::spawn(async move { core.add_entry(queue, request, token).await })
            .await
            .map_err(task_failed)?
    }

    // ─── Consumer surface ──────────────────────────────────────────────────

    /// Pull the oldest batch on `channel`, blocking until one arrives.
    /// Returns `None` once the channel is finished and empty.
    pub async fn pull_next(&self, channel: &str) -> Result<Option<TabularBatch>> {
        Ok(self.pull_next_entry(channel).await?.map(|p| p.batch))
    }

    /// [`CacheMachine::pull_next`] returning the entry's bookkeeping too.
    pub async fn pull_next_entry(&self, channel: &str) -> Result<Option<PulledBatch>> {
        self.pull_next_inner(channel, None)
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// [`CacheMachine::pull_next_entry`] that gives up with `Cancelled` when
    /// `cancel` fires while waiting.
    pub async fn pull_next_cancellable(
        &self,
        channel: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PulledBatch>> {
        self.pull_next_inner(channel, Some(cancel))
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// Pull the oldest queued batch without waiting. `None` means nothing is
    /// queued right now, whether or not the channel is finished.
    pub async fn try_pull_next(&self, channel: &str) -> Result<Option<PulledBatch>> {
        self.try_pull_next_inner(channel)
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// Pull the batch added under `identifier`, blocking until it arrives.
    /// Fails with `NotFound` once the channel can no longer produce it.
    pub async fn pull_by_identifier(&self, channel: &str, identifier: &str) -> Result<TabularBatch> {
        Ok(self.pull_entry_by_identifier(channel, identifier).await?.batch)
    }

    /// [`CacheMachine::pull_by_identifier`] returning the entry's bookkeeping too.
    pub async fn pull_entry_by_identifier(
        &self,
        channel: &str,
        identifier: &str,
    ) -> Result<PulledBatch> {
        self.pull_by_identifier_inner(channel, identifier, None)
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// [`CacheMachine::pull_entry_by_identifier`] that gives up with
    /// `Cancelled` when `cancel` fires while waiting.
    pub async fn pull_by_identifier_cancellable(
        &self,
        channel: &str,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<PulledBatch> {
        self.pull_by_identifier_inner(channel, identifier, Some(cancel))
            .await
            .map_err(|e| self.core.poison(e))
    }

    /// FIFO pulls as a stream. Ends when the channel drains or after the
    /// first error.
    pub fn stream<'a>(
        &'a self,
        channel: &'a str,
    ) -> impl Stream<Item = Result<TabularBatch>> + 'a {
        futures::stream::unfold(false, move |failed| async move {
            if failed {
                return None;
            }
            match self.pull_next(channel).await {
                Ok(Some(batch)) => Some((Ok(batch), false)),
                Ok(None) => None,
                Err(e) => Some((Err(e), true)),
            }
        })
    }

    /// Block until one of `channels` has a queued entry, returning its index,
    /// or `None` once every channel is drained. Simultaneously ready channels
    /// are served round-robin.
    ///
    /// The result is a hint: another consumer may take the entry first.
    pub async fn wait_for_any(&self, channels: &[&str]) -> Result<Option<usize>> {
        self.core.ensure_usable()?;
        if channels.is_empty() {
            return Ok(None);
        }
        let queues: Vec<_> = channels.iter().map(|c| self.channel(c)).collect();

        loop {
            let mut notified: Vec<Pin<Box<_>>> =
                queues.iter().map(|q| Box::pin(q.notified())).collect();
            for n in notified.iter_mut() {
                n.as_mut().enable();
            }

            let start = self.round_robin.load(Ordering::Relaxed) % queues.len();
            let mut all_drained = true;
            for offset in 0..queues.len() {
                let idx = (start + offset) % queues.len();
                match queues[idx].state() {
                    ChannelState::Drained => {}
                    _ if !queues[idx].is_empty() => {
                        self.round_robin.store(idx + 1, Ordering::Relaxed);
                        return Ok(Some(idx));
                    }
                    _ => all_drained = false,
                }
            }
            if all_drained {
                return Ok(None);
            }

            futures::future::select_all(notified).await;
        }
    }

    async fn pull_next_inner(
        &self,
        channel: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<PulledBatch>> {
        self.core.ensure_usable()?;
        let queue = self.channel(channel);
        match queue.pop(cancel).await.map_err(|e| queue_error(channel, e))? {
            Some(slot) => self.materialize(queue, slot).await.map(Some),
            None => Ok(None),
        }
    }

    async fn try_pull_next_inner(&self, channel: &str) -> Result<Option<PulledBatch>> {
        self.core.ensure_usable()?;
        let queue = self.channel(channel);
        match queue.try_pop() {
            Some(slot) => self.materialize(queue, slot).await.map(Some),
            None => Ok(None),
        }
    }

    async fn pull_by_identifier_inner(
        &self,
        channel: &str,
        identifier: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<PulledBatch> {
        self.core.ensure_usable()?;
        let queue = self.channel(channel);
        match queue
            .pop_identifier(identifier, cancel)
            .await
            .map_err(|e| queue_error(channel, e))?
        {
            Lookup::Found(slot) => self.materialize(queue, slot).await,
            Lookup::Gone => Err(CacheError::NotFound {
                channel: channel.to_string(),
                identifier: identifier.to_string(),
            }),
        }
    }

    /// Read a claimed entry back into a batch and destroy the entry.
    ///
    /// Nothing is awaited between destroying the entry and returning, so the
    /// batch either reaches the caller or stays in the cache.
    async fn materialize(&self, queue: Arc<WaitableQueue>, slot: Slot) -> Result<PulledBatch> {
        let id = slot.entry_id;
        let mut claim = Claim::new(self.core.clone(), queue.clone(), slot);

        let read = {
            let core = self.core.clone();
            let handle = claim
                .read
                .insert(tokio::spawn(async move { core.read_entry(id).await }));
            handle.await
        };
        claim.read = None;
        let (tier, batch) = match read {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                claim.disarm();
                return Err(e);
            }
            Err(e) => {
                claim.disarm();
                return Err(task_failed(e));
            }
        };
        claim.pinned = true;

        let entry = {
            let mut state = self.core.state.lock().await;
            let removed = self.core.remove_read(&mut state, id, tier);
            claim.disarm();
            removed?
        };

        let store = self.core.stores[tier].clone();
        tokio::spawn(async move {
            if let Err(e) = store.delete(id).await {
                warn!(entry_id = id, tier, error = %e, "Failed to release entry storage");
            }
        });

        if batch.byte_size() as u64 != entry.byte_size {
            return Err(CacheError::CorruptEntry(format!(
                "entry {id} materialized {} bytes, expected {}",
                batch.byte_size(),
                entry.byte_size
            )));
        }

        let channel = queue.name();
        self.core.metrics.record_pull(channel);
        debug!(
            channel,
            identifier = %entry.identifier,
            entry_id = id,
            sequence = entry.sequence,
            tier,
            "Pulled batch"
        );

        if self.core.prefetcher.enabled() {
            let core = self.core.clone();
            tokio::spawn(async move { core.prefetch_in_background().await });
        }

        Ok(PulledBatch {
            identifier: entry.identifier,
            sequence: entry.sequence,
            metadata: entry.metadata,
            is_last: entry.is_last,
            batch,
        })
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    /// Tier statistics for monitoring.
    pub async fn stats(&self) -> Vec<TierStats> {
        let state = self.core.state.lock().await;
        state
            .allocator
            .ledgers()
            .iter()
            .enumerate()
            .map(|(tier, ledger)| TierStats {
                name: ledger.name().to_string(),
                kind: ledger.kind(),
                capacity: ledger.capacity(),
                bytes_used: ledger.used(),
                entry_count: state.table.count_in_tier(tier),
            })
            .collect()
    }

    /// Verify that every tier's reserved bytes equal the sum of its entries
    /// and never exceed its capacity.
    pub async fn check_invariants(&self) -> Result<()> {
        let result = {
            let state = self.core.state.lock().await;
            state
                .allocator
                .ledgers()
                .iter()
                .enumerate()
                .find_map(|(tier, ledger)| {
                    let held = state.table.bytes_in_tier(tier);
                    if ledger.used() > ledger.capacity() {
                        Some(format!(
                            "tier '{}' uses {} of {} bytes",
                            ledger.name(),
                            ledger.used(),
                            ledger.capacity()
                        ))
                    } else if held != ledger.used() {
                        Some(format!(
                            "tier '{}' reserves {} bytes but holds {held}",
                            ledger.name(),
                            ledger.used()
                        ))
                    } else {
                        None
                    }
                })
        };
        match result {
            Some(msg) => Err(self.core.poison(CacheError::CorruptEntry(msg))),
            None => Ok(()),
        }
    }

    /// Current tier of the oldest live entry with `identifier` on `channel`.
    pub async fn tier_of(&self, channel: &str, identifier: &str) -> Option<TierId> {
        let state = self.core.state.lock().await;
        let id = state.table.oldest_live(channel, identifier)?;
        state.table.get(id).map(|e| e.tier)
    }

    pub fn channel_state(&self, channel: &str) -> ChannelState {
        self.channel(channel).state()
    }

    /// Entries queued on `channel` and not yet claimed by a consumer.
    pub fn channel_len(&self, channel: &str) -> usize {
        self.channel(channel).len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Render Prometheus metrics in text format.
    pub fn metrics_text(&self) -> Result<String> {
        Ok(self.core.metrics.render()?)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.core.metrics
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Finish every channel and remove spill directories.
    pub async fn shutdown(&self) -> Result<()> {
        let queues: Vec<_> = self.channels.read().values().cloned().collect();
        for queue in queues {
            queue.mark_finished();
        }
        for store in &self.disk_stores {
            store.remove_all().await?;
        }
        info!("Cache machine shut down");
        Ok(())
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    /// Get or create the queue for `name`.
    fn channel(&self, name: &str) -> Arc<WaitableQueue> {
        if let Some(queue) = self.channels.read().get(name) {
            return queue.clone();
        }
        self.channels
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(channel = name, "Opened channel");
                Arc::new(WaitableQueue::new(name, self.core.config.channel(name)))
            })
            .clone()
    }
}

impl MachineCore {
    /// Place, write and enqueue one batch. Runs on its own task; `cancel`
    /// fires when the caller gives up.
    async fn add_entry(
        &self,
        queue: Arc<WaitableQueue>,
        request: AddRequest,
        cancel: CancellationToken,
    ) -> Result<()> {
        let channel = queue.name();
        let AddRequest {
            identifier,
            batch,
            metadata,
            is_last,
        } = request;
        if queue.is_finished() {
            return Err(CacheError::ChannelClosed(channel.to_string()));
        }

        let bytes = batch.byte_size() as u64;
        let policy = queue.config().duplicate_policy;

        let (entry_id, tier, sequence, replaced) = {
            let mut state = self.state.lock().await;

            let mut replaced = None;
            match policy {
                DuplicatePolicy::Reject => {
                    if state.table.contains_identifier(channel, &identifier)
                        || queue.was_delivered(&identifier)
                    {
                        return Err(CacheError::DuplicateIdentifier {
                            channel: channel.to_string(),
                            identifier,
                        });
                    }
                }
                DuplicatePolicy::Allow => {}
                DuplicatePolicy::Replace => {
                    replaced = state.table.oldest_live(channel, &identifier);
                }
            }

            let tier = match self.place(&mut state, bytes).await {
                Ok(tier) => tier,
                Err(e) => {
                    if matches!(e, CacheError::CapacityExhausted { .. }) {
                        self.metrics.record_capacity_exhausted();
                        warn!(channel, identifier = %identifier, bytes, "No tier can hold batch");
                    }
                    return Err(e);
                }
            };

            let new = NewEntry {
                channel: channel.to_string(),
                identifier: identifier.clone(),
                tier,
                byte_size: bytes,
                metadata,
                is_last,
            };
            let (entry_id, sequence) =
                match state.table.insert(new, policy != DuplicatePolicy::Reject) {
                    Ok(entry) => (entry.id, entry.sequence),
                    Err(e) => {
                        state.allocator.release(tier, bytes)?;
                        return Err(e);
                    }
                };

            self.metrics
                .observe_tiers(state.allocator.ledgers(), &state.table);
            (entry_id, tier, sequence, replaced)
        };

        // The entry is pinned until its bytes are in place.
        if let Err(e) = self.stores[tier].write(entry_id, &batch).await {
            self.discard(entry_id).await?;
            return Err(e.into());
        }

        {
            let mut state = self.state.lock().await;
            state.table.unpin(entry_id)?;
            if let Some(old) = replaced {
                // An entry already claimed by a consumer is left to that pull.
                if queue.remove_entry(old).is_some() {
                    self.destroy_locked(&mut state, old).await?;
                    debug!(channel, identifier = %identifier, replaced = old, "Replaced entry");
                }
            }
        }

        let slot = Slot {
            entry_id,
            sequence,
            identifier: identifier.clone(),
        };
        if let Err(e) = queue.push(slot, Some(&cancel)).await {
            self.discard(entry_id).await?;
            if e == QueueError::Cancelled {
                debug!(channel, identifier = %identifier, entry_id, "Add abandoned, entry rolled back");
            }
            return Err(queue_error(channel, e));
        }

        self.metrics.record_add(channel);
        debug!(
            channel,
            identifier = %identifier,
            entry_id,
            sequence,
            tier,
            bytes,
            "Added batch"
        );

        if is_last {
            finish_channel(&queue);
        }
        Ok(())
    }

    /// Pin an entry and read its bytes, promoting it first when configured.
    /// On success the pin is left for the caller. An unreadable entry is
    /// destroyed.
    async fn read_entry(&self, id: EntryId) -> ReadOutcome {
        let tier = {
            let mut state = self.state.lock().await;
            if self.config.promotion.promote_on_pull {
                if let Err(e) = self.promote_for_read(&mut state, id).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(entry_id = id, error = %e, "Promotion before read failed");
                }
            }
            state.table.pin(id)?;
            state.table.expect(id)?.tier
        };

        // Pinned: no spill or promotion can move the bytes during the read.
        match self.stores[tier].read(id).await {
            Ok(batch) => Ok((tier, batch)),
            Err(e) => {
                let mut state = self.state.lock().await;
                self.destroy_locked(&mut state, id).await?;
                warn!(entry_id = id, tier, error = %e, "Dropped unreadable entry");
                Err(e.into())
            }
        }
    }

    /// Remove an entry that has just been read from `tier` and free its
    /// reservation. Storage is left for the caller to delete.
    fn remove_read(&self, state: &mut MachineState, id: EntryId, tier: TierId) -> Result<CacheEntry> {
        let entry = state.table.remove(id)?;
        if entry.tier != tier {
            return Err(CacheError::CorruptEntry(format!(
                "entry {id} moved from tier {tier} to {} while pinned",
                entry.tier
            )));
        }
        state.allocator.release(entry.tier, entry.byte_size)?;
        self.metrics
            .observe_tiers(state.allocator.ledgers(), &state.table);
        Ok(entry)
    }

    // ─── Placement and movement ────────────────────────────────────────────

    /// Reserve room for `bytes`: fastest tier first, spilling from it if that
    /// makes room, otherwise falling through to slower tiers.
    async fn place(&self, state: &mut MachineState, bytes: u64) -> Result<TierId> {
        if !state.allocator.can_ever_fit(bytes) {
            return Err(CacheError::CapacityExhausted { bytes });
        }

        for tier in 0..state.allocator.len() {
            if state.allocator.try_reserve(tier, bytes)
                || (self.make_room(state, tier, bytes).await?
                    && state.allocator.try_reserve(tier, bytes))
            {
                debug!(tier, bytes, "Placed batch");
                return Ok(tier);
            }
        }

        Err(CacheError::CapacityExhausted { bytes })
    }

    /// Demote unpinned entries out of `tier`, oldest first, until `bytes`
    /// fit. Returns whether they now fit.
    fn make_room<'a>(
        &'a self,
        state: &'a mut MachineState,
        tier: TierId,
        bytes: u64,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            let free = state.allocator.free(tier);
            if free >= bytes {
                return Ok(true);
            }
            if state.allocator.is_slowest(tier)
                || state.allocator.ledger(tier).capacity() < bytes
                || free + state.table.spillable_bytes(tier) < bytes
            {
                return Ok(false);
            }

            let victims = self
                .evictor
                .select_victims(state.table.entries(), tier, bytes - free);

            let mut spilled = 0;
            for victim in victims {
                if state.allocator.free(tier) >= bytes {
                    break;
                }
                if !self.demote(state, victim.entry_id, tier).await? {
                    break;
                }
                spilled += 1;
            }

            if spilled > 0 {
                info!(
                    spilled,
                    tier = %state.allocator.ledger(tier).name(),
                    free = state.allocator.free(tier),
                    "Spill round complete"
                );
            }
            Ok(state.allocator.free(tier) >= bytes)
        }
        .boxed()
    }

    /// Move one entry to the fastest slower tier that has or can make room.
    fn demote<'a>(
        &'a self,
        state: &'a mut MachineState,
        id: EntryId,
        from: TierId,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            let size = state.table.expect(id)?.byte_size;
            for to in from + 1..state.allocator.len() {
                let reserved = state.allocator.try_reserve(to, size)
                    || (self.make_room(state, to, size).await?
                        && state.allocator.try_reserve(to, size));
                if reserved {
                    self.move_entry(state, id, from, to).await?;
                    self.metrics.record_spill(
                        state.allocator.ledger(from).name(),
                        state.allocator.ledger(to).name(),
                    );
                    return Ok(true);
                }
            }
            Ok(false)
        }
        .boxed()
    }

    /// Promote an entry into the fastest tier with free room, if any is
    /// faster than where it sits.
    async fn promote_for_read(&self, state: &mut MachineState, id: EntryId) -> Result<()> {
        let entry = state.table.expect(id)?;
        let (from, size) = (entry.tier, entry.byte_size);
        if let Some(to) = state.allocator.reserve_faster_than(from, size) {
            self.move_entry(state, id, from, to).await?;
            self.metrics.record_promotion(
                state.allocator.ledger(from).name(),
                state.allocator.ledger(to).name(),
            );
        }
        Ok(())
    }

    /// Prefetch after a pull. Failures only cost the promotion, unless they
    /// reveal corruption.
    async fn prefetch_in_background(&self) {
        if let Err(e) = self.prefetch().await {
            if e.is_fatal() {
                self.poison(e);
            } else {
                warn!(error = %e, "Prefetch failed");
            }
        }
    }

    /// Promote entries consumers will pull next into free fast capacity.
    async fn prefetch(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let requests = self.prefetcher.compute_requests(&state.table);
        let mut promoted = 0;
        for req in requests {
            if let Some(to) = state
                .allocator
                .reserve_faster_than(req.current_tier, req.byte_size)
            {
                self.move_entry(&mut state, req.entry_id, req.current_tier, to)
                    .await?;
                self.metrics.record_promotion(
                    state.allocator.ledger(req.current_tier).name(),
                    state.allocator.ledger(to).name(),
                );
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(promoted, "Prefetch round complete");
            self.metrics
                .observe_tiers(state.allocator.ledgers(), &state.table);
        }
        Ok(())
    }

    /// Copy an entry's bytes from `from` to `to`. The destination must
    /// already be reserved; the source is released only after the copy.
    async fn move_entry(
        &self,
        state: &mut MachineState,
        id: EntryId,
        from: TierId,
        to: TierId,
    ) -> Result<()> {
        let size = state.table.expect(id)?.byte_size;

        let copied = match self.stores[from].read(id).await {
            Ok(batch) => self.stores[to].write(id, &batch).await,
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            state.allocator.release(to, size)?;
            return Err(e.into());
        }

        state.table.set_tier(id, to)?;
        if let Err(e) = self.stores[from].delete(id).await {
            warn!(entry_id = id, tier = from, error = %e, "Failed to release source copy");
        }
        state.allocator.release(from, size)?;

        debug!(
            entry_id = id,
            from = %state.allocator.ledger(from).name(),
            to = %state.allocator.ledger(to).name(),
            bytes = size,
            "Moved entry"
        );
        Ok(())
    }

    /// Remove an entry and free its reservation and storage. Caller holds the
    /// state lock and has already taken the entry out of its queue.
    async fn destroy_locked(&self, state: &mut MachineState, id: EntryId) -> Result<()> {
        let entry = state.table.remove(id)?;
        state.allocator.release(entry.tier, entry.byte_size)?;
        if let Err(e) = self.stores[entry.tier].delete(id).await {
            warn!(entry_id = id, tier = entry.tier, error = %e, "Failed to release entry storage");
        }
        self.metrics
            .observe_tiers(state.allocator.ledgers(), &state.table);
        Ok(())
    }

    /// Roll back an entry that never reached its queue.
    async fn discard(&self, id: EntryId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.destroy_locked(&mut state, id).await
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CacheError::CorruptEntry(
                "cache machine unusable after an earlier invariant violation".to_string(),
            ));
        }
        Ok(())
    }

    /// Latch fatal errors so every later operation fails too.
    fn poison(&self, err: CacheError) -> CacheError {
        if err.is_fatal() && !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(error = %err, "Cache machine poisoned");
        }
        err
    }
}

/// A slot taken off its queue whose entry has not been destroyed yet.
///
/// Dropped while armed, it releases the read pin and puts the slot back at
/// its sequence position, so an abandoned pull leaves the entry pullable.
struct Claim {
    core: Arc<MachineCore>,
    queue: Arc<WaitableQueue>,
    /// `None` once disarmed.
    slot: Option<Slot>,
    /// In-flight read task; it pins the entry before reading.
    read: Option<JoinHandle<ReadOutcome>>,
    /// The read finished and its pin is still held.
    pinned: bool,
}

impl Claim {
    fn new(core: Arc<MachineCore>, queue: Arc<WaitableQueue>, slot: Slot) -> Self {
        Self {
            core,
            queue,
            slot: Some(slot),
            read: None,
            pinned: false,
        }
    }

    /// The entry was destroyed; nothing to hand back.
    fn disarm(&mut self) {
        self.slot = None;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let read = self.read.take();
        if read.is_none() && !self.pinned {
            self.queue.requeue(slot);
            return;
        }

        // Unpinning needs the state lock, which cannot be awaited here.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(entry_id = slot.entry_id, "No runtime to return an abandoned pull");
            return;
        };
        let core = self.core.clone();
        let queue = self.queue.clone();
        runtime.spawn(async move {
            if let Some(handle) = read {
                // A failed read already destroyed the entry.
                if !matches!(handle.await, Ok(Ok(_))) {
                    return;
                }
            }
            {
                let mut state = core.state.lock().await;
                if let Err(e) = state.table.unpin(slot.entry_id) {
                    core.poison(e);
                    return;
                }
            }
            debug!(
                channel = queue.name(),
                entry_id = slot.entry_id,
                "Abandoned pull returned to queue"
            );
            queue.requeue(slot);
        });
    }
}

fn finish_channel(queue: &WaitableQueue) {
    queue.mark_finished();
    info!(channel = queue.name(), "Channel finished");
}

fn queue_error(channel: &str, err: QueueError) -> CacheError {
    match err {
        QueueError::Closed => CacheError::ChannelClosed(channel.to_string()),
        QueueError::Cancelled => CacheError::Cancelled(channel.to_string()),
    }
}

/// A background task panicked or was aborted mid-update.
fn task_failed(err: JoinError) -> CacheError {
    CacheError::CorruptEntry(format!("cache task failed: {err}"))
}
