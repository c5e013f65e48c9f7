//! Waitable queue: the per-channel hand-off point between producers and
//! consumers.
//!
//! Slots are kept in sequence order. `push` blocks while the queue is at its
//! backlog limit, `pop` blocks until a slot arrives or the channel finishes.
//! All waits are `Notify`-based: a waiter registers interest before checking
//! state, so a change between the check and the await is never missed.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cache::entry::EntryId;
use crate::config::{ChannelConfig, DuplicatePolicy};

/// Queue reference to a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub entry_id: EntryId,
    pub sequence: u64,
    pub identifier: String,
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting pushes.
    Open,
    /// No more pushes; remaining slots can still be drained.
    Finished,
    /// Finished and empty. Terminal.
    Drained,
}

/// Why a blocking queue operation returned without a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Push after `mark_finished`.
    Closed,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Outcome of popping a specific identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Slot),
    /// The identifier can no longer appear on this channel.
    Gone,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: VecDeque<Slot>,
    finished: bool,
    /// Identifiers handed to consumers. Only kept under
    /// `DuplicatePolicy::Reject`, for lifetime uniqueness checks.
    delivered: HashSet<String>,
}

impl QueueState {
    fn insert_ordered(&mut self, slot: Slot) {
        let pos = self.slots.partition_point(|s| s.sequence < slot.sequence);
        self.slots.insert(pos, slot);
    }
}

#[derive(Debug)]
pub struct WaitableQueue {
    name: String,
    config: ChannelConfig,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl WaitableQueue {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn tracks_delivered(&self) -> bool {
        self.config.duplicate_policy == DuplicatePolicy::Reject
    }

    /// Register for the next state change. Used by multi-channel waits.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Wait until `check` yields a value. `check` runs under the queue lock;
    /// interest is registered before each check.
    async fn wait_until<T>(
        &self,
        cancel: Option<&CancellationToken>,
        mut check: impl FnMut(&mut QueueState) -> Option<T>,
    ) -> Result<T, QueueError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut state = self.state.lock();
                check(&mut state)
            };
            if let Some(out) = ready {
                return Ok(out);
            }

            match cancel {
                Some(token) => tokio::select! {
                    _ = &mut notified => {}
                    _ = token.cancelled() => return Err(QueueError::Cancelled),
                },
                None => notified.await,
            }
        }
    }

    /// Insert a slot in sequence order, blocking while at the backlog limit.
    pub async fn push(
        &self,
        slot: Slot,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), QueueError> {
        let limit = self.config.backlog_limit;
        let mut slot = Some(slot);
        let result = self
            .wait_until(cancel, |state| {
                if state.finished {
                    return Some(Err(QueueError::Closed));
                }
                if limit > 0 && state.slots.len() >= limit {
                    return None;
                }
                state.insert_ordered(slot.take()?);
                Some(Ok(()))
            })
            .await?;
        if result.is_ok() {
            self.changed.notify_waiters();
        }
        result
    }

    /// Pop the oldest slot. `None` means end-of-stream.
    pub async fn pop(&self, cancel: Option<&CancellationToken>) -> Result<Option<Slot>, QueueError> {
        let track = self.tracks_delivered();
        let popped = self
            .wait_until(cancel, |state| match state.slots.pop_front() {
                Some(slot) => {
                    if track {
                        state.delivered.insert(slot.identifier.clone());
                    }
                    Some(Some(slot))
                }
                None if state.finished => Some(None),
                None => None,
            })
            .await?;
        self.changed.notify_waiters();
        Ok(popped)
    }

    /// Non-blocking pop. `None` if nothing is queued right now.
    pub fn try_pop(&self) -> Option<Slot> {
        let slot = {
            let mut state = self.state.lock();
            let slot = state.slots.pop_front()?;
            if self.tracks_delivered() {
                state.delivered.insert(slot.identifier.clone());
            }
            slot
        };
        self.changed.notify_waiters();
        Some(slot)
    }

    /// Pop the oldest slot carrying `identifier`, wherever it sits. Remaining
    /// slots keep their relative order.
    pub async fn pop_identifier(
        &self,
        identifier: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Lookup, QueueError> {
        let lifetime_unique = self.tracks_delivered();
        let lookup = self
            .wait_until(cancel, |state| {
                if let Some(pos) = state.slots.iter().position(|s| s.identifier == identifier) {
                    let slot = state.slots.remove(pos)?;
                    if lifetime_unique {
                        state.delivered.insert(slot.identifier.clone());
                    }
                    return Some(Lookup::Found(slot));
                }
                if state.finished || (lifetime_unique && state.delivered.contains(identifier)) {
                    return Some(Lookup::Gone);
                }
                None
            })
            .await?;
        self.changed.notify_waiters();
        Ok(lookup)
    }

    /// Remove the slot for a specific entry if it is still queued.
    pub fn remove_entry(&self, entry_id: EntryId) -> Option<Slot> {
        let slot = {
            let mut state = self.state.lock();
            let pos = state.slots.iter().position(|s| s.entry_id == entry_id)?;
            state.slots.remove(pos)?
        };
        self.changed.notify_waiters();
        Some(slot)
    }

    /// Put a popped slot back at its sequence position, as if it had never
    /// been delivered. Ignores the backlog limit and the finished flag.
    pub fn requeue(&self, slot: Slot) {
        {
            let mut state = self.state.lock();
            state.delivered.remove(&slot.identifier);
            state.insert_ordered(slot);
        }
        self.changed.notify_waiters();
    }

    /// Stop accepting pushes. Idempotent. Wakes every blocked waiter.
    pub fn mark_finished(&self) {
        self.state.lock().finished = true;
        self.changed.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Whether `identifier` has already been handed to a consumer.
    pub fn was_delivered(&self, identifier: &str) -> bool {
        self.state.lock().delivered.contains(identifier)
    }

    pub fn state(&self) -> ChannelState {
        let state = self.state.lock();
        match (state.finished, state.slots.is_empty()) {
            (false, _) => ChannelState::Open,
            (true, false) => ChannelState::Finished,
            (true, true) => ChannelState::Drained,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn slot(seq: u64, id: &str) -> Slot {
        Slot {
            entry_id: seq,
            sequence: seq,
            identifier: id.into(),
        }
    }

    fn queue(backlog_limit: usize) -> Arc<WaitableQueue> {
        Arc::new(WaitableQueue::new(
            "test",
            ChannelConfig {
                backlog_limit,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_fifo_by_sequence() {
        let q = queue(0);
        q.push(slot(1, "b"), None).await.unwrap();
        q.push(slot(0, "a"), None).await.unwrap();
        q.push(slot(2, "c"), None).await.unwrap();

        let order: Vec<_> = [q.try_pop(), q.try_pop(), q.try_pop()]
            .into_iter()
            .map(|s| s.unwrap().identifier)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(q.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_pop_identifier_preserves_order() {
        let q = queue(0);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            q.push(slot(i as u64, id), None).await.unwrap();
        }

        let found = q.pop_identifier("b", None).await.unwrap();
        assert_eq!(found, Lookup::Found(slot(1, "b")));
        assert_eq!(q.try_pop().unwrap().identifier, "a");
        assert_eq!(q.try_pop().unwrap().identifier, "c");
    }

    #[tokio::test]
    async fn test_pop_blocks_until_push() {
        let q = queue(0);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        q.push(slot(0, "x"), None).await.unwrap();
        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped.unwrap().identifier, "x");
    }

    #[tokio::test]
    async fn test_finish_wakes_waiters() {
        let q = queue(0);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.mark_finished();
        q.mark_finished(); // idempotent

        assert_eq!(consumer.await.unwrap().unwrap(), None);
        assert_eq!(q.state(), ChannelState::Drained);
        assert_eq!(q.push(slot(0, "late"), None).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_push_backpressure() {
        let q = queue(1);
        q.push(slot(0, "a"), None).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.push(slot(1, "b"), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(q.len(), 1);

        q.try_pop().unwrap();
        producer.await.unwrap().unwrap();
        assert_eq!(q.try_pop().unwrap().identifier, "b");
    }

    #[tokio::test]
    async fn test_cancelled_pop() {
        let q = queue(0);
        let token = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let token = token.clone();
            tokio::spawn(async move { q.pop(Some(&token)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_delivered_identifier_is_gone() {
        let q = queue(0);
        q.push(slot(0, "x"), None).await.unwrap();
        q.pop(None).await.unwrap();

        assert_eq!(q.pop_identifier("x", None).await.unwrap(), Lookup::Gone);
        assert!(q.was_delivered("x"));
    }

    #[tokio::test]
    async fn test_delivered_only_tracked_when_rejecting() {
        let q = WaitableQueue::new(
            "allow",
            ChannelConfig {
                backlog_limit: 0,
                duplicate_policy: DuplicatePolicy::Allow,
            },
        );
        q.push(slot(0, "x"), None).await.unwrap();
        q.push(slot(1, "y"), None).await.unwrap();
        q.push(slot(2, "z"), None).await.unwrap();

        q.pop(None).await.unwrap();
        q.try_pop().unwrap();
        q.pop_identifier("z", None).await.unwrap();
        for id in ["x", "y", "z"] {
            assert!(!q.was_delivered(id));
        }
        assert!(q.state.lock().delivered.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_restores_position_and_identifier() {
        let q = queue(0);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            q.push(slot(i as u64, id), None).await.unwrap();
        }

        let b = match q.pop_identifier("b", None).await.unwrap() {
            Lookup::Found(slot) => slot,
            Lookup::Gone => panic!("b should be queued"),
        };
        assert_eq!(q.pop_identifier("b", None).await.unwrap(), Lookup::Gone);

        q.requeue(b);
        assert!(!q.was_delivered("b"));
        let order: Vec<_> = std::iter::from_fn(|| q.try_pop())
            .map(|s| s.identifier)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_state_transitions() {
        let q = WaitableQueue::new("s", ChannelConfig::default());
        assert_eq!(q.state(), ChannelState::Open);

        q.remove_entry(99);
        q.mark_finished();
        assert_eq!(q.state(), ChannelState::Drained);
    }
}
