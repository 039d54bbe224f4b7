//! Pending-result table: key→value store with blocking, exactly-once retrieval.
//!
//! The poll task is the only writer; any number of `execute` callers wait on
//! their own keys. A value and its waiters share one slot. Waiters register for
//! wakeup and then re-check the slot, so a `put` racing a `get` in either order
//! cannot lose the wakeup.

use crate::{Result, SessionError};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

struct Slot<V> {
    value: Option<V>,
    waiters: usize,
    notify: Arc<Notify>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            value: None,
            waiters: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_idle(&self) -> bool {
        self.value.is_none() && self.waiters == 0
    }
}

/// Registration of one `get` on a slot, undone on drop so an abandoned wait
/// does not pin the slot.
struct Waiting<'a, K, V>
where
    K: Eq + Hash + Copy + Debug,
{
    table: &'a ResultTable<K, V>,
    key: K,
}

impl<K, V> Drop for Waiting<'_, K, V>
where
    K: Eq + Hash + Copy + Debug,
{
    fn drop(&mut self) {
        let mut inner = self.table.lock();
        if let Some(slot) = inner.slots.get_mut(&self.key) {
            slot.waiters = slot.waiters.saturating_sub(1);
        }
        ResultTable::<K, V>::release_if_idle(&mut inner, self.key);
    }
}

struct Inner<K, V> {
    slots: HashMap<K, Slot<V>>,
    failure: Option<SessionError>,
}

/// Concurrent table of results keyed by command identifier.
pub struct ResultTable<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Default for ResultTable<K, V>
where
    K: Eq + Hash + Copy + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ResultTable<K, V>
where
    K: Eq + Hash + Copy + Debug,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a value and wake any consumer waiting on `key`.
    ///
    /// A second value for a key that has not been consumed yet is dropped. Consumed
    /// keys are forgotten, so a repeat of an already-taken key is stored again and
    /// stays until read, like any other unclaimed result.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.lock();
        let slot = inner.slots.entry(key).or_insert_with(Slot::new);
        if slot.value.is_some() {
            warn!("Duplicate result for {:?} dropped", key);
            return;
        }
        slot.value = Some(value);
        slot.notify.notify_waiters();
    }

    /// Take the value for `key`, waiting up to `timeout` for it to arrive.
    ///
    /// `None` waits indefinitely. On timeout nothing is removed, so a value that
    /// arrives later is still returned by a fresh call.
    pub async fn get(&self, key: K, timeout: Option<Duration>) -> Result<V> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let (notify, _waiting) = {
                let mut inner = self.lock();
                if let Some(value) = Self::take(&mut inner, key) {
                    return Ok(value);
                }
                if let Some(err) = &inner.failure {
                    return Err(err.duplicate());
                }
                let slot = inner.slots.entry(key).or_insert_with(Slot::new);
                slot.waiters += 1;
                (slot.notify.clone(), Waiting { table: self, key })
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            // Register, then look again: a put() since the unlock above is otherwise missed.
            notified.as_mut().enable();
            let ready = {
                let inner = self.lock();
                inner.failure.is_some()
                    || inner
                        .slots
                        .get(&key)
                        .is_some_and(|slot| slot.value.is_some())
            };

            let woke = if ready {
                true
            } else {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
                    None => {
                        notified.await;
                        true
                    }
                }
            };

            if !woke {
                // Timeout is Some here: an unbounded wait only ends by waking.
                return Err(SessionError::Timeout(timeout.unwrap_or_default()));
            }
            // `_waiting` drops here and the next pass takes the value or waits again.
        }
    }

    /// Fail every current and future waiter with `err`.
    ///
    /// Values already stored can still be taken.
    pub fn fail(&self, err: SessionError) {
        let mut inner = self.lock();
        for slot in inner.slots.values() {
            slot.notify.notify_waiters();
        }
        inner.failure = Some(err);
    }

    /// The error passed to [`fail`](Self::fail), if any.
    pub fn failure(&self) -> Option<SessionError> {
        self.lock().failure.as_ref().map(SessionError::duplicate)
    }

    /// Number of stored values not consumed yet.
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(inner: &mut Inner<K, V>, key: K) -> Option<V> {
        let value = inner.slots.get_mut(&key)?.value.take();
        if value.is_some() {
            Self::release_if_idle(inner, key);
        }
        value
    }

    fn release_if_idle(inner: &mut Inner<K, V>, key: K) {
        if inner.slots.get(&key).is_some_and(Slot::is_idle) {
            inner.slots.remove(&key);
        }
    }
}
