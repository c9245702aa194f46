// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mutual exclusion scoped to a string key.
//!
//! Channel creation and teardown for one peer are single-flight while other
//! peers proceed in parallel. Locks are created lazily on first use and can be
//! dropped with [`KeyedMutex::remove_key`] so the table does not grow without
//! bound as peers come and go.
//!
//! The lock is **not re-entrant**: a holder that calls [`KeyedMutex::acquire`]
//! again on its own key waits behind itself until the timeout elapses.
//!
//! Async callers that may be cancelled should prefer [`KeyedMutex::lock`],
//! whose guard releases the key when the holding future is dropped.
//!
//! # Example
//!
//! ```
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! use std::time::Duration;
//! use sip_transport::KeyedMutex;
//!
//! let locks = KeyedMutex::new();
//! locks.acquire("10.0.0.1:5060/TCP", Duration::from_secs(1)).await.unwrap();
//! // ... create the channel ...
//! locks.release("10.0.0.1:5060/TCP");
//!
//! {
//!     let _guard = locks.lock("10.0.0.1:5060/TCP", Duration::from_secs(1)).await.unwrap();
//!     assert!(locks.is_locked("10.0.0.1:5060/TCP"));
//! }
//! assert!(!locks.is_locked("10.0.0.1:5060/TCP"));
//! # });
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::trace;

/// Acquisition bound used when callers have no better figure.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// The lock for a key stayed contended for longer than the caller allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionTimeoutError {
    pub key: String,
    pub waited: Duration,
}

impl fmt::Display for AcquisitionTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out after {:?} waiting for lock on {}",
            self.waited, self.key
        )
    }
}

impl std::error::Error for AcquisitionTimeoutError {}

/// Permit of the current holder, tagged so a guard only ends its own hold.
#[derive(Debug)]
struct Hold {
    ticket: u64,
    _permit: OwnedSemaphorePermit,
}

/// Binary lock for one key. The semaphore queues waiters FIFO; `held` keeps the
/// permit of the current holder so `release` can be called by key alone.
#[derive(Debug)]
struct KeyLock {
    gate: Arc<Semaphore>,
    held: Mutex<Option<Hold>>,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            held: Mutex::new(None),
        }
    }
}

/// Hold on one key, released on drop.
///
/// Dropping the guard after the key was released or removed by other means
/// leaves any later holder untouched.
#[must_use = "the key is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    lock: Arc<KeyLock>,
    ticket: u64,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut held = self.lock.held.lock();
        if held.as_ref().is_some_and(|hold| hold.ticket == self.ticket) {
            held.take();
            trace!(key = %self.key, "keyed lock released by guard");
        }
    }
}

/// Table of per-key binary locks.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<KeyLock>>,
    tickets: AtomicU64,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `key` is held or `timeout` elapses.
    ///
    /// The key stays held until [`KeyedMutex::release`] or
    /// [`KeyedMutex::remove_key`], even if the caller is cancelled afterwards.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<(), AcquisitionTimeoutError> {
        self.hold(key, timeout).await.map(|_| ())
    }

    /// Like [`KeyedMutex::acquire`], but the hold ends when the guard drops.
    pub async fn lock(&self, key: &str, timeout: Duration) -> Result<KeyGuard, AcquisitionTimeoutError> {
        let (lock, ticket) = self.hold(key, timeout).await?;
        Ok(KeyGuard {
            key: key.to_owned(),
            lock,
            ticket,
        })
    }

    async fn hold(&self, key: &str, timeout: Duration) -> Result<(Arc<KeyLock>, u64), AcquisitionTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Insert-if-absent: racing creators all observe the same lock.
            let lock = self
                .locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(KeyLock::new()))
                .clone();

            let permit = match time::timeout_at(deadline, lock.gate.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                // Gates are never closed; treat it like a replaced lock.
                Ok(Err(_)) => continue,
                Err(_) => {
                    return Err(AcquisitionTimeoutError {
                        key: key.to_owned(),
                        waited: timeout,
                    })
                }
            };

            // The key may have been removed while we waited. Reinstate our lock
            // if the slot is free; if a fresh lock took the slot, contend on it.
            let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
            let hold = Hold {
                ticket,
                _permit: permit,
            };
            match self.locks.entry(key.to_owned()) {
                Entry::Occupied(slot) if Arc::ptr_eq(slot.get(), &lock) => {
                    *lock.held.lock() = Some(hold);
                    trace!(key, "keyed lock acquired");
                    return Ok((lock, ticket));
                }
                Entry::Occupied(_) => {
                    drop(hold);
                    trace!(key, "keyed lock replaced while waiting; retrying");
                }
                Entry::Vacant(slot) => {
                    *lock.held.lock() = Some(hold);
                    slot.insert(lock.clone());
                    trace!(key, "keyed lock reinstated after removal");
                    return Ok((lock, ticket));
                }
            }
        }
    }

    /// Releases the lock for `key` if it is held. Unknown keys are ignored.
    pub fn release(&self, key: &str) {
        let lock = self.locks.get(key).map(|entry| entry.value().clone());
        if let Some(lock) = lock {
            lock.held.lock().take();
        }
    }

    /// Drops the lock for `key`, releasing it first if held.
    ///
    /// A task already waiting on the removed lock is woken and re-enters the
    /// table; a later `acquire` starts from a fresh lock.
    pub fn remove_key(&self, key: &str) {
        if let Some((_, lock)) = self.locks.remove(key) {
            lock.held.lock().take();
        }
    }

    /// Returns true while `key` is held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|entry| entry.value().held.lock().is_some())
            .unwrap_or(false)
    }

    /// Number of keys with a materialized lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn acquire_and_release() {
        let locks = KeyedMutex::new();
        locks.acquire("a", SHORT).await.unwrap();
        assert!(locks.is_locked("a"));
        locks.release("a");
        assert!(!locks.is_locked("a"));
        locks.acquire("a", SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn second_acquire_by_holder_times_out() {
        let locks = KeyedMutex::new();
        locks.acquire("a", SHORT).await.unwrap();
        let err = locks.acquire("a", SHORT).await.unwrap_err();
        assert_eq!(err.key, "a");
        assert_eq!(err.waited, SHORT);
        // The original hold is intact.
        assert!(locks.is_locked("a"));
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let locks = KeyedMutex::new();
        let guard = locks.lock("a", SHORT).await.unwrap();
        assert_eq!(guard.key(), "a");
        assert!(locks.is_locked("a"));
        drop(guard);
        assert!(!locks.is_locked("a"));
    }

    #[tokio::test]
    async fn cancelled_holder_does_not_strand_the_key() {
        let locks = Arc::new(KeyedMutex::new());
        let holder = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("a", SHORT).await.unwrap();
                time::sleep(Duration::from_secs(60)).await;
            })
        };
        time::sleep(Duration::from_millis(20)).await;
        assert!(locks.is_locked("a"));

        holder.abort();
        let _ = holder.await;
        locks.lock("a", SHORT).await.expect("key is free after cancellation");
    }

    #[tokio::test]
    async fn stale_guard_leaves_new_holder_alone() {
        let locks = Arc::new(KeyedMutex::new());
        let stale = locks.lock("a", SHORT).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock("a", Duration::from_secs(2)).await })
        };
        time::sleep(Duration::from_millis(20)).await;
        // Removal hands the key to the waiter, which reinstates the same lock.
        locks.remove_key("a");
        let fresh = waiter.await.unwrap().unwrap();

        drop(stale);
        assert!(locks.is_locked("a"), "stale guard must not end the new hold");
        drop(fresh);
        assert!(!locks.is_locked("a"));
    }

    #[tokio::test]
    async fn disjoint_keys_do_not_block() {
        let locks = KeyedMutex::new();
        locks.acquire("a", SHORT).await.unwrap();
        locks.acquire("b", SHORT).await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn release_unknown_key_is_noop() {
        let locks = KeyedMutex::new();
        locks.release("missing");
        locks.remove_key("missing");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn remove_key_starts_fresh() {
        let locks = KeyedMutex::new();
        locks.acquire("a", SHORT).await.unwrap();
        locks.remove_key("a");
        assert!(locks.is_empty());
        locks.acquire("a", SHORT).await.unwrap();
        assert!(locks.is_locked("a"));
    }

    #[tokio::test]
    async fn remove_key_wakes_waiter() {
        let locks = Arc::new(KeyedMutex::new());
        locks.acquire("a", SHORT).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("a", Duration::from_secs(2)).await })
        };
        time::sleep(Duration::from_millis(20)).await;
        locks.remove_key("a");

        waiter.await.unwrap().expect("waiter acquires after removal");
        assert!(locks.is_locked("a"), "waiter's lock is back in the table");
        // And it still excludes others.
        assert!(locks.acquire("a", SHORT).await.is_err());
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let locks = Arc::new(KeyedMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        locks.acquire("k", SHORT).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("k", Duration::from_secs(2)).await.unwrap();
                order.lock().push(i);
                locks.release("k");
            }));
            // Let each waiter queue before the next one arrives.
            time::sleep(Duration::from_millis(10)).await;
        }
        locks.release("k");
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn critical_section_is_exclusive() {
        let locks = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("peer", Duration::from_secs(5)).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                locks.release("peer");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
