// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of FleetLocks.
//
// FleetLocks is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// FleetLocks is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with FleetLocks. If not, see <https://www.gnu.org/licenses/>.

//! Locker coordinator: the public acquisition API, the acquire-timeout, the
//! garbage-collection driver and the event bus.
//!
//! ## Design
//! - Holds the adapter as `Arc<dyn LockAdapter>` and a process-local
//!   [`LockRegistry`] of live locks
//! - One GC ticker task per locker, started lazily on the first acquisition
//!   and stopped when the registry drains
//! - At most one GC cycle in flight; overlapping ticks are reported as
//!   [`LockerEvent::Error`] and skipped
//! - Events fan out over a broadcast channel; listeners can never fail a
//!   lock operation

use crate::adapter::{GcParams, LockAdapter, SetupOptions};
use crate::error::{LockerError, LockerResult};
use crate::events::{GarbageCycle, LockerEvent};
use crate::lock::{Lock, LockOptions, LockStatus, LockType};
use crate::registry::LockRegistry;
use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};

/// GC interval applied when a caller opts into GC without choosing a value.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Locker-level configuration.
#[derive(Debug, Clone, Default)]
pub struct LockerOptions {
    /// Enables garbage collection at this interval, provided the adapter
    /// supports it. `None` disables GC entirely.
    pub gc_interval_ms: Option<u64>,
}

impl LockerOptions {
    /// GC at [`DEFAULT_GC_INTERVAL_MS`].
    pub fn with_gc() -> Self {
        Self {
            gc_interval_ms: Some(DEFAULT_GC_INTERVAL_MS),
        }
    }

    pub fn with_gc_interval_ms(gc_interval_ms: u64) -> Self {
        Self {
            gc_interval_ms: Some(gc_interval_ms),
        }
    }
}

struct LockerInner {
    adapter: Arc<dyn LockAdapter>,
    registry: LockRegistry,
    /// Effective GC interval; `None` when disabled or unsupported.
    gc_interval_ms: Option<u64>,
    events: broadcast::Sender<LockerEvent>,
    setup: OnceCell<()>,
    gc_ticker_alive: AtomicBool,
    /// Held for the duration of one GC cycle.
    gc_busy: Arc<Mutex<()>>,
}

/// Coordinates named readers-writer locks through a store adapter.
///
/// Cloning is cheap; clones share the registry, the GC driver and the event
/// bus.
///
/// ## Example
/// ```rust,no_run
/// use fleet_locks::{Locker, LockerOptions, LockOptions, memory::InMemoryLockAdapter};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let locker = Locker::new(Arc::new(InMemoryLockAdapter::new()), LockerOptions::default());
/// locker.setup().await?;
///
/// let lock = locker.lock_as_reader("reports", LockOptions::default()).await?;
/// // ... read the shared resource ...
/// locker.release(&lock).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Locker {
    inner: Arc<LockerInner>,
}

impl Locker {
    pub fn new(adapter: Arc<dyn LockAdapter>, options: LockerOptions) -> Self {
        let gc_interval_ms = match options.gc_interval_ms {
            Some(interval_ms) if adapter.supports_gc() => Some(interval_ms.max(1)),
            _ => None,
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(LockerInner {
                adapter,
                registry: LockRegistry::new(),
                gc_interval_ms,
                events,
                setup: OnceCell::new(),
                gc_ticker_alive: AtomicBool::new(false),
                gc_busy: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// The locks this process currently tracks.
    pub fn registry(&self) -> &LockRegistry {
        &self.inner.registry
    }

    /// Listen to [`LockerEvent`]s. Any number of subscribers is fine.
    pub fn subscribe(&self) -> broadcast::Receiver<LockerEvent> {
        self.inner.events.subscribe()
    }

    /// Initialize the adapter (collections, indexes, TTL machinery).
    ///
    /// Single-flight and memoized: concurrent callers share one attempt, and
    /// only the first success is remembered; a failed attempt is retried by
    /// the next caller.
    pub async fn setup(&self) -> LockerResult<()> {
        let inner = &self.inner;
        inner
            .setup
            .get_or_try_init(|| async {
                inner
                    .adapter
                    .setup(SetupOptions {
                        gc_interval_ms: inner.gc_interval_ms,
                    })
                    .await
            })
            .await?;
        Ok(())
    }

    /// Take a shared lock on `name`.
    pub async fn lock_as_reader(&self, name: &str, options: LockOptions) -> LockerResult<Lock> {
        self.lock(name, LockType::Reader, options).await
    }

    /// Take an exclusive lock on `name`.
    pub async fn lock_as_writer(&self, name: &str, options: LockOptions) -> LockerResult<Lock> {
        self.lock(name, LockType::Writer, options).await
    }

    async fn lock(&self, name: &str, kind: LockType, options: LockOptions) -> LockerResult<Lock> {
        options.validate()?;
        let lock = Lock::new(name, kind, options);
        self.inner.registry.add(lock.clone()).await;
        self.spawn_gc_ticker_if_needed();

        let timeout = lock.options().acquire_timeout_ms.map(|timeout_ms| {
            let lock = lock.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                sleep(Duration::from_millis(timeout_ms)).await;
                // losing the race against admission is fine
                let _ = lock
                    .reject(LockerError::AcquireTimeout { name, timeout_ms })
                    .await;
            })
        });

        let outcome = self.inner.adapter.acquire(lock.clone()).await;
        if let Some(timer) = timeout {
            timer.abort();
        }

        match outcome {
            Ok(()) => {
                if lock.status().await == LockStatus::Acquired {
                    debug!(name = %lock.name(), id = %lock.id(), kind = %lock.kind(), "lock acquired");
                    self.inner.emit(LockerEvent::AcquiredLock(lock.clone()));
                    return Ok(lock);
                }
                // the adapter returned without acquiring: timed out, or
                // rejected externally while polling
                if lock.status().await == LockStatus::Acquiring {
                    let _ = lock
                        .reject(LockerError::Lock {
                            name: lock.name().to_string(),
                            reason: "adapter returned without acquiring".to_string(),
                        })
                        .await;
                }
                let reason = lock.reason().await.unwrap_or(LockerError::Lock {
                    name: lock.name().to_string(),
                    reason: "rejected without a recorded reason".to_string(),
                });
                warn!(name = %lock.name(), id = %lock.id(), error = %reason, "lock rejected");
                self.inner.emit(LockerEvent::RejectedLock(lock.clone()));
                self.inner.registry.remove(&lock).await;
                Err(reason)
            }
            Err(err) => {
                let reason = LockerError::Lock {
                    name: lock.name().to_string(),
                    reason: err.to_string(),
                };
                let _ = lock.reject(reason.clone()).await;
                warn!(name = %lock.name(), id = %lock.id(), error = %reason, "lock failed");
                self.inner.emit(LockerEvent::RejectedLock(lock.clone()));
                self.inner.registry.remove(&lock).await;
                Err(reason)
            }
        }
    }

    /// Run `task` while holding a shared lock on `name`.
    pub async fn ensure_reading_task_concurrency<F, Fut, T>(
        &self,
        name: &str,
        task: F,
        options: LockOptions,
    ) -> LockerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.ensure_task(name, LockType::Reader, task, options).await
    }

    /// Run `task` while holding an exclusive lock on `name`.
    pub async fn ensure_writing_task_concurrency<F, Fut, T>(
        &self,
        name: &str,
        task: F,
        options: LockOptions,
    ) -> LockerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.ensure_task(name, LockType::Writer, task, options).await
    }

    async fn ensure_task<F, Fut, T>(
        &self,
        name: &str,
        kind: LockType,
        task: F,
        options: LockOptions,
    ) -> LockerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock(name, kind, options).await?;
        let output = task().await;
        self.release(&lock).await?;
        Ok(output)
    }

    /// Release a lock. Idempotent: a lock that is already releasing,
    /// released, or no longer tracked is a no-op.
    pub async fn release(&self, lock: &Lock) -> LockerResult<()> {
        let status = lock.status().await;
        if status == LockStatus::Releasing {
            return Ok(());
        }
        if !self.inner.registry.contains(lock).await {
            return Ok(());
        }
        if status == LockStatus::Released {
            self.inner.registry.remove(lock).await;
            return Ok(());
        }
        let result = self.release_tracked(lock).await;
        // the registry entry goes away no matter how the release went
        self.inner.registry.remove(lock).await;
        result
    }

    async fn release_tracked(&self, lock: &Lock) -> LockerResult<()> {
        lock.transition(LockStatus::Releasing).await?;
        self.inner.adapter.release(lock.clone()).await?;
        debug!(name = %lock.name(), id = %lock.id(), "lock released");
        self.inner.emit(LockerEvent::ReleasedLock(lock.clone()));
        Ok(())
    }

    /// Release several locks concurrently; the first failure surfaces after
    /// every release has settled.
    pub async fn release_many<I>(&self, locks: I) -> LockerResult<()>
    where
        I: IntoIterator<Item = Lock>,
    {
        let results = join_all(locks.into_iter().map(|lock| {
            let locker = self.clone();
            async move { locker.release(&lock).await }
        }))
        .await;
        results.into_iter().collect::<LockerResult<Vec<()>>>()?;
        Ok(())
    }

    /// Drop every entry the adapter owns and clear the registry.
    pub async fn release_all(&self) -> LockerResult<()> {
        self.inner.adapter.release_all().await?;
        self.inner.registry.clear().await;
        Ok(())
    }

    /// Run one garbage-collection cycle now.
    ///
    /// Returns `None` when GC is disabled, when a cycle is already running
    /// (reported as an [`LockerEvent::Error`]), or when the cycle failed (the
    /// failure is emitted, never returned).
    pub async fn gc(&self) -> Option<GarbageCycle> {
        self.inner.gc_interval_ms?;
        let guard = match self.inner.gc_busy.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.inner
                    .emit(LockerEvent::Error(LockerError::GcCycleOverlap));
                return None;
            }
        };
        let cycle = self.inner.run_gc_cycle().await;
        drop(guard);
        cycle
    }

    /// Spawn the periodic GC ticker unless it is already alive. The ticker
    /// stops itself once the registry drains and is respawned by the next
    /// acquisition.
    fn spawn_gc_ticker_if_needed(&self) {
        let Some(interval_ms) = self.inner.gc_interval_ms else {
            return;
        };
        if self
            .inner
            .gc_ticker_alive
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick of a tokio interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if inner.registry.is_empty().await {
                    inner.gc_ticker_alive.store(false, Ordering::SeqCst);
                    break;
                }
                match inner.gc_busy.clone().try_lock_owned() {
                    Ok(guard) => {
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            let _guard = guard;
                            inner.run_gc_cycle().await;
                        });
                    }
                    Err(_) => {
                        inner.emit(LockerEvent::Error(LockerError::GcCycleOverlap));
                    }
                }
            }
        });
    }
}

impl LockerInner {
    fn emit(&self, event: LockerEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn run_gc_cycle(&self) -> Option<GarbageCycle> {
        let interval_ms = self.gc_interval_ms?;
        let at = Utc::now();
        let stale_at = at - chrono::Duration::milliseconds((2 * interval_ms) as i64);
        let started = Instant::now();
        match self
            .adapter
            .gc(GcParams {
                registry: self.registry.clone(),
                gc_interval_ms: interval_ms,
                at,
                stale_at,
            })
            .await
        {
            Ok(stats) => {
                let cycle = GarbageCycle {
                    collected: stats.collected,
                    refreshed: stats.refreshed,
                    took: started.elapsed(),
                };
                self.emit(LockerEvent::GarbageCycle(cycle.clone()));
                Some(cycle)
            }
            Err(err) => {
                warn!(error = %err, "garbage collection cycle failed");
                self.emit(LockerEvent::Error(err));
                None
            }
        }
    }
}
