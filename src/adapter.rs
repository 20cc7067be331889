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

//! Adapter contract shared by every lock store backend, plus the queue
//! admission rule both reference backends evaluate client-side.

use crate::error::LockerResult;
use crate::lock::{Lock, LockType};
use crate::registry::LockRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Options handed to [`LockAdapter::setup`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupOptions {
    /// Present when the owning [`Locker`](crate::locker::Locker) has GC
    /// enabled; adapters size their TTL machinery from it.
    pub gc_interval_ms: Option<u64>,
}

/// Inputs of one garbage-collection cycle.
#[derive(Debug, Clone)]
pub struct GcParams {
    /// The live locks whose heartbeats must be refreshed.
    pub registry: LockRegistry,
    pub gc_interval_ms: u64,
    /// The heartbeat value to write.
    pub at: DateTime<Utc>,
    /// Entries with a heartbeat older than this are collected
    /// (`at - 2 * gc_interval`).
    pub stale_at: DateTime<Utc>,
}

/// Counters returned by one garbage-collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Store entries culled as stale
    pub collected: u64,
    /// Live heartbeats refreshed
    pub refreshed: u64,
}

/// Store backend for queue-fair readers-writer locks.
///
/// `acquire`/`release`/`release_all` are mandatory; `setup` and `gc` are
/// capabilities a backend may opt into (`setup` defaults to a no-op,
/// [`supports_gc`](LockAdapter::supports_gc) gates the GC driver).
///
/// Consumed as `Arc<dyn LockAdapter>` by the [`Locker`](crate::locker::Locker).
#[async_trait]
pub trait LockAdapter: Send + Sync {
    /// Idempotent backend initialization (collections, indexes, TTL).
    async fn setup(&self, _options: SetupOptions) -> LockerResult<()> {
        Ok(())
    }

    /// Enqueue `lock` and block until it is `Acquired`, or return without
    /// acquiring once the lock leaves `Acquiring` (timeout rejection).
    /// Failing to enqueue at all is an error.
    async fn acquire(&self, lock: Lock) -> LockerResult<()>;

    /// Remove the lock's store entry and transition it to `Released`.
    /// Fails with [`LockerError::NotInQueue`](crate::error::LockerError::NotInQueue)
    /// when the entry is already gone.
    async fn release(&self, lock: Lock) -> LockerResult<()>;

    /// Drop every entry this adapter owns.
    async fn release_all(&self) -> LockerResult<()>;

    /// Whether [`gc`](LockAdapter::gc) does anything useful.
    fn supports_gc(&self) -> bool {
        false
    }

    /// Refresh heartbeats for every registry lock and collect entries staler
    /// than `params.stale_at`.
    async fn gc(&self, _params: GcParams) -> LockerResult<GcStats> {
        Ok(GcStats::default())
    }
}

/// FIFO admission rule, evaluated against a queue ordered by insertion:
/// a writer holds the lock iff it is at the head; a reader holds it iff no
/// writer is queued ahead of it.
pub fn queue_admits<'a, I>(queue: I, id: &str, kind: LockType) -> bool
where
    I: IntoIterator<Item = (&'a str, LockType)>,
{
    match kind {
        LockType::Writer => queue
            .into_iter()
            .next()
            .map_or(false, |(head_id, _)| head_id == id),
        LockType::Reader => {
            for (entry_id, entry_kind) in queue {
                if entry_id == id {
                    return true;
                }
                if entry_kind == LockType::Writer {
                    return false;
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockType::{Reader, Writer};

    fn admits(queue: &[(&str, LockType)], id: &str, kind: LockType) -> bool {
        queue_admits(queue.iter().copied(), id, kind)
    }

    #[test]
    fn test_writer_admitted_only_at_head() {
        assert!(admits(&[("w1", Writer)], "w1", Writer));
        assert!(!admits(&[("r1", Reader), ("w1", Writer)], "w1", Writer));
        assert!(!admits(&[("w0", Writer), ("w1", Writer)], "w1", Writer));
    }

    #[test]
    fn test_reader_admitted_unless_writer_ahead() {
        assert!(admits(&[("r1", Reader)], "r1", Reader));
        assert!(admits(&[("r0", Reader), ("r1", Reader)], "r1", Reader));
        assert!(!admits(&[("w0", Writer), ("r1", Reader)], "r1", Reader));
        assert!(!admits(
            &[("r0", Reader), ("w0", Writer), ("r1", Reader)],
            "r1",
            Reader
        ));
    }

    #[test]
    fn test_reader_ahead_of_writer_is_admitted() {
        assert!(admits(&[("r0", Reader), ("w0", Writer)], "r0", Reader));
    }

    #[test]
    fn test_absent_entry_is_never_admitted() {
        assert!(!admits(&[], "r1", Reader));
        assert!(!admits(&[], "w1", Writer));
        assert!(!admits(&[("r0", Reader)], "r1", Reader));
    }
}
