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

//! # FleetLocks — queue-fair distributed readers-writer locks
//!
//! ## Purpose
//! Lets independent processes take named locks in two modes — `Reader`
//! (shared) or `Writer` (exclusive) — with classical readers-writer semantics
//! across the whole fleet: any number of concurrent readers per name, writers
//! mutually exclusive with everything else on that name. Locks are advisory
//! and cooperative; they carry no data payload.
//!
//! ## Architecture Context
//! A [`Locker`] coordinates acquisitions per process: it tracks live locks in
//! a [`LockRegistry`], drives the acquire timeout, broadcasts
//! [`LockerEvent`]s, and runs periodic garbage collection. Storage is behind
//! the [`LockAdapter`] trait; fairness comes from a per-name FIFO queue in
//! the store, with the admission rule evaluated client-side: a writer holds
//! the lock at the head of the queue, a reader holds it when no writer is
//! queued ahead of it.
//!
//! ## Design Decisions
//! - **Queue-based fairness**: insertion order in the store decides
//!   admission; an arriving writer blocks readers that land behind it
//! - **Heartbeat liveness**: GC refreshes `at` timestamps for live local
//!   locks (`$max`, monotonic) and culls entries older than
//!   `now - 2 * gc_interval`; a store TTL sweeps orphan documents of crashed
//!   processes
//! - **Cooperative polling**: the store offers no blocking wait, so adapters
//!   re-check admission every `pull_interval_ms` (default 25 ms)
//! - **No reentrancy**: a second acquisition on a held name queues like any
//!   other contender; callers must impose a lock order across names
//!
//! ## Backend Support
//! - **InMemory** (feature `memory-backend`): single-process, the semantic
//!   oracle used by tests
//! - **MongoDB** (feature `mongodb-backend`): one queue document per name,
//!   unique `name` index, TTL on the document heartbeat
//!
//! ## Examples
//!
//! ```rust,no_run
//! use fleet_locks::{LockOptions, Locker, LockerOptions};
//! use fleet_locks::memory::InMemoryLockAdapter;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let locker = Locker::new(
//!     Arc::new(InMemoryLockAdapter::new()),
//!     LockerOptions::with_gc_interval_ms(60_000),
//! );
//! locker.setup().await?;
//!
//! // explicit acquire/release
//! let lock = locker.lock_as_writer("invoices", LockOptions::default()).await?;
//! // ... exclusive section ...
//! locker.release(&lock).await?;
//!
//! // or scope a task to the lock
//! let total = locker
//!     .ensure_reading_task_concurrency("invoices", || async { 42u64 }, LockOptions::default())
//!     .await?;
//! assert_eq!(total, 42);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod error;
pub mod events;
pub mod lock;
pub mod locker;
pub mod registry;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "mongodb-backend")]
pub mod mongo;

pub use adapter::{queue_admits, GcParams, GcStats, LockAdapter, SetupOptions};
pub use error::{LockerError, LockerResult};
pub use events::{GarbageCycle, LockerEvent};
pub use lock::{Lock, LockOptions, LockStatus, LockType, DEFAULT_PULL_INTERVAL_MS};
pub use locker::{Locker, LockerOptions, DEFAULT_GC_INTERVAL_MS};
pub use registry::LockRegistry;
