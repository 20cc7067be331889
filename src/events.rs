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

//! Events broadcast by the [`Locker`](crate::locker::Locker).
//!
//! Delivered over a `tokio::sync::broadcast` channel in the order the state
//! transitions happened; a slow or dropped listener never affects lock
//! operations.

use crate::error::LockerError;
use crate::lock::Lock;
use std::time::Duration;

/// Summary of one completed garbage-collection cycle.
#[derive(Debug, Clone)]
pub struct GarbageCycle {
    pub collected: u64,
    pub refreshed: u64,
    pub took: Duration,
}

/// Everything a [`Locker`](crate::locker::Locker) announces.
#[derive(Debug, Clone)]
pub enum LockerEvent {
    /// The lock settled as `Acquired`
    AcquiredLock(Lock),
    /// The lock settled as `Rejected`; its `reason()` says why
    RejectedLock(Lock),
    /// The lock was released
    ReleasedLock(Lock),
    /// A GC cycle finished
    GarbageCycle(GarbageCycle),
    /// A background failure (GC cycle error, cycle overlap)
    Error(LockerError),
}
