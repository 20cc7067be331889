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

//! Error types for lock coordination.

use crate::lock::LockStatus;
use thiserror::Error;

/// Result type for lock operations.
pub type LockerResult<T> = Result<T, LockerError>;

/// Errors that can occur during lock coordination.
///
/// The enum is `Clone` because a rejection reason is stored on the rejected
/// [`Lock`](crate::lock::Lock) and returned to the caller at the same time.
#[derive(Error, Debug, Clone)]
pub enum LockerError {
    /// Illegal state-machine transition (programmer error)
    #[error("cannot transition lock from {from} to {to}")]
    Workflow { from: LockStatus, to: LockStatus },

    /// The acquire timeout fired before the queue admitted the lock
    #[error("lock \"{name}\" was not acquired within {timeout_ms} ms")]
    AcquireTimeout { name: String, timeout_ms: u64 },

    /// The queue entry is gone (double release, or collected as stale)
    #[error("lock \"{name}\" is not in the queue anymore")]
    NotInQueue { name: String },

    /// Adapter failure while working on a specific lock
    #[error("lock \"{name}\" failed: {reason}")]
    Lock { name: String, reason: String },

    /// Adapter failure not tied to a single lock (setup, gc, ...)
    #[error("adapter error: {0}")]
    Adapter(String),

    /// A tunable was set to a non-positive value
    #[error("option {option} must be a positive integer, got {value}")]
    InvalidOption { option: &'static str, value: u64 },

    /// The previous garbage-collection cycle was still running when the next
    /// tick fired
    #[error("previous garbage-collection cycle still running, consider raising the gc interval")]
    GcCycleOverlap,

    /// Broken internal invariant
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

#[cfg(feature = "mongodb-backend")]
impl From<mongodb::error::Error> for LockerError {
    fn from(err: mongodb::error::Error) -> Self {
        LockerError::Adapter(format!("MongoDB error: {}", err))
    }
}
