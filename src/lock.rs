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

//! Lock entity: identity, tunables, and the lifecycle state machine.
//!
//! ## State machine
//! ```text
//! Acquiring ──► Acquired ──► Releasing ──► Released
//!     │             └──────────────────────►┘
//!     └──► Rejected
//! ```
//! Any other transition is refused with [`LockerError::Workflow`] and leaves
//! the lock unchanged.

use crate::error::{LockerError, LockerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use ulid::Ulid;

/// Default delay between two admission polls.
pub const DEFAULT_PULL_INTERVAL_MS: u64 = 25;

/// The two modes of a readers-writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Shared: any number of readers may hold the lock together
    Reader,
    /// Exclusive: mutually exclusive with readers and other writers
    Writer,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Reader => write!(f, "reader"),
            LockType::Writer => write!(f, "writer"),
        }
    }
}

/// Lifecycle states of a [`Lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStatus {
    /// Queued, waiting for the admission rule
    Acquiring,
    /// Currently held
    Acquired,
    /// Release in flight
    Releasing,
    /// Released; terminal
    Released,
    /// Never acquired (timeout or adapter failure); terminal
    Rejected,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockStatus::Acquiring => "Acquiring",
            LockStatus::Acquired => "Acquired",
            LockStatus::Releasing => "Releasing",
            LockStatus::Released => "Released",
            LockStatus::Rejected => "Rejected",
        };
        write!(f, "{}", s)
    }
}

/// Per-acquisition tunables.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Reject the acquisition if it is not admitted within this many
    /// milliseconds. `None` waits forever.
    pub acquire_timeout_ms: Option<u64>,
    /// Delay between two admission polls.
    pub pull_interval_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: None,
            pull_interval_ms: DEFAULT_PULL_INTERVAL_MS,
        }
    }
}

impl LockOptions {
    /// Both tunables must be positive when set.
    pub(crate) fn validate(&self) -> LockerResult<()> {
        if self.pull_interval_ms == 0 {
            return Err(LockerError::InvalidOption {
                option: "pull_interval_ms",
                value: 0,
            });
        }
        if self.acquire_timeout_ms == Some(0) {
            return Err(LockerError::InvalidOption {
                option: "acquire_timeout_ms",
                value: 0,
            });
        }
        Ok(())
    }

    /// The poll delay as a [`Duration`].
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }
}

#[derive(Debug)]
struct LockState {
    status: LockStatus,
    settled_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    reason: Option<LockerError>,
}

#[derive(Debug)]
struct LockInner {
    id: String,
    name: String,
    kind: LockType,
    options: LockOptions,
    created_at: DateTime<Utc>,
    state: RwLock<LockState>,
}

/// One requested lock instance.
///
/// Cloning is cheap and every clone observes the same state; the lock's
/// identity is its `id`, which is what the registry and the store queues key
/// by.
#[derive(Debug, Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    /// Build a fresh lock in `Acquiring` state.
    pub(crate) fn new(name: impl Into<String>, kind: LockType, options: LockOptions) -> Self {
        Self {
            inner: Arc::new(LockInner {
                id: Ulid::new().to_string(),
                name: name.into(),
                kind,
                options,
                created_at: Utc::now(),
                state: RwLock::new(LockState {
                    status: LockStatus::Acquiring,
                    settled_at: None,
                    released_at: None,
                    reason: None,
                }),
            }),
        }
    }

    /// Process-unique opaque id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The coordination key shared by all contenders.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> LockType {
        self.inner.kind
    }

    pub fn options(&self) -> &LockOptions {
        &self.inner.options
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub async fn status(&self) -> LockStatus {
        self.inner.state.read().await.status
    }

    pub async fn is_acquiring(&self) -> bool {
        self.status().await == LockStatus::Acquiring
    }

    pub async fn is_acquired(&self) -> bool {
        self.status().await == LockStatus::Acquired
    }

    /// When the lock settled (reached `Acquired` or `Rejected`).
    pub async fn settled_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().await.settled_at
    }

    /// When the lock reached `Released`.
    pub async fn released_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().await.released_at
    }

    /// Time spent waiting in the queue before settling.
    pub async fn settled_in(&self) -> Option<Duration> {
        let settled_at = self.settled_at().await?;
        (settled_at - self.inner.created_at).to_std().ok()
    }

    /// Time the lock was held, from settling to release.
    pub async fn acquired_for(&self) -> Option<Duration> {
        let state = self.inner.state.read().await;
        let settled_at = state.settled_at?;
        let released_at = state.released_at?;
        (released_at - settled_at).to_std().ok()
    }

    /// Why the lock was rejected. `None` unless the status is `Rejected`.
    pub async fn reason(&self) -> Option<LockerError> {
        self.inner.state.read().await.reason.clone()
    }

    /// Move the lock to `to`, stamping timestamps on the way.
    ///
    /// Only the edges of the lifecycle diagram are legal; anything else fails
    /// with [`LockerError::Workflow`] without mutating state. Adapters call
    /// this to mark a lock `Acquired` or `Released`.
    pub async fn transition(&self, to: LockStatus) -> LockerResult<()> {
        let mut state = self.inner.state.write().await;
        let legal = matches!(
            (state.status, to),
            (LockStatus::Acquiring, LockStatus::Acquired)
                | (LockStatus::Acquiring, LockStatus::Rejected)
                | (LockStatus::Acquired, LockStatus::Releasing)
                | (LockStatus::Acquired, LockStatus::Released)
                | (LockStatus::Releasing, LockStatus::Released)
        );
        if !legal {
            return Err(LockerError::Workflow {
                from: state.status,
                to,
            });
        }
        match to {
            LockStatus::Acquired | LockStatus::Rejected => {
                state.settled_at = Some(Utc::now());
            }
            LockStatus::Released => {
                if state.settled_at.is_none() {
                    return Err(LockerError::Internal(format!(
                        "lock \"{}\" released without ever settling",
                        self.inner.name
                    )));
                }
                state.released_at = Some(Utc::now());
            }
            _ => {}
        }
        state.status = to;
        Ok(())
    }

    /// Store `reason` and move `Acquiring -> Rejected` in one step.
    pub async fn reject(&self, reason: LockerError) -> LockerResult<()> {
        let mut state = self.inner.state.write().await;
        if state.status != LockStatus::Acquiring {
            return Err(LockerError::Workflow {
                from: state.status,
                to: LockStatus::Rejected,
            });
        }
        state.reason = Some(reason);
        state.settled_at = Some(Utc::now());
        state.status = LockStatus::Rejected;
        Ok(())
    }
}
