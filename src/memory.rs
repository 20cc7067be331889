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

//! In-memory lock adapter (single-process reference implementation).
//!
//! ## Purpose
//! Implements the queue protocol on plain process memory. Used by tests as
//! the semantic oracle for the admission rule, and usable directly wherever
//! coordination never leaves one process.
//!
//! ## Limitations
//! - Not persistent (queues lost on restart)
//! - Not distributed (single process only)

use crate::adapter::{queue_admits, GcParams, GcStats, LockAdapter};
use crate::error::{LockerError, LockerResult};
use crate::lock::{Lock, LockStatus, LockType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::sleep;

#[derive(Debug, Clone)]
struct Slot {
    id: String,
    kind: LockType,
    at: DateTime<Utc>,
}

/// In-memory queue-per-name lock adapter.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockAdapter {
    queues: Arc<RwLock<HashMap<String, Vec<Slot>>>>,
}

impl InMemoryLockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one name's queue in insertion order, for inspection.
    pub async fn entries(&self, name: &str) -> Vec<(String, LockType)> {
        self.queues
            .read()
            .await
            .get(name)
            .map(|slots| {
                slots
                    .iter()
                    .map(|slot| (slot.id.clone(), slot.kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn enqueue(&self, lock: &Lock) {
        let mut queues = self.queues.write().await;
        queues.entry(lock.name().to_string()).or_default().push(Slot {
            id: lock.id().to_string(),
            kind: lock.kind(),
            at: lock.created_at(),
        });
    }

    async fn admitted(&self, lock: &Lock) -> bool {
        let queues = self.queues.read().await;
        queues.get(lock.name()).map_or(false, |slots| {
            queue_admits(
                slots.iter().map(|slot| (slot.id.as_str(), slot.kind)),
                lock.id(),
                lock.kind(),
            )
        })
    }

    /// Returns whether an entry was present.
    async fn remove_entry(&self, lock: &Lock) -> bool {
        let mut queues = self.queues.write().await;
        let Some(slots) = queues.get_mut(lock.name()) else {
            return false;
        };
        let Some(position) = slots.iter().position(|slot| slot.id == lock.id()) else {
            return false;
        };
        slots.remove(position);
        if slots.is_empty() {
            queues.remove(lock.name());
        }
        true
    }
}

#[async_trait]
impl LockAdapter for InMemoryLockAdapter {
    async fn acquire(&self, lock: Lock) -> LockerResult<()> {
        self.enqueue(&lock).await;
        loop {
            if self.admitted(&lock).await {
                // losing this race means the lock left Acquiring concurrently
                let _ = lock.transition(LockStatus::Acquired).await;
                break;
            }
            if lock.status().await != LockStatus::Acquiring {
                break;
            }
            sleep(lock.options().pull_interval()).await;
        }
        if lock.status().await != LockStatus::Acquired {
            self.remove_entry(&lock).await;
        }
        Ok(())
    }

    async fn release(&self, lock: Lock) -> LockerResult<()> {
        if !self.remove_entry(&lock).await {
            return Err(LockerError::NotInQueue {
                name: lock.name().to_string(),
            });
        }
        lock.transition(LockStatus::Released).await
    }

    async fn release_all(&self) -> LockerResult<()> {
        self.queues.write().await.clear();
        Ok(())
    }

    fn supports_gc(&self) -> bool {
        true
    }

    async fn gc(&self, params: GcParams) -> LockerResult<GcStats> {
        let live: HashSet<String> = params.registry.ids().await.into_iter().collect();
        let mut queues = self.queues.write().await;
        let mut stats = GcStats::default();
        for slots in queues.values_mut() {
            // refresh before collecting so a registered lock is never culled
            // by its own process
            for slot in slots.iter_mut() {
                if live.contains(&slot.id) && slot.at < params.at {
                    slot.at = params.at;
                    stats.refreshed += 1;
                }
            }
            let before = slots.len();
            slots.retain(|slot| slot.at >= params.stale_at);
            stats.collected += (before - slots.len()) as u64;
        }
        queues.retain(|_, slots| !slots.is_empty());
        Ok(stats)
    }
}
