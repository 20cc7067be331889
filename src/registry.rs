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

//! Process-local registry of live locks.
//!
//! A lock is tracked from enqueue until its terminal transition. GC refreshes
//! the heartbeats of exactly the locks found here, so detaching a lock from
//! the registry is what makes its store entry eligible for collection.

use crate::lock::{Lock, LockStatus, LockType};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared set of locks currently tracked by one process, keyed by lock id.
///
/// Membership is by identity: two locks on the same name are distinct entries.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    inner: Arc<RwLock<HashMap<String, Lock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, lock: Lock) {
        self.inner
            .write()
            .await
            .insert(lock.id().to_string(), lock);
    }

    /// Returns whether the lock was present.
    pub async fn remove(&self, lock: &Lock) -> bool {
        self.inner.write().await.remove(lock.id()).is_some()
    }

    pub async fn contains(&self, lock: &Lock) -> bool {
        self.inner.read().await.contains_key(lock.id())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    /// Snapshot of every tracked lock.
    pub async fn locks(&self) -> Vec<Lock> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Ids of every tracked lock.
    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn by_name(&self, name: &str) -> Vec<Lock> {
        self.inner
            .read()
            .await
            .values()
            .filter(|lock| lock.name() == name)
            .cloned()
            .collect()
    }

    pub async fn by_kind(&self, kind: LockType) -> Vec<Lock> {
        self.inner
            .read()
            .await
            .values()
            .filter(|lock| lock.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn by_status(&self, status: LockStatus) -> Vec<Lock> {
        let snapshot = self.locks().await;
        let mut matched = Vec::new();
        for lock in snapshot {
            if lock.status().await == status {
                matched.push(lock);
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockOptions;

    fn lock(name: &str, kind: LockType) -> Lock {
        Lock::new(name, kind, LockOptions::default())
    }

    #[tokio::test]
    async fn test_add_remove_contains() {
        let registry = LockRegistry::new();
        let a = lock("a", LockType::Reader);
        let b = lock("a", LockType::Reader);

        registry.add(a.clone()).await;
        registry.add(b.clone()).await;
        assert_eq!(registry.len().await, 2);
        assert!(registry.contains(&a).await);
        assert!(registry.contains(&b).await);

        assert!(registry.remove(&a).await);
        assert!(!registry.remove(&a).await);
        assert_eq!(registry.len().await, 1);
        assert!(!registry.contains(&a).await);
        assert!(registry.contains(&b).await);
    }

    #[tokio::test]
    async fn test_same_name_locks_are_distinct_members() {
        let registry = LockRegistry::new();
        let a = lock("shared", LockType::Writer);
        let b = lock("shared", LockType::Writer);
        registry.add(a.clone()).await;
        registry.add(b.clone()).await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.by_name("shared").await.len(), 2);
    }

    #[tokio::test]
    async fn test_filters() {
        let registry = LockRegistry::new();
        let reader = lock("r", LockType::Reader);
        let writer = lock("w", LockType::Writer);
        registry.add(reader.clone()).await;
        registry.add(writer.clone()).await;

        assert_eq!(registry.by_kind(LockType::Reader).await.len(), 1);
        assert_eq!(registry.by_kind(LockType::Writer).await.len(), 1);
        assert_eq!(registry.by_name("r").await.len(), 1);
        assert_eq!(registry.by_name("missing").await.len(), 0);

        writer.transition(LockStatus::Acquired).await.unwrap();
        let acquired = registry.by_status(LockStatus::Acquired).await;
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].id(), writer.id());
        assert_eq!(registry.by_status(LockStatus::Acquiring).await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_ids() {
        let registry = LockRegistry::new();
        let a = lock("a", LockType::Reader);
        registry.add(a.clone()).await;
        assert_eq!(registry.ids().await, vec![a.id().to_string()]);
        registry.clear().await;
        assert!(registry.is_empty().await);
    }
}
