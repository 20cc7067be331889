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

//! MongoDB-based lock adapter.
//!
//! ## Purpose
//! Production backend for cross-process coordination: one queue document per
//! lock name, FIFO admission computed client-side, liveness through
//! GC-refreshed heartbeats plus a TTL index for crashed owners.
//!
//! ## Document shape
//! ```text
//! { name: "invoices",
//!   at: ISODate(...),                          // document-level heartbeat
//!   queue: [ { id, type: "reader"|"writer", at: ISODate(...) }, ... ] }
//! ```
//!
//! ## Indexes (maintained by `setup`)
//! - `idx_name`     `{name: 1}` unique — one document per name
//! - `idx_queue_id` `{queue.id: 1}`    — poll and refresh lookups
//! - `idx_at`       `{at: 1}`          — TTL `ceil(gc_interval * 3)` seconds
//!   when GC is enabled, so orphan documents of crashed processes expire
//!
//! ## Consistency
//! Every mutation is a single-document atomic update (`find_one_and_update`
//! with upsert, `$pull`, `$max`); no multi-document transactions. Admission
//! polls read from the primary so replica lag cannot decide admission.
//! Heartbeat refresh uses `$max` against a client-generated timestamp, which
//! keeps reordered writes monotonic.

use crate::adapter::{queue_admits, GcParams, GcStats, LockAdapter, SetupOptions};
use crate::error::{LockerError, LockerResult};
use crate::lock::{Lock, LockStatus, LockType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::TryStreamExt;
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOneOptions, IndexOptions, ReadPreference, ReturnDocument,
    SelectionCriteria,
};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Default collection holding the queue documents.
pub const DEFAULT_COLLECTION_NAME: &str = "locks";

const IDX_NAME: &str = "idx_name";
const IDX_QUEUE_ID: &str = "idx_queue_id";
const IDX_AT: &str = "idx_at";

const NAMESPACE_EXISTS: i32 = 48;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
const DUPLICATE_KEY: i32 = 11000;

/// One queue document, `name`-unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    name: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    at: DateTime<Utc>,
    #[serde(default)]
    queue: Vec<QueueEntry>,
}

/// One waiting or holding lock inside a queue document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    id: String,
    #[serde(rename = "type")]
    kind: LockType,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    at: DateTime<Utc>,
}

/// Configuration of a [`MongoLockAdapter`].
#[derive(Debug, Clone)]
pub struct MongoAdapterConfig {
    pub collection_name: String,
}

impl Default for MongoAdapterConfig {
    fn default() -> Self {
        Self {
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
        }
    }
}

/// MongoDB lock adapter.
///
/// ## Example
/// ```rust,no_run
/// use fleet_locks::{Locker, LockerOptions, mongo::MongoLockAdapter};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = mongodb::Client::with_uri_str("mongodb://127.0.0.1:27017").await?;
/// let adapter = Arc::new(MongoLockAdapter::new(&client.database("app")));
/// let locker = Locker::new(adapter, LockerOptions::with_gc());
/// locker.setup().await?;
/// let lock = locker.lock_as_writer("invoices", Default::default()).await?;
/// locker.release(&lock).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MongoLockAdapter {
    db: Database,
    collection: Collection<QueueRecord>,
    /// Ids this adapter instance enqueued and has not yet removed; the scope
    /// of `release_all`.
    owned: Arc<RwLock<HashSet<String>>>,
}

fn error_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        _ => None,
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    error_code(err) == Some(DUPLICATE_KEY)
}

impl MongoLockAdapter {
    /// Adapter over the default `locks` collection of `db`.
    pub fn new(db: &Database) -> Self {
        Self::with_config(db, MongoAdapterConfig::default())
    }

    pub fn with_config(db: &Database, config: MongoAdapterConfig) -> Self {
        Self {
            db: db.clone(),
            collection: db.collection(&config.collection_name),
            owned: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    async fn ensure_collection(&self) -> LockerResult<()> {
        match self.db.create_collection(self.collection.name(), None).await {
            Ok(()) => Ok(()),
            Err(err) if error_code(&err) == Some(NAMESPACE_EXISTS) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_indexes(&self, gc_interval_ms: Option<u64>) -> LockerResult<()> {
        let mut desired = vec![
            IndexModel::builder()
                .keys(doc! { "name": 1 })
                .options(
                    IndexOptions::builder()
                        .name(IDX_NAME.to_string())
                        .unique(true)
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "queue.id": 1 })
                .options(IndexOptions::builder().name(IDX_QUEUE_ID.to_string()).build())
                .build(),
        ];
        let at_options = match gc_interval_ms {
            Some(interval_ms) => IndexOptions::builder()
                .name(IDX_AT.to_string())
                .expire_after(Duration::from_secs((interval_ms * 3).div_ceil(1000)))
                .build(),
            None => IndexOptions::builder().name(IDX_AT.to_string()).build(),
        };
        desired.push(
            IndexModel::builder()
                .keys(doc! { "at": 1 })
                .options(at_options)
                .build(),
        );

        // drop leftovers from older layouts first
        let keep: HashSet<&str> = [IDX_NAME, IDX_QUEUE_ID, IDX_AT].into_iter().collect();
        let existing: Vec<IndexModel> = self
            .collection
            .list_indexes(None)
            .await?
            .try_collect()
            .await?;
        for index in &existing {
            let Some(name) = index.options.as_ref().and_then(|o| o.name.as_deref()) else {
                continue;
            };
            if name == "_id_" || keep.contains(name) {
                continue;
            }
            self.collection.drop_index(name, None).await?;
        }

        for model in desired {
            let name = model
                .options
                .as_ref()
                .and_then(|o| o.name.clone())
                .unwrap_or_default();
            match self.collection.create_index(model.clone(), None).await {
                Ok(_) => {}
                Err(err)
                    if matches!(
                        error_code(&err),
                        Some(INDEX_OPTIONS_CONFLICT) | Some(INDEX_KEY_SPECS_CONFLICT)
                    ) =>
                {
                    // same name or keys with different options: recreate
                    self.collection.drop_index(&name, None).await?;
                    self.collection.create_index(model, None).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Upsert-and-push the lock into its name's queue, returning the updated
    /// document. Two racing upserts can both decide to insert, in which case
    /// the loser hits the unique index; retried up to two more times.
    async fn enqueue(&self, lock: &Lock) -> LockerResult<QueueRecord> {
        let at = BsonDateTime::from_chrono(lock.created_at());
        let filter = doc! { "name": lock.name() };
        let update = doc! {
            "$setOnInsert": { "name": lock.name() },
            "$max": { "at": at },
            "$push": { "queue": { "id": lock.id(), "type": lock.kind().to_string(), "at": at } },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let mut attempts = 0;
        loop {
            match self
                .collection
                .find_one_and_update(filter.clone(), update.clone(), options.clone())
                .await
            {
                Ok(Some(record)) => {
                    self.owned.write().await.insert(lock.id().to_string());
                    return Ok(record);
                }
                Ok(None) => {
                    return Err(LockerError::Adapter(
                        "queue upsert returned no document".to_string(),
                    ))
                }
                Err(err) if is_duplicate_key(&err) && attempts < 2 => {
                    attempts += 1;
                    metrics::counter!(
                        "fleet_locks_mongo_enqueue_retries_total",
                        "backend" => "mongodb"
                    )
                    .increment(1);
                }
                Err(err) => {
                    metrics::counter!(
                        "fleet_locks_mongo_acquire_errors_total",
                        "backend" => "mongodb",
                        "error_type" => "enqueue_failed"
                    )
                    .increment(1);
                    return Err(LockerError::Lock {
                        name: lock.name().to_string(),
                        reason: format!("failed to enqueue: {}", err),
                    });
                }
            }
        }
    }

    /// Re-read the queue document holding this lock, from the primary: a
    /// stale secondary view must never decide admission.
    async fn fetch(&self, lock: &Lock) -> LockerResult<Option<QueueRecord>> {
        let options = FindOneOptions::builder()
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .build();
        Ok(self
            .collection
            .find_one(doc! { "queue.id": lock.id() }, options)
            .await?)
    }

    fn admits(record: &QueueRecord, lock: &Lock) -> bool {
        queue_admits(
            record
                .queue
                .iter()
                .map(|entry| (entry.id.as_str(), entry.kind)),
            lock.id(),
            lock.kind(),
        )
    }

    /// Best-effort removal of a lock that exits without acquiring; silent if
    /// the entry is already gone.
    async fn dequeue(&self, lock: &Lock) {
        let result = self
            .collection
            .update_one(
                doc! { "queue.id": lock.id() },
                doc! { "$pull": { "queue": { "id": lock.id() } } },
                None,
            )
            .await;
        if let Err(err) = result {
            warn!(
                name = %lock.name(),
                id = %lock.id(),
                error = %err,
                "failed to dequeue abandoned lock, entry left for gc"
            );
        }
        self.owned.write().await.remove(lock.id());
    }
}

#[async_trait]
impl LockAdapter for MongoLockAdapter {
    #[instrument(skip(self, options), fields(collection = %self.collection.name()))]
    async fn setup(&self, options: SetupOptions) -> LockerResult<()> {
        let start = std::time::Instant::now();
        self.ensure_collection().await?;
        self.ensure_indexes(options.gc_interval_ms).await?;
        metrics::histogram!(
            "fleet_locks_mongo_setup_duration_seconds",
            "backend" => "mongodb"
        )
        .record(start.elapsed().as_secs_f64());
        debug!(
            collection = %self.collection.name(),
            gc_interval_ms = ?options.gc_interval_ms,
            duration_ms = start.elapsed().as_millis(),
            "lock collection ready"
        );
        Ok(())
    }

    #[instrument(
        skip(self, lock),
        fields(name = %lock.name(), id = %lock.id(), kind = %lock.kind())
    )]
    async fn acquire(&self, lock: Lock) -> LockerResult<()> {
        let start = std::time::Instant::now();
        // first admission check runs on the document the upsert returned
        let mut record = Some(self.enqueue(&lock).await?);
        loop {
            let admitted = record
                .as_ref()
                .map_or(false, |record| Self::admits(record, &lock));
            if admitted {
                // losing this race means the lock left Acquiring concurrently
                let _ = lock.transition(LockStatus::Acquired).await;
                break;
            }
            if lock.status().await != LockStatus::Acquiring {
                break;
            }
            sleep(lock.options().pull_interval()).await;
            if lock.status().await != LockStatus::Acquiring {
                break;
            }
            record = match self.fetch(&lock).await {
                Ok(record) => record,
                Err(err) => {
                    self.dequeue(&lock).await;
                    metrics::counter!(
                        "fleet_locks_mongo_acquire_errors_total",
                        "backend" => "mongodb",
                        "error_type" => "poll_failed"
                    )
                    .increment(1);
                    return Err(err);
                }
            };
        }

        if lock.status().await == LockStatus::Acquired {
            metrics::histogram!(
                "fleet_locks_mongo_acquire_duration_seconds",
                "backend" => "mongodb"
            )
            .record(start.elapsed().as_secs_f64());
            metrics::counter!(
                "fleet_locks_mongo_acquire_total",
                "backend" => "mongodb",
                "result" => "acquired"
            )
            .increment(1);
            debug!(
                name = %lock.name(),
                id = %lock.id(),
                duration_ms = start.elapsed().as_millis(),
                "lock admitted"
            );
        } else {
            self.dequeue(&lock).await;
            metrics::counter!(
                "fleet_locks_mongo_acquire_total",
                "backend" => "mongodb",
                "result" => "abandoned"
            )
            .increment(1);
        }
        Ok(())
    }

    #[instrument(
        skip(self, lock),
        fields(name = %lock.name(), id = %lock.id(), kind = %lock.kind())
    )]
    async fn release(&self, lock: Lock) -> LockerResult<()> {
        let start = std::time::Instant::now();
        let result = self
            .collection
            .update_one(
                doc! { "name": lock.name() },
                doc! { "$pull": { "queue": { "id": lock.id() } } },
                None,
            )
            .await?;
        self.owned.write().await.remove(lock.id());
        if result.modified_count == 0 {
            metrics::counter!(
                "fleet_locks_mongo_release_errors_total",
                "backend" => "mongodb",
                "error_type" => "not_in_queue"
            )
            .increment(1);
            return Err(LockerError::NotInQueue {
                name: lock.name().to_string(),
            });
        }
        lock.transition(LockStatus::Released).await?;
        metrics::histogram!(
            "fleet_locks_mongo_release_duration_seconds",
            "backend" => "mongodb"
        )
        .record(start.elapsed().as_secs_f64());
        metrics::counter!(
            "fleet_locks_mongo_release_total",
            "backend" => "mongodb",
            "result" => "released"
        )
        .increment(1);
        debug!(name = %lock.name(), id = %lock.id(), "lock released");
        Ok(())
    }

    #[instrument(skip(self), fields(collection = %self.collection.name()))]
    async fn release_all(&self) -> LockerResult<()> {
        let ids: Vec<String> = self.owned.read().await.iter().cloned().collect();
        if !ids.is_empty() {
            self.collection
                .update_many(
                    doc! {},
                    doc! { "$pull": { "queue": { "id": { "$in": ids } } } },
                    None,
                )
                .await?;
        }
        self.owned.write().await.clear();
        Ok(())
    }

    fn supports_gc(&self) -> bool {
        true
    }

    #[instrument(skip(self, params), fields(at = %params.at, stale_at = %params.stale_at))]
    async fn gc(&self, params: GcParams) -> LockerResult<GcStats> {
        let start = std::time::Instant::now();
        let at = BsonDateTime::from_chrono(params.at);
        let stale_at = BsonDateTime::from_chrono(params.stale_at);

        // collect and refresh are independent single-document updates; `$max`
        // keeps the heartbeat monotonic whichever lands first
        let collect = self.collection.update_many(
            doc! {},
            doc! { "$pull": { "queue": { "at": { "$lt": stale_at } } } },
            None,
        );
        let locks = params.registry.locks().await;
        let refresh = join_all(locks.iter().map(|lock| {
            self.collection.update_one(
                doc! { "queue.id": lock.id() },
                doc! { "$max": { "queue.$.at": at, "at": at } },
                None,
            )
        }));

        let (collect_result, refresh_results) = tokio::join!(collect, refresh);
        let collected = collect_result?.modified_count;
        let mut refreshed = 0u64;
        for result in refresh_results {
            if result?.modified_count > 0 {
                refreshed += 1;
            }
        }

        metrics::histogram!(
            "fleet_locks_mongo_gc_duration_seconds",
            "backend" => "mongodb"
        )
        .record(start.elapsed().as_secs_f64());
        metrics::counter!(
            "fleet_locks_mongo_gc_collected_total",
            "backend" => "mongodb"
        )
        .increment(collected);
        debug!(
            collected,
            refreshed,
            duration_ms = start.elapsed().as_millis(),
            "garbage collection cycle finished"
        );
        Ok(GcStats {
            collected,
            refreshed,
        })
    }
}
