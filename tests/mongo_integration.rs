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

//! MongoDB adapter integration tests.
//!
//! These need a running server, resolved from `MONGODB_URL`
//! (e.g. `mongodb://127.0.0.1:27017`); every test skips when it is unset.
//! Each test works in its own collection so runs never interfere.

#![cfg(feature = "mongodb-backend")]

use fleet_locks::mongo::{MongoAdapterConfig, MongoLockAdapter};
use fleet_locks::{
    GcParams, LockAdapter, LockOptions, Locker, LockerError, LockerOptions,
};
use mongodb::bson::{doc, Document};
use mongodb::{Client, Database};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use ulid::Ulid;

fn fast_options() -> LockOptions {
    LockOptions {
        acquire_timeout_ms: None,
        pull_interval_ms: 5,
    }
}

async fn test_database() -> Option<Database> {
    let url = std::env::var("MONGODB_URL").ok()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let client = Client::with_uri_str(&url)
        .await
        .expect("failed to connect to MONGODB_URL");
    Some(client.database("fleet_locks_tests"))
}

fn unique_collection(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new()).to_lowercase()
}

fn create_adapter(db: &Database, collection: &str) -> Arc<MongoLockAdapter> {
    Arc::new(MongoLockAdapter::with_config(
        db,
        MongoAdapterConfig {
            collection_name: collection.to_string(),
        },
    ))
}

async fn raw_record(db: &Database, collection: &str, name: &str) -> Option<Document> {
    db.collection::<Document>(collection)
        .find_one(doc! { "name": name }, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_setup_creates_indexes() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("setup");
    let adapter = create_adapter(&db, &collection);
    let locker = Locker::new(adapter, LockerOptions::with_gc_interval_ms(500));

    locker.setup().await.unwrap();
    // memoized on first success, also safe when the adapter re-runs
    locker.setup().await.unwrap();

    let names = db
        .collection::<Document>(&collection)
        .list_index_names()
        .await
        .unwrap();
    assert!(names.contains(&"idx_name".to_string()));
    assert!(names.contains(&"idx_queue_id".to_string()));
    assert!(names.contains(&"idx_at".to_string()));

    db.collection::<Document>(&collection).drop(None).await.unwrap();
}

#[tokio::test]
async fn test_queue_document_shape() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("shape");
    let adapter = create_adapter(&db, &collection);
    let locker = Locker::new(adapter, LockerOptions::default());
    locker.setup().await.unwrap();

    let writer = locker.lock_as_writer("orders", fast_options()).await.unwrap();

    let record = raw_record(&db, &collection, "orders").await.unwrap();
    assert_eq!(record.get_str("name").unwrap(), "orders");
    assert!(record.get_datetime("at").is_ok());
    let queue = record.get_array("queue").unwrap();
    assert_eq!(queue.len(), 1);
    let entry = queue[0].as_document().unwrap();
    assert_eq!(entry.get_str("id").unwrap(), writer.id());
    assert_eq!(entry.get_str("type").unwrap(), "writer");
    assert!(entry.get_datetime("at").is_ok());

    locker.release(&writer).await.unwrap();
    let record = raw_record(&db, &collection, "orders").await.unwrap();
    assert!(record.get_array("queue").unwrap().is_empty());

    db.collection::<Document>(&collection).drop(None).await.unwrap();
}

#[tokio::test]
async fn test_readers_share_while_writer_times_out() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("rw");
    let adapter = create_adapter(&db, &collection);
    let locker = Locker::new(adapter, LockerOptions::default());
    locker.setup().await.unwrap();

    let first = locker.lock_as_reader("ledger", fast_options()).await.unwrap();
    let second = locker.lock_as_reader("ledger", fast_options()).await.unwrap();
    assert!(first.is_acquired().await);
    assert!(second.is_acquired().await);

    let err = locker
        .lock_as_writer(
            "ledger",
            LockOptions {
                acquire_timeout_ms: Some(200),
                pull_interval_ms: 5,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LockerError::AcquireTimeout { .. }));

    locker.release_many([first, second]).await.unwrap();
    let writer = locker.lock_as_writer("ledger", fast_options()).await.unwrap();
    assert!(writer.is_acquired().await);
    locker.release(&writer).await.unwrap();

    db.collection::<Document>(&collection).drop(None).await.unwrap();
}

#[tokio::test]
async fn test_writers_queue_in_fifo_order() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("fifo");
    let adapter = create_adapter(&db, &collection);
    let locker = Locker::new(adapter, LockerOptions::default());
    locker.setup().await.unwrap();

    let holder = locker.lock_as_writer("jobs", fast_options()).await.unwrap();
    let pending = {
        let locker = locker.clone();
        tokio::spawn(async move { locker.lock_as_writer("jobs", fast_options()).await })
    };
    sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    locker.release(&holder).await.unwrap();
    let next = pending.await.unwrap().unwrap();
    assert!(next.is_acquired().await);
    locker.release(&next).await.unwrap();

    db.collection::<Document>(&collection).drop(None).await.unwrap();
}

#[tokio::test]
async fn test_direct_release_fails_loudly_when_absent() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("absent");
    let adapter = create_adapter(&db, &collection);
    let locker = Locker::new(adapter.clone(), LockerOptions::default());
    locker.setup().await.unwrap();

    let lock = locker.lock_as_reader("single", fast_options()).await.unwrap();
    adapter.release(lock.clone()).await.unwrap();

    let err = adapter.release(lock).await.unwrap_err();
    assert!(matches!(err, LockerError::NotInQueue { .. }));

    db.collection::<Document>(&collection).drop(None).await.unwrap();
}

#[tokio::test]
async fn test_gc_collects_stale_and_refreshes_live() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("gc");
    let adapter = create_adapter(&db, &collection);
    let locker = Locker::new(adapter.clone(), LockerOptions::default());
    locker.setup().await.unwrap();

    let live = locker.lock_as_reader("leases", fast_options()).await.unwrap();
    let orphan = locker.lock_as_reader("leases", fast_options()).await.unwrap();
    assert!(locker.registry().remove(&orphan).await);

    // backdate the orphan's heartbeat past the cutoff, as if its owner had
    // crashed several cycles ago
    let stale_heartbeat =
        mongodb::bson::DateTime::from_chrono(chrono::Utc::now() - chrono::Duration::seconds(5));
    db.collection::<Document>(&collection)
        .update_one(
            doc! { "queue.id": orphan.id() },
            doc! { "$set": { "queue.$.at": stale_heartbeat } },
            None,
        )
        .await
        .unwrap();

    let at = chrono::Utc::now();
    let stats = adapter
        .gc(GcParams {
            registry: locker.registry().clone(),
            gc_interval_ms: 500,
            at,
            stale_at: at - chrono::Duration::milliseconds(1000),
        })
        .await
        .unwrap();
    assert_eq!(stats.refreshed, 1);
    assert_eq!(stats.collected, 1);

    let err = adapter.release(orphan).await.unwrap_err();
    assert!(matches!(err, LockerError::NotInQueue { .. }));
    locker.release(&live).await.unwrap();

    db.collection::<Document>(&collection).drop(None).await.unwrap();
}

#[tokio::test]
async fn test_release_all_pulls_only_owned_entries() {
    let Some(db) = test_database().await else {
        eprintln!("MONGODB_URL not set, skipping");
        return;
    };
    let collection = unique_collection("all");
    let ours = create_adapter(&db, &collection);
    let theirs = create_adapter(&db, &collection);
    let our_locker = Locker::new(ours, LockerOptions::default());
    let their_locker = Locker::new(theirs, LockerOptions::default());
    our_locker.setup().await.unwrap();

    our_locker.lock_as_reader("mixed", fast_options()).await.unwrap();
    our_locker.lock_as_reader("mixed", fast_options()).await.unwrap();
    let foreign = their_locker.lock_as_reader("mixed", fast_options()).await.unwrap();

    our_locker.release_all().await.unwrap();

    let record = raw_record(&db, &collection, "mixed").await.unwrap();
    let queue = record.get_array("queue").unwrap();
    assert_eq!(queue.len(), 1, "the other process's entry must survive");
    assert_eq!(
        queue[0].as_document().unwrap().get_str("id").unwrap(),
        foreign.id()
    );

    their_locker.release(&foreign).await.unwrap();
    db.collection::<Document>(&collection).drop(None).await.unwrap();
}
