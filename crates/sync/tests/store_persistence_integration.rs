use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tracker_common::kind::{EntityKind, FetchKey};
use tracker_common::types::{AccountStatus, Entity, Staff, StaffRole};
use tracker_sync::engine::SyncEngine;
use tracker_sync::remote::InMemoryRepository;
use tracker_sync::store::{LocalStore, MergePolicy};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

fn staff(id: &str, name: &str, updated: i64) -> Entity {
    Entity::Staff(Staff {
        id: id.into(),
        name: name.into(),
        email: format!("{id}@example.com"),
        role: StaffRole::Operations,
        status: AccountStatus::Active,
        created_at: at(0),
        updated_at: at(updated),
        deleted_at: None,
        deleted_by: None,
    })
}

fn name_of(entity: &Entity) -> &str {
    match entity {
        Entity::Staff(staff) => &staff.name,
        other => panic!("expected staff, got {other:?}"),
    }
}

#[tokio::test]
async fn fetched_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");

    {
        let remote = Arc::new(InMemoryRepository::new());
        remote.seed([staff("s-1", "Ada", 10), staff("s-2", "Grace", 20)]);
        let store = LocalStore::open(&path, MergePolicy::LastWriteWins).unwrap();
        let engine = SyncEngine::new(remote, store);
        engine.fetch(&FetchKey::all(EntityKind::Staff)).await.unwrap();
    }

    let reopened = LocalStore::open(&path, MergePolicy::LastWriteWins).unwrap();
    let rows = reopened.list(EntityKind::Staff).unwrap();
    assert_eq!(rows.iter().map(name_of).collect::<Vec<_>>(), vec!["Grace", "Ada"]);
}

#[tokio::test]
async fn last_write_wins_keeps_newer_local_row() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path().join("store.db"), MergePolicy::LastWriteWins).unwrap();
    store.upsert(EntityKind::Staff, &[staff("s-1", "Ada (edited)", 50)]).unwrap();

    let remote = Arc::new(InMemoryRepository::new());
    remote.seed([staff("s-1", "Ada", 10)]);
    let engine = SyncEngine::new(remote, store);
    let rows = engine.resync(&FetchKey::all(EntityKind::Staff)).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(name_of(&rows[0]), "Ada (edited)");
}

#[tokio::test]
async fn overwrite_takes_remote_row_even_if_older() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path().join("store.db"), MergePolicy::Overwrite).unwrap();
    store.upsert(EntityKind::Staff, &[staff("s-1", "Ada (edited)", 50)]).unwrap();

    let remote = Arc::new(InMemoryRepository::new());
    remote.seed([staff("s-1", "Ada", 10)]);
    let engine = SyncEngine::new(remote, store);
    let rows = engine.resync(&FetchKey::all(EntityKind::Staff)).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(name_of(&rows[0]), "Ada");
}

#[tokio::test]
async fn remote_soft_delete_hides_row_locally() {
    let remote = Arc::new(InMemoryRepository::new());
    remote.seed([staff("s-1", "Ada", 10), staff("s-2", "Grace", 10)]);
    let store = LocalStore::open_in_memory(MergePolicy::LastWriteWins).unwrap();
    let engine = SyncEngine::new(Arc::clone(&remote), store);
    let key = FetchKey::all(EntityKind::Staff);
    assert_eq!(engine.resync(&key).await.unwrap().len(), 2);

    let mut deleted = staff("s-2", "Grace", 30);
    deleted.mark_deleted("u-1", at(30));
    remote.upsert_remote(deleted);

    let rows = engine.resync(&key).await.unwrap();
    assert_eq!(rows.iter().map(name_of).collect::<Vec<_>>(), vec!["Ada"]);
    assert_eq!(engine.store().list_all(EntityKind::Staff).unwrap().len(), 2);
}
