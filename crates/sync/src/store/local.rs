// Local entity store.
//
// One row per (kind, id) holding the latest known snapshot as JSON. Every
// upsert batch runs in a single transaction, so a cancelled or failed batch
// leaves the collection untouched. The connection sits behind a std mutex
// that is only held for the duration of a synchronous SQLite call.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tracker_common::kind::{EntityKind, FetchKey};
use tracker_common::types::Entity;

use super::migrations;

/// How an incoming snapshot is merged with the stored one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Skip snapshots whose `updated_at` is older than the stored row.
    #[default]
    LastWriteWins,
    /// Always replace the stored row.
    Overwrite,
}

/// Rows written and rows skipped by the merge policy in one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub written: usize,
    pub skipped: usize,
}

const UPSERT_LAST_WRITE_WINS_SQL: &str = "\
    INSERT INTO entities (kind, id, scope_id, updated_at_ms, deleted_at, payload) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
    ON CONFLICT(kind, id) DO UPDATE SET \
        scope_id = excluded.scope_id, \
        updated_at_ms = excluded.updated_at_ms, \
        deleted_at = excluded.deleted_at, \
        payload = excluded.payload \
    WHERE excluded.updated_at_ms >= entities.updated_at_ms";

const UPSERT_OVERWRITE_SQL: &str = "\
    INSERT INTO entities (kind, id, scope_id, updated_at_ms, deleted_at, payload) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
    ON CONFLICT(kind, id) DO UPDATE SET \
        scope_id = excluded.scope_id, \
        updated_at_ms = excluded.updated_at_ms, \
        deleted_at = excluded.deleted_at, \
        payload = excluded.payload";

#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    policy: MergePolicy,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>, policy: MergePolicy) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create local store directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open local store at `{}`", path.display()))?;
        Self::from_connection(conn, policy)
    }

    pub fn open_in_memory(policy: MergePolicy) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        Self::from_connection(conn, policy)
    }

    fn from_connection(mut conn: Connection, policy: MergePolicy) -> Result<Self> {
        migrations::prepare(&mut conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), policy })
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn schema_version(&self) -> Result<i64> {
        migrations::current_schema_version(&self.lock())
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        let conn = self.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.collection(), id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {kind} entity `{id}`"))?;

        payload.map(|payload| decode_payload(kind, &payload)).transpose()
    }

    /// Live (not soft-deleted) entities of `kind`, newest first.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        self.query_entities(
            kind,
            "SELECT payload FROM entities WHERE kind = ?1 AND deleted_at IS NULL \
             ORDER BY updated_at_ms DESC, id ASC",
            params![kind.collection()],
        )
    }

    /// Every stored snapshot of `kind`, soft-deleted rows included.
    pub fn list_all(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        self.query_entities(
            kind,
            "SELECT payload FROM entities WHERE kind = ?1 ORDER BY updated_at_ms DESC, id ASC",
            params![kind.collection()],
        )
    }

    /// Live entities visible through `key`.
    pub fn list_scoped(&self, key: &FetchKey) -> Result<Vec<Entity>> {
        match &key.scope {
            None => self.list(key.kind),
            Some(scope) => self.query_entities(
                key.kind,
                "SELECT payload FROM entities \
                 WHERE kind = ?1 AND scope_id = ?2 AND deleted_at IS NULL \
                 ORDER BY updated_at_ms DESC, id ASC",
                params![key.kind.collection(), scope],
            ),
        }
    }

    /// Write a batch of snapshots in one transaction under the store's
    /// merge policy. Any invalid entity aborts the whole batch.
    pub fn upsert(&self, kind: EntityKind, entities: &[Entity]) -> Result<UpsertOutcome> {
        let sql = match self.policy {
            MergePolicy::LastWriteWins => UPSERT_LAST_WRITE_WINS_SQL,
            MergePolicy::Overwrite => UPSERT_OVERWRITE_SQL,
        };

        let mut conn = self.lock();
        let tx = conn.transaction().context("failed to start upsert transaction")?;
        let mut outcome = UpsertOutcome::default();
        {
            let mut stmt = tx.prepare_cached(sql).context("failed to prepare upsert")?;
            for entity in entities {
                if entity.kind() != kind {
                    bail!("cannot upsert {} entity `{}` into {kind}", entity.kind(), entity.id());
                }
                if entity.is_provisional() {
                    bail!("refusing to persist provisional {kind} entity `{}`", entity.id());
                }

                let payload = serde_json::to_string(entity)
                    .with_context(|| format!("failed to encode {kind} entity `{}`", entity.id()))?;
                let changed = stmt
                    .execute(params![
                        kind.collection(),
                        entity.id(),
                        entity.listing_id(),
                        entity.updated_at().timestamp_millis(),
                        entity.deleted_at().map(|at| at.to_rfc3339()),
                        payload,
                    ])
                    .with_context(|| format!("failed to upsert {kind} entity `{}`", entity.id()))?;

                if changed == 0 {
                    outcome.skipped += 1;
                } else {
                    outcome.written += 1;
                }
            }
        }
        tx.commit().with_context(|| format!("failed to commit {kind} upsert batch"))?;

        debug!(%kind, written = outcome.written, skipped = outcome.skipped, "upserted batch");
        Ok(outcome)
    }

    /// Soft delete: stamp the deletion markers, keep the row. The read and
    /// the write share one transaction, so a concurrent upsert is either
    /// fully before or fully after the delete.
    pub fn delete(&self, kind: EntityKind, id: &str, deleted_by: &str) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("failed to start delete transaction")?;
        let payload: Option<String> = tx
            .query_row(
                "SELECT payload FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.collection(), id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {kind} entity `{id}`"))?;
        let Some(payload) = payload else {
            return Ok(false);
        };
        let mut entity = decode_payload(kind, &payload)?;
        if entity.is_deleted() {
            return Ok(false);
        }

        entity.mark_deleted(deleted_by, Utc::now());
        let payload = serde_json::to_string(&entity)
            .with_context(|| format!("failed to encode {kind} entity `{id}`"))?;
        let rows = tx
            .execute(
                "UPDATE entities SET updated_at_ms = ?1, deleted_at = ?2, payload = ?3 \
                 WHERE kind = ?4 AND id = ?5",
                params![
                    entity.updated_at().timestamp_millis(),
                    entity.deleted_at().map(|at| at.to_rfc3339()),
                    payload,
                    kind.collection(),
                    id,
                ],
            )
            .with_context(|| format!("failed to soft delete {kind} entity `{id}`"))?;
        tx.commit().with_context(|| format!("failed to commit {kind} delete of `{id}`"))?;
        Ok(rows > 0)
    }

    /// Physically remove a row. Only for explicit purges.
    pub fn purge(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let rows = self
            .lock()
            .execute(
                "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.collection(), id],
            )
            .with_context(|| format!("failed to purge {kind} entity `{id}`"))?;
        Ok(rows > 0)
    }

    pub fn record_synced(&self, kind: EntityKind, at: DateTime<Utc>) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO sync_state (kind, last_synced_at) VALUES (?1, ?2) \
                 ON CONFLICT(kind) DO UPDATE SET last_synced_at = excluded.last_synced_at",
                params![kind.collection(), at.to_rfc3339()],
            )
            .with_context(|| format!("failed to record sync time for {kind}"))?;
        Ok(())
    }

    pub fn last_synced_at(&self, kind: EntityKind) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT last_synced_at FROM sync_state WHERE kind = ?1",
                params![kind.collection()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read sync time for {kind}"))?;

        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .with_context(|| format!("invalid sync time `{raw}` for {kind}"))
        })
        .transpose()
    }

    fn query_entities(
        &self,
        kind: EntityKind,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Entity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(sql).context("failed to prepare entity query")?;
        let payloads = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .with_context(|| format!("failed to query {kind}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("failed to collect {kind}"))?;
        drop(stmt);
        drop(conn);

        payloads.iter().map(|payload| decode_payload(kind, payload)).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode_payload(kind: EntityKind, payload: &str) -> Result<Entity> {
    let entity: Entity = serde_json::from_str(payload)
        .with_context(|| format!("failed to decode stored {kind} payload"))?;
    if entity.kind() != kind {
        return Err(anyhow!("stored {kind} row holds a {} entity", entity.kind()));
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use tracker_common::types::{AccountStatus, Note, Staff, StaffRole};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("timestamp should be valid")
    }

    fn note(id: &str, listing_id: &str, content: &str, updated: i64) -> Entity {
        Entity::Note(Note {
            id: id.into(),
            listing_id: listing_id.into(),
            content: content.into(),
            note_type: "general".into(),
            created_by: Some("u-1".into()),
            created_at: at(0),
            updated_at: at(updated),
            deleted_at: None,
            deleted_by: None,
        })
    }

    fn staff(id: &str) -> Entity {
        Entity::Staff(Staff {
            id: id.into(),
            name: "Jane Doe".into(),
            email: "jane@example.com".into(),
            role: StaffRole::Operations,
            status: AccountStatus::Active,
            created_at: at(0),
            updated_at: at(0),
            deleted_at: None,
            deleted_by: None,
        })
    }

    fn store(policy: MergePolicy) -> LocalStore {
        LocalStore::open_in_memory(policy).expect("in-memory store should open")
    }

    #[test]
    fn upsert_then_get_and_list() {
        let store = store(MergePolicy::LastWriteWins);
        let outcome = store
            .upsert(EntityKind::Note, &[note("n-1", "L1", "a", 1), note("n-2", "L2", "b", 2)])
            .unwrap();
        assert_eq!(outcome, UpsertOutcome { written: 2, skipped: 0 });

        assert_eq!(store.get(EntityKind::Note, "n-1").unwrap(), Some(note("n-1", "L1", "a", 1)));
        assert!(store.get(EntityKind::Note, "missing").unwrap().is_none());

        let ids: Vec<_> =
            store.list(EntityKind::Note).unwrap().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["n-2", "n-1"]);
    }

    #[test]
    fn upserting_same_snapshot_twice_is_idempotent() {
        let store = store(MergePolicy::LastWriteWins);
        let batch = [note("n-1", "L1", "a", 1)];
        store.upsert(EntityKind::Note, &batch).unwrap();
        let first = store.list_all(EntityKind::Note).unwrap();

        store.upsert(EntityKind::Note, &batch).unwrap();
        assert_eq!(store.list_all(EntityKind::Note).unwrap(), first);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn last_write_wins_skips_older_snapshot() {
        let store = store(MergePolicy::LastWriteWins);
        store.upsert(EntityKind::Note, &[note("n-1", "L1", "fresh", 10)]).unwrap();

        let outcome = store.upsert(EntityKind::Note, &[note("n-1", "L1", "stale", 5)]).unwrap();
        assert_eq!(outcome, UpsertOutcome { written: 0, skipped: 1 });
        assert_eq!(store.get(EntityKind::Note, "n-1").unwrap(), Some(note("n-1", "L1", "fresh", 10)));

        let outcome = store.upsert(EntityKind::Note, &[note("n-1", "L1", "newer", 11)]).unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(store.get(EntityKind::Note, "n-1").unwrap(), Some(note("n-1", "L1", "newer", 11)));
    }

    #[test]
    fn overwrite_policy_replaces_unconditionally() {
        let store = store(MergePolicy::Overwrite);
        store.upsert(EntityKind::Note, &[note("n-1", "L1", "fresh", 10)]).unwrap();

        let outcome = store.upsert(EntityKind::Note, &[note("n-1", "L1", "stale", 5)]).unwrap();
        assert_eq!(outcome, UpsertOutcome { written: 1, skipped: 0 });
        assert_eq!(store.get(EntityKind::Note, "n-1").unwrap(), Some(note("n-1", "L1", "stale", 5)));
    }

    #[test]
    fn invalid_entity_rolls_back_whole_batch() {
        let store = store(MergePolicy::LastWriteWins);
        let error = store
            .upsert(EntityKind::Note, &[note("n-1", "L1", "a", 1), staff("s-1")])
            .unwrap_err();
        assert!(error.to_string().contains("cannot upsert staff entity `s-1` into notes"));
        assert!(store.list_all(EntityKind::Note).unwrap().is_empty());
    }

    #[test]
    fn provisional_ids_are_never_persisted() {
        let store = store(MergePolicy::LastWriteWins);
        let provisional = Entity::Note(Note::provisional("L1", "Hello", "u-1", at(0)));
        let error = store.upsert(EntityKind::Note, &[provisional]).unwrap_err();
        assert!(error.to_string().contains("provisional"));
        assert!(store.list_all(EntityKind::Note).unwrap().is_empty());
    }

    #[test]
    fn list_scoped_filters_by_listing() {
        let store = store(MergePolicy::LastWriteWins);
        store
            .upsert(
                EntityKind::Note,
                &[note("n-1", "L1", "a", 1), note("n-2", "L2", "b", 2), note("n-3", "L1", "c", 3)],
            )
            .unwrap();

        let scoped = store.list_scoped(&FetchKey::scoped(EntityKind::Note, "L1")).unwrap();
        let ids: Vec<_> = scoped.iter().map(Entity::id).collect();
        assert_eq!(ids, vec!["n-3", "n-1"]);
        assert_eq!(store.list_scoped(&FetchKey::all(EntityKind::Note)).unwrap().len(), 3);
    }

    #[test]
    fn soft_delete_hides_row_but_keeps_snapshot() {
        let store = store(MergePolicy::LastWriteWins);
        store.upsert(EntityKind::Staff, &[staff("s-1")]).unwrap();

        assert!(store.delete(EntityKind::Staff, "s-1", "u-admin").unwrap());
        assert!(!store.delete(EntityKind::Staff, "s-1", "u-admin").unwrap());
        assert!(!store.delete(EntityKind::Staff, "missing", "u-admin").unwrap());

        assert!(store.list(EntityKind::Staff).unwrap().is_empty());
        let kept = store.get(EntityKind::Staff, "s-1").unwrap().expect("row should remain");
        assert!(kept.is_deleted());
        assert_eq!(kept.deleted_by(), Some("u-admin"));
    }

    #[test]
    fn stale_snapshot_cannot_resurrect_soft_deleted_row() {
        let store = store(MergePolicy::LastWriteWins);
        store.upsert(EntityKind::Staff, &[staff("s-1")]).unwrap();
        store.delete(EntityKind::Staff, "s-1", "u-admin").unwrap();

        let outcome = store.upsert(EntityKind::Staff, &[staff("s-1")]).unwrap();
        assert_eq!(outcome.skipped, 1);
        assert!(store.list(EntityKind::Staff).unwrap().is_empty());
    }

    #[test]
    fn purge_removes_row_physically() {
        let store = store(MergePolicy::LastWriteWins);
        store.upsert(EntityKind::Staff, &[staff("s-1")]).unwrap();
        assert!(store.purge(EntityKind::Staff, "s-1").unwrap());
        assert!(store.get(EntityKind::Staff, "s-1").unwrap().is_none());
        assert!(!store.purge(EntityKind::Staff, "s-1").unwrap());
    }

    #[test]
    fn sync_state_roundtrip() {
        let store = store(MergePolicy::LastWriteWins);
        assert!(store.last_synced_at(EntityKind::Task).unwrap().is_none());

        store.record_synced(EntityKind::Task, at(10)).unwrap();
        store.record_synced(EntityKind::Task, at(10) + Duration::seconds(5)).unwrap();
        assert_eq!(store.last_synced_at(EntityKind::Task).unwrap(), Some(at(15)));
    }

    #[test]
    fn concurrent_writers_share_one_store() {
        let store = store(MergePolicy::LastWriteWins);
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("n-{worker}-{i}");
                        store.upsert(EntityKind::Note, &[note(&id, "L1", "x", i)]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread should finish");
        }

        assert_eq!(store.list(EntityKind::Note).unwrap().len(), 100);
    }

    #[test]
    fn delete_racing_upsert_never_restores_stale_content() {
        for round in 0..200 {
            let store = store(MergePolicy::LastWriteWins);
            let id = format!("n-{round}");
            store.upsert(EntityKind::Note, &[note(&id, "L1", "old", 1)]).unwrap();

            let writer = {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    store.upsert(EntityKind::Note, &[note(&id, "L1", "new", 2)]).unwrap()
                })
            };
            assert!(store.delete(EntityKind::Note, &id, "u-9").unwrap());
            let outcome = writer.join().expect("writer thread should finish");

            let Some(Entity::Note(stored)) = store.get(EntityKind::Note, &id).unwrap() else {
                panic!("note `{id}` missing");
            };
            assert!(stored.deleted_at.is_some());
            if outcome.written == 1 {
                assert_eq!(stored.content, "new", "round {round} lost a committed upsert");
            }
        }
    }
}
