// In-memory remote repository.
//
// Backs the `memory` backend for offline runs and doubles as the scripted
// remote in tests: failures can be queued per operation, latency injected,
// and calls counted per operation and kind. Writes broadcast a change event
// to subscribers of the written kind, as the hosted service does.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use tracker_common::change::{ChangeEvent, ChangeType};
use tracker_common::kind::EntityKind;
use tracker_common::patch::Patch;
use tracker_common::types::Entity;
use uuid::Uuid;

use super::{ChangeFeed, ChannelId, RemoteRepository, CHANGE_FEED_CAPACITY};
use crate::error::RemoteError;

/// Operations that can be counted or scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    FetchAll,
    FetchScoped,
    Mutate,
    Create,
    Subscribe,
}

struct ScriptedFailure {
    op: RemoteOp,
    kind: Option<EntityKind>,
    error: RemoteError,
}

#[derive(Default)]
struct State {
    collections: BTreeMap<EntityKind, BTreeMap<String, Entity>>,
    failures: Vec<ScriptedFailure>,
    calls: HashMap<(RemoteOp, EntityKind), usize>,
    subscribers: HashMap<ChannelId, (EntityKind, mpsc::Sender<ChangeEvent>)>,
    latency: Duration,
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, entities: impl IntoIterator<Item = Entity>) {
        let mut state = self.state();
        for entity in entities {
            state
                .collections
                .entry(entity.kind())
                .or_default()
                .insert(entity.id().to_string(), entity);
        }
    }

    /// Write directly to the remote side without notifying subscribers.
    pub fn upsert_remote(&self, entity: Entity) {
        self.seed([entity]);
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.state().collections.get(&kind).and_then(|rows| rows.get(id)).cloned()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.state().collections.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Delay applied to every async operation.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Fail the next call of `op`, whatever its kind.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.state().failures.push(ScriptedFailure { op, kind: None, error });
    }

    /// Fail the next call of `op` for `kind` only.
    pub fn fail_next_for(&self, op: RemoteOp, kind: EntityKind, error: RemoteError) {
        self.state().failures.push(ScriptedFailure { op, kind: Some(kind), error });
    }

    pub fn calls(&self, op: RemoteOp, kind: EntityKind) -> usize {
        self.state().calls.get(&(op, kind)).copied().unwrap_or(0)
    }

    pub fn total_calls(&self, op: RemoteOp) -> usize {
        self.state().calls.iter().filter(|((o, _), _)| *o == op).map(|(_, n)| n).sum()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Push `event` to every live subscriber of its kind. Returns how many
    /// subscribers received it.
    pub fn emit_change(&self, event: ChangeEvent) -> usize {
        let mut state = self.state();
        let mut delivered = 0;
        state.subscribers.retain(|channel, (kind, tx)| {
            if *kind != event.kind {
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(%channel, "change feed full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, take any scripted failure, then apply latency.
    async fn begin(&self, op: RemoteOp, kind: EntityKind) -> Result<(), RemoteError> {
        let (latency, failure) = {
            let mut state = self.state();
            *state.calls.entry((op, kind)).or_insert(0) += 1;
            let position = state
                .failures
                .iter()
                .position(|f| f.op == op && f.kind.map_or(true, |k| k == kind));
            let failure = position.map(|index| state.failures.remove(index).error);
            (state.latency, failure)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        failure.map_or(Ok(()), Err)
    }

    fn store_and_notify(&self, entity: Entity, change: ChangeType) {
        let event = ChangeEvent {
            kind: entity.kind(),
            change,
            entity_id: Some(entity.id().to_string()),
            listing_id: entity.listing_id().map(str::to_string),
        };
        self.upsert_remote(entity);
        self.emit_change(event);
    }
}

impl RemoteRepository for InMemoryRepository {
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<Entity>, RemoteError> {
        self.begin(RemoteOp::FetchAll, kind).await?;
        Ok(self
            .state()
            .collections
            .get(&kind)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_scoped(
        &self,
        kind: EntityKind,
        listing_id: &str,
    ) -> Result<Vec<Entity>, RemoteError> {
        self.begin(RemoteOp::FetchScoped, kind).await?;
        Ok(self
            .state()
            .collections
            .get(&kind)
            .map(|rows| {
                rows.values().filter(|e| e.listing_id() == Some(listing_id)).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn mutate(&self, kind: EntityKind, id: &str, patch: &Patch) -> Result<Entity, RemoteError> {
        self.begin(RemoteOp::Mutate, kind).await?;
        let current =
            self.get(kind, id).ok_or_else(|| RemoteError::NotFound { kind, id: id.to_string() })?;

        let mut updated = patch
            .apply_to(&current)
            .map_err(|e| RemoteError::Rejected { status: 422, message: e.to_string() })?;
        updated.set_updated_at(Utc::now().max(current.updated_at()));
        let change = if updated.is_deleted() && !current.is_deleted() {
            ChangeType::Delete
        } else {
            ChangeType::Update
        };
        self.store_and_notify(updated.clone(), change);
        Ok(updated)
    }

    async fn create(&self, kind: EntityKind, draft: &Entity) -> Result<Entity, RemoteError> {
        self.begin(RemoteOp::Create, kind).await?;
        if draft.kind() != kind {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!("expected a {kind} entity, got {}", draft.kind()),
            });
        }

        let mut created = draft.clone();
        created.set_id(Uuid::new_v4().to_string());
        created.set_updated_at(Utc::now());
        self.store_and_notify(created.clone(), ChangeType::Insert);
        Ok(created)
    }

    async fn subscribe_changes(&self, kind: EntityKind) -> Result<ChangeFeed, RemoteError> {
        self.begin(RemoteOp::Subscribe, kind).await?;
        let (tx, events) = mpsc::channel(CHANGE_FEED_CAPACITY);
        let channel = ChannelId::new(kind);
        self.state().subscribers.insert(channel.clone(), (kind, tx));
        debug!(%channel, "change subscription acknowledged");
        Ok(ChangeFeed { channel, events })
    }

    fn unsubscribe(&self, channel: &ChannelId) {
        if self.state().subscribers.remove(channel).is_some() {
            debug!(%channel, "change subscription released");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone};
    use tracker_common::types::Note;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("timestamp should be valid")
    }

    fn note(id: &str, listing_id: &str) -> Entity {
        let mut note = Note::provisional(listing_id, "content", "u-1", at(0));
        note.id = id.into();
        Entity::Note(note)
    }

    #[tokio::test]
    async fn fetches_return_seeded_rows() {
        let repo = InMemoryRepository::new();
        repo.seed([note("n-1", "L1"), note("n-2", "L2")]);

        assert_eq!(repo.fetch_all(EntityKind::Note).await.unwrap().len(), 2);
        let scoped = repo.fetch_scoped(EntityKind::Note, "L2").await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id(), "n-2");
        assert!(repo.fetch_all(EntityKind::Task).await.unwrap().is_empty());

        assert_eq!(repo.calls(RemoteOp::FetchAll, EntityKind::Note), 1);
        assert_eq!(repo.total_calls(RemoteOp::FetchAll), 2);
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let repo = InMemoryRepository::new();
        repo.fail_next(RemoteOp::FetchAll, RemoteError::Unavailable("offline".into()));

        let error = repo.fetch_all(EntityKind::Task).await.unwrap_err();
        assert_eq!(error, RemoteError::Unavailable("offline".into()));
        assert!(repo.fetch_all(EntityKind::Task).await.is_ok());
    }

    #[tokio::test]
    async fn kind_scoped_failure_skips_other_kinds() {
        let repo = InMemoryRepository::new();
        repo.fail_next_for(
            RemoteOp::FetchAll,
            EntityKind::Staff,
            RemoteError::Unavailable("offline".into()),
        );

        assert!(repo.fetch_all(EntityKind::Task).await.is_ok());
        assert!(repo.fetch_all(EntityKind::Staff).await.is_err());
        assert!(repo.fetch_all(EntityKind::Staff).await.is_ok());
    }

    #[tokio::test]
    async fn create_assigns_server_id() {
        let repo = InMemoryRepository::new();
        let draft = Entity::Note(Note::provisional("L1", "Hello", "u-1", at(0)));

        let created = repo.create(EntityKind::Note, &draft).await.unwrap();
        assert!(!created.is_provisional());
        assert_ne!(created.id(), draft.id());
        assert_eq!(repo.get(EntityKind::Note, created.id()), Some(created));
    }

    #[tokio::test]
    async fn mutate_missing_entity_is_not_found() {
        let repo = InMemoryRepository::new();
        let error = repo
            .mutate(EntityKind::Task, "t-404", &Patch::new().set("priority", 2))
            .await
            .unwrap_err();
        assert_eq!(error, RemoteError::NotFound { kind: EntityKind::Task, id: "t-404".into() });
    }

    #[tokio::test]
    async fn writes_notify_subscribers_until_unsubscribed() {
        let repo = InMemoryRepository::new();
        let mut feed = repo.subscribe_changes(EntityKind::Note).await.unwrap();
        assert_eq!(repo.active_subscriptions(), 1);

        let draft = Entity::Note(Note::provisional("L1", "Hello", "u-1", at(0)));
        let created = repo.create(EntityKind::Note, &draft).await.unwrap();
        let event = feed.events.recv().await.unwrap();
        assert_eq!(event.change, ChangeType::Insert);
        assert_eq!(event.entity_id.as_deref(), Some(created.id()));
        assert_eq!(event.listing_id.as_deref(), Some("L1"));

        assert_eq!(repo.emit_change(ChangeEvent::collection_changed(EntityKind::Task)), 0);

        repo.unsubscribe(&feed.channel);
        assert_eq!(repo.active_subscriptions(), 0);
        assert_eq!(repo.emit_change(ChangeEvent::collection_changed(EntityKind::Note)), 0);
        assert!(feed.events.recv().await.is_none());
    }
}
