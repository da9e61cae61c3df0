// Optimistic mutations.
//
// A submit shows its result in the collection before the remote call starts.
// The remote outcome then either confirms the row (promote by temporary id,
// persist the server entity) or rolls it back and sets the collection's
// error slot. There is no retry.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracker_common::auth::{AuthProvider, UserId};
use tracker_common::kind::EntityKind;
use tracker_common::patch::Patch;
use tracker_common::types::{Entity, Note};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::observable::ObservableCollection;
use crate::remote::RemoteRepository;

/// User input for a new entity, scoped to one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopedInput {
    Note { listing_id: String, content: String },
}

impl ScopedInput {
    fn kind(&self) -> EntityKind {
        match self {
            Self::Note { .. } => EntityKind::Note,
        }
    }

    fn into_provisional(self, author: &UserId) -> Entity {
        let now = Utc::now();
        match self {
            Self::Note { listing_id, content } => {
                Entity::Note(Note::provisional(listing_id, content, author.as_str(), now))
            }
        }
    }
}

pub type Submission = JoinHandle<Result<Entity, SyncError>>;

pub struct OptimisticMutations<R: RemoteRepository> {
    engine: Arc<SyncEngine<R>>,
    auth: Arc<dyn AuthProvider>,
}

impl<R: RemoteRepository> Clone for OptimisticMutations<R> {
    fn clone(&self) -> Self {
        Self { engine: Arc::clone(&self.engine), auth: Arc::clone(&self.auth) }
    }
}

impl<R: RemoteRepository> OptimisticMutations<R> {
    pub fn new(engine: Arc<SyncEngine<R>>, auth: Arc<dyn AuthProvider>) -> Self {
        Self { engine, auth }
    }

    /// Insert a provisional row for `input` and create it remotely in the
    /// background. Fails up front, with nothing inserted, if no user is
    /// signed in.
    pub fn submit(
        &self,
        input: ScopedInput,
        collection: &ObservableCollection,
    ) -> Result<Submission, SyncError> {
        let author = self.acting_user(collection)?;
        let kind = input.kind();
        let draft = input.into_provisional(&author);
        let temp_id = draft.id().to_string();

        collection.insert_provisional(draft.clone());
        debug!(%kind, %temp_id, "provisional row inserted");

        let remote = Arc::clone(self.engine.remote());
        let store = self.engine.store().clone();
        let collection = collection.clone();
        Ok(tokio::spawn(async move {
            match remote.create(kind, &draft).await {
                Ok(confirmed) => {
                    // The row is already confirmed remotely; a store failure
                    // only delays it until the next resync.
                    if let Err(error) = store.upsert(kind, std::slice::from_ref(&confirmed)) {
                        let error = format!("{error:#}");
                        warn!(%kind, %temp_id, %error, "failed to persist confirmed row");
                    }
                    if !collection.promote(&temp_id, confirmed.clone()) {
                        debug!(%kind, %temp_id, "provisional row gone before confirmation");
                    }
                    info!(%kind, %temp_id, id = %confirmed.id(), "optimistic create confirmed");
                    Ok(confirmed)
                }
                Err(error) => {
                    collection.retract(&temp_id);
                    collection.set_error(format!("Could not save {}: {error}", kind_label(kind)));
                    warn!(%kind, %temp_id, %error, "optimistic create rolled back");
                    Err(SyncError::from(error))
                }
            }
        }))
    }

    pub fn submit_note(
        &self,
        listing_id: impl Into<String>,
        content: impl Into<String>,
        collection: &ObservableCollection,
    ) -> Result<Submission, SyncError> {
        let input = ScopedInput::Note { listing_id: listing_id.into(), content: content.into() };
        self.submit(input, collection)
    }

    /// Apply `patch` to the visible row `id` right away and send it to the
    /// remote. On failure the previous row is restored.
    pub fn submit_patch(
        &self,
        kind: EntityKind,
        id: &str,
        patch: Patch,
        collection: &ObservableCollection,
    ) -> Result<Submission, SyncError> {
        self.acting_user(collection)?;

        let previous = collection.get(id);
        if let Some(current) = &previous {
            match patch.apply_to(current) {
                Ok(patched) => {
                    collection.replace_entity(patched);
                }
                Err(error) => debug!(%kind, %id, %error, "patch not previewable locally"),
            }
        }

        let remote = Arc::clone(self.engine.remote());
        let store = self.engine.store().clone();
        let collection = collection.clone();
        let id = id.to_string();
        Ok(tokio::spawn(async move {
            match remote.mutate(kind, &id, &patch).await {
                Ok(confirmed) => {
                    if let Err(error) = store.upsert(kind, std::slice::from_ref(&confirmed)) {
                        let error = format!("{error:#}");
                        warn!(%kind, %id, %error, "failed to persist patched row");
                    }
                    collection.replace_entity(confirmed.clone());
                    info!(%kind, %id, "optimistic update confirmed");
                    Ok(confirmed)
                }
                Err(error) => {
                    if let Some(previous) = previous {
                        collection.replace_entity(previous);
                    }
                    collection.set_error(format!("Could not update {}: {error}", kind_label(kind)));
                    warn!(%kind, %id, %error, "optimistic update rolled back");
                    Err(SyncError::from(error))
                }
            }
        }))
    }

    fn acting_user(&self, collection: &ObservableCollection) -> Result<UserId, SyncError> {
        self.auth.current_user_id().map_err(|error| {
            collection.set_error(error.to_string());
            warn!(%error, "mutation refused without a signed-in user");
            SyncError::from(error)
        })
    }
}

fn kind_label(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => "task",
        EntityKind::Activity => "activity",
        EntityKind::Listing => "listing",
        EntityKind::Note => "note",
        EntityKind::Staff => "staff member",
        EntityKind::Realtor => "realtor",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use tracker_common::auth::{AuthError, StaticAuth};
    use tracker_common::types::{Task, TaskCategory, TaskStatus};

    use super::*;
    use crate::error::RemoteError;
    use crate::remote::{InMemoryRepository, RemoteOp};
    use crate::store::{LocalStore, MergePolicy};

    fn setup(
        auth: StaticAuth,
    ) -> (
        Arc<InMemoryRepository>,
        Arc<SyncEngine<InMemoryRepository>>,
        OptimisticMutations<InMemoryRepository>,
    ) {
        let remote = Arc::new(InMemoryRepository::new());
        let store = LocalStore::open_in_memory(MergePolicy::LastWriteWins).unwrap();
        let engine = Arc::new(SyncEngine::new(Arc::clone(&remote), store));
        let mutations = OptimisticMutations::new(Arc::clone(&engine), Arc::new(auth));
        (remote, engine, mutations)
    }

    fn signed_in() -> StaticAuth {
        StaticAuth::signed_in(UserId::new("u-1").unwrap())
    }

    fn open_task(id: &str) -> Entity {
        let at = Utc.timestamp_opt(1_000, 0).single().unwrap();
        Entity::Task(Task {
            id: id.into(),
            listing_id: Some("L1".into()),
            name: "Order photos".into(),
            category: TaskCategory::Photo,
            status: TaskStatus::Open,
            priority: 3,
            assignee_id: None,
            due_date: None,
            claimed_at: None,
            completed_at: None,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            deleted_by: None,
        })
    }

    #[tokio::test]
    async fn note_appears_before_remote_call_and_is_promoted() {
        let (remote, engine, mutations) = setup(signed_in());
        remote.set_latency(Duration::from_millis(20));
        let notes = ObservableCollection::new();

        let handle = mutations.submit_note("L1", "Hello", &notes).unwrap();
        let visible = notes.snapshot();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].is_provisional());

        let confirmed = handle.await.unwrap().unwrap();
        assert!(!confirmed.is_provisional());
        assert_eq!(notes.snapshot(), vec![confirmed.clone()]);
        assert_eq!(engine.store().get(EntityKind::Note, confirmed.id()).unwrap(), Some(confirmed));
        assert_eq!(remote.total_calls(RemoteOp::Create), 1);
    }

    #[tokio::test]
    async fn failed_create_rolls_back_and_sets_error() {
        let (remote, engine, mutations) = setup(signed_in());
        remote.fail_next(RemoteOp::Create, RemoteError::Unavailable("offline".into()));
        let notes = ObservableCollection::new();

        let submission = mutations.submit_note("L1", "Hello", &notes).unwrap();
        let error = submission.await.unwrap().unwrap_err();
        assert_eq!(error, SyncError::Remote(RemoteError::Unavailable("offline".into())));
        assert!(notes.is_empty());
        assert_eq!(
            notes.error_message().as_deref(),
            Some("Could not save note: remote service unavailable: offline")
        );
        assert!(engine.store().list(EntityKind::Note).unwrap().is_empty());
    }

    #[tokio::test]
    async fn signed_out_submit_inserts_nothing() {
        let (remote, _engine, mutations) = setup(StaticAuth::signed_out());
        let notes = ObservableCollection::new();

        let error = mutations.submit_note("L1", "Hello", &notes).unwrap_err();
        assert_eq!(error, SyncError::Auth(AuthError::NotAuthenticated));
        assert!(notes.is_empty());
        assert_eq!(notes.error_message().as_deref(), Some("no signed-in user"));
        assert_eq!(remote.total_calls(RemoteOp::Create), 0);
    }

    #[tokio::test]
    async fn retracted_row_is_not_resurrected_by_confirmation() {
        let (remote, _engine, mutations) = setup(signed_in());
        remote.set_latency(Duration::from_millis(20));
        let notes = ObservableCollection::new();

        let handle = mutations.submit_note("L1", "Hello", &notes).unwrap();
        notes.replace_all(Vec::new());

        assert!(handle.await.unwrap().is_ok());
        assert!(notes.is_empty());
    }

    #[tokio::test]
    async fn claim_patch_is_visible_then_confirmed() {
        let (remote, _engine, mutations) = setup(signed_in());
        remote.seed([open_task("t-1")]);
        remote.set_latency(Duration::from_millis(20));
        let tasks = ObservableCollection::new();
        tasks.reconcile(vec![open_task("t-1")]);

        let user = UserId::new("u-1").unwrap();
        let handle = mutations
            .submit_patch(EntityKind::Task, "t-1", Patch::claim_task(&user, Utc::now()), &tasks)
            .unwrap();
        let Some(Entity::Task(preview)) = tasks.get("t-1") else { panic!("task missing") };
        assert_eq!(preview.status, TaskStatus::Claimed);

        let Entity::Task(confirmed) = handle.await.unwrap().unwrap() else { panic!("not a task") };
        assert_eq!(confirmed.assignee_id.as_deref(), Some("u-1"));
        assert_eq!(tasks.get("t-1"), Some(Entity::Task(confirmed)));
    }

    #[tokio::test]
    async fn failed_patch_restores_previous_row() {
        let (remote, _engine, mutations) = setup(signed_in());
        let tasks = ObservableCollection::new();
        tasks.reconcile(vec![open_task("t-1")]);

        // Remote has never seen t-1.
        let error = mutations
            .submit_patch(EntityKind::Task, "t-1", Patch::complete_task(Utc::now()), &tasks)
            .unwrap()
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(error, SyncError::Remote(RemoteError::NotFound { .. })));
        assert_eq!(tasks.get("t-1"), Some(open_task("t-1")));
        assert!(tasks.error_message().unwrap().starts_with("Could not update task"));
        assert_eq!(remote.total_calls(RemoteOp::Mutate), 1);
    }
}
