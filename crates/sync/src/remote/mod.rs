// Remote data service boundary.
//
// `RemoteRepository` is the only way the sync layer talks to the backend.
// Two implementations ship: an HTTP client for the hosted service and an
// in-memory repository for offline runs and tests.

pub mod http;
pub mod memory;

use std::fmt::{self, Display, Formatter};

use tokio::sync::mpsc;
use tracker_common::change::ChangeEvent;
use tracker_common::kind::EntityKind;
use tracker_common::patch::Patch;
use tracker_common::types::Entity;
use uuid::Uuid;

use crate::error::RemoteError;

pub use http::HttpRepository;
pub use memory::{InMemoryRepository, RemoteOp};

/// Buffered events per change subscription.
pub const CHANGE_FEED_CAPACITY: usize = 64;

/// Identifies one change subscription on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(kind: EntityKind) -> Self {
        Self(format!("{}-changes-{}", kind.collection(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An acknowledged change subscription. Events stop when the channel is
/// unsubscribed or the remote drops it.
#[derive(Debug)]
pub struct ChangeFeed {
    pub channel: ChannelId,
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Abstraction over the backend data API.
///
/// All async methods return `Send` futures so callers can run them on
/// spawned tasks.
pub trait RemoteRepository: Send + Sync + 'static {
    /// Every entity of `kind`, soft-deleted rows included.
    fn fetch_all(
        &self,
        kind: EntityKind,
    ) -> impl std::future::Future<Output = Result<Vec<Entity>, RemoteError>> + Send;

    /// Entities of a listing-scoped `kind` belonging to one listing.
    fn fetch_scoped(
        &self,
        kind: EntityKind,
        listing_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Entity>, RemoteError>> + Send;

    /// Apply a field-level patch and return the server's view of the result.
    fn mutate(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Patch,
    ) -> impl std::future::Future<Output = Result<Entity, RemoteError>> + Send;

    /// Insert a new entity. The draft's id is ignored; the returned entity
    /// carries the server-assigned id.
    fn create(
        &self,
        kind: EntityKind,
        draft: &Entity,
    ) -> impl std::future::Future<Output = Result<Entity, RemoteError>> + Send;

    /// Open a change subscription for `kind`. Resolves once the remote has
    /// acknowledged it.
    fn subscribe_changes(
        &self,
        kind: EntityKind,
    ) -> impl std::future::Future<Output = Result<ChangeFeed, RemoteError>> + Send;

    /// Release a subscription. Synchronous so it can run from `Drop`.
    fn unsubscribe(&self, channel: &ChannelId);
}
