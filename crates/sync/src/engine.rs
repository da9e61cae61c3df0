// Sync engine: coalesced remote fetches persisted to the local store.
//
// Every path that pulls from the remote goes through `fetch`, so screens,
// change listeners and background runs all share one flight per key.

use std::sync::Arc;

use tracing::debug;
use tracker_common::kind::FetchKey;
use tracker_common::types::Entity;

use crate::coalesce::FetchCoalescer;
use crate::error::SyncError;
use crate::remote::RemoteRepository;
use crate::store::LocalStore;

pub struct SyncEngine<R: RemoteRepository> {
    remote: Arc<R>,
    store: LocalStore,
    coalescer: FetchCoalescer<FetchKey, Arc<Vec<Entity>>>,
}

impl<R: RemoteRepository> SyncEngine<R> {
    pub fn new(remote: Arc<R>, store: LocalStore) -> Self {
        Self { remote, store, coalescer: FetchCoalescer::new() }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn coalescer(&self) -> &FetchCoalescer<FetchKey, Arc<Vec<Entity>>> {
        &self.coalescer
    }

    /// Pull `key` from the remote and merge it into the store. Concurrent
    /// calls for the same key share one remote request and one upsert.
    pub async fn fetch(&self, key: &FetchKey) -> Result<Arc<Vec<Entity>>, SyncError> {
        let remote = Arc::clone(&self.remote);
        let store = self.store.clone();
        let flight_key = key.clone();

        self.coalescer
            .run(key.clone(), move || async move {
                let kind = flight_key.kind;
                let entities = match &flight_key.scope {
                    Some(listing_id) => remote.fetch_scoped(kind, listing_id).await?,
                    None => remote.fetch_all(kind).await?,
                };
                let outcome = store.upsert(kind, &entities).map_err(SyncError::store)?;
                debug!(
                    key = %flight_key,
                    fetched = entities.len(),
                    written = outcome.written,
                    skipped = outcome.skipped,
                    "fetch merged into store"
                );
                Ok(Arc::new(entities))
            })
            .await
    }

    /// Fetch `key`, then return the store's merged view of it.
    pub async fn resync(&self, key: &FetchKey) -> Result<Vec<Entity>, SyncError> {
        self.fetch(key).await?;
        self.cached(key)
    }

    /// The store's current view of `key`, without touching the remote.
    pub fn cached(&self, key: &FetchKey) -> Result<Vec<Entity>, SyncError> {
        self.store.list_scoped(key).map_err(SyncError::store)
    }
}
