// Screen controller: owns one screen's collection and change listener.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use tracker_common::kind::FetchKey;
use tracker_common::types::Entity;

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::listener::{ChangeListener, ListenerState, SubscriptionScope};
use crate::observable::ObservableCollection;
use crate::remote::RemoteRepository;

pub struct ScreenController<R: RemoteRepository> {
    engine: Arc<SyncEngine<R>>,
    scope: SubscriptionScope,
    collection: ObservableCollection,
    listener: Mutex<Option<ChangeListener<R>>>,
}

impl<R: RemoteRepository> ScreenController<R> {
    pub fn new(engine: Arc<SyncEngine<R>>, key: FetchKey, screen: impl Into<String>) -> Self {
        Self {
            engine,
            scope: SubscriptionScope::new(key, screen),
            collection: ObservableCollection::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &FetchKey {
        &self.scope.key
    }

    pub fn collection(&self) -> &ObservableCollection {
        &self.collection
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.collection.snapshot()
    }

    /// State of the change listener, or `None` before `load_initial` and
    /// after `teardown`.
    pub fn listener_state(&self) -> Option<ListenerState> {
        self.listener().as_ref().map(ChangeListener::state)
    }

    /// Show the cached rows, start listening for changes, then refresh.
    pub async fn load_initial(&self) -> Result<(), SyncError> {
        match self.engine.cached(&self.scope.key) {
            Ok(rows) => {
                debug!(
                    key = %self.scope.key,
                    screen = %self.scope.screen,
                    cached = rows.len(),
                    "showing cached rows"
                );
                self.collection.reconcile(rows);
            }
            Err(error) => warn!(key = %self.scope.key, %error, "failed to read cached rows"),
        }

        {
            let mut listener = self.listener();
            if listener.is_none() {
                *listener = Some(ChangeListener::start(
                    Arc::clone(&self.engine),
                    self.scope.clone(),
                    self.collection.clone(),
                ));
            }
        }

        self.refresh().await
    }

    /// User-initiated resync. A failure keeps whatever is on screen and
    /// only sets the error slot when there is nothing cached to show.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        match self.engine.resync(&self.scope.key).await {
            Ok(rows) => {
                self.collection.clear_error();
                self.collection.reconcile(rows);
                Ok(())
            }
            Err(error) => {
                warn!(key = %self.scope.key, screen = %self.scope.screen, %error, "refresh failed");
                if self.collection.confirmed_len() == 0 {
                    self.collection.set_error(error.to_string());
                }
                Err(error)
            }
        }
    }

    /// Cancel the change listener. The remote subscription is released
    /// before this returns.
    pub fn teardown(&self) {
        let listener = self.listener().take();
        if let Some(listener) = listener {
            listener.cancel();
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<ChangeListener<R>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: RemoteRepository> Drop for ScreenController<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}
