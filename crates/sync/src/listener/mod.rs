// Change-stream listener.
//
// One listener per (fetch key, screen). It opens a change subscription on
// the remote, and for every event that touches its key runs a coalesced
// resync and publishes the store's view to the screen's collection. Event
// payloads are never applied directly.
//
// State: Idle → Connecting → Subscribed → Receiving* → Cancelled, or Failed
// when the subscribe call itself fails. Cancellation is silent and terminal
// and releases the remote subscription synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracker_common::kind::FetchKey;

use crate::engine::SyncEngine;
use crate::observable::ObservableCollection;
use crate::remote::{ChannelId, RemoteRepository};

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, task not yet running.
    Idle,
    /// Waiting for the remote to acknowledge the subscription.
    Connecting,
    /// Acknowledged; no event handled yet.
    Subscribed,
    /// Handling events; `events` counts those that touched the key.
    Receiving { events: u64 },
    Cancelled,
    Failed { reason: String },
}

impl ListenerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed { .. })
    }
}

/// The data a screen watches, tagged with the screen that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionScope {
    pub key: FetchKey,
    pub screen: String,
}

impl SubscriptionScope {
    pub fn new(key: FetchKey, screen: impl Into<String>) -> Self {
        Self { key, screen: screen.into() }
    }
}

// ── Listener ────────────────────────────────────────────────────────

struct Shared<R: RemoteRepository> {
    engine: Arc<SyncEngine<R>>,
    scope: SubscriptionScope,
    state_tx: watch::Sender<ListenerState>,
    channel: Mutex<Option<ChannelId>>,
    cancelled: AtomicBool,
}

impl<R: RemoteRepository> Shared<R> {
    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn channel(&self) -> MutexGuard<'_, Option<ChannelId>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the acknowledged channel. Returns false if the listener was
    /// cancelled while subscribing; the caller then releases it.
    fn register(&self, channel: ChannelId) -> bool {
        let mut slot = self.channel();
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(channel);
        true
    }

    fn release(&self) {
        let channel = self.channel().take();
        if let Some(channel) = channel {
            self.engine.remote().unsubscribe(&channel);
            debug!(%channel, screen = %self.scope.screen, "change subscription released");
        }
    }
}

/// Handle for one change subscription. Dropping it cancels the listener.
pub struct ChangeListener<R: RemoteRepository> {
    _task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    shared: Arc<Shared<R>>,
}

impl<R: RemoteRepository> ChangeListener<R> {
    /// Spawn the listener. Must be called inside a tokio runtime.
    pub fn start(
        engine: Arc<SyncEngine<R>>,
        scope: SubscriptionScope,
        collection: ObservableCollection,
    ) -> Self {
        let (state_tx, _) = watch::channel(ListenerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            engine,
            scope,
            state_tx,
            channel: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });

        let task = tokio::spawn(listen(Arc::clone(&shared), collection, shutdown_rx));
        Self { _task: task, shutdown_tx, shared }
    }

    pub fn scope(&self) -> &SubscriptionScope {
        &self.shared.scope
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state_tx.subscribe()
    }

    /// The acknowledged remote channel, while subscribed.
    pub fn channel(&self) -> Option<ChannelId> {
        self.shared.channel().clone()
    }

    /// Stop listening. The remote unsubscribe request is issued before this
    /// returns. Idempotent.
    pub fn cancel(&self) {
        let channel = {
            let mut slot = self.shared.channel();
            self.shared.cancelled.store(true, Ordering::SeqCst);
            slot.take()
        };
        if let Some(channel) = channel {
            self.shared.engine.remote().unsubscribe(&channel);
            info!(%channel, screen = %self.shared.scope.screen, "change listener cancelled");
        }
        self.shutdown_tx.send_replace(true);
        self.shared.set_state(ListenerState::Cancelled);
    }
}

impl<R: RemoteRepository> Drop for ChangeListener<R> {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn listen<R: RemoteRepository>(
    shared: Arc<Shared<R>>,
    collection: ObservableCollection,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let key = shared.scope.key.clone();
    let screen = shared.scope.screen.clone();
    shared.set_state(ListenerState::Connecting);

    let subscribed = tokio::select! {
        result = shared.engine.remote().subscribe_changes(key.kind) => result,
        _ = shutdown_rx.changed() => return,
    };
    let mut feed = match subscribed {
        Ok(feed) => feed,
        Err(error) => {
            warn!(%key, %screen, %error, "change subscription failed");
            shared.set_state(ListenerState::Failed { reason: error.to_string() });
            return;
        }
    };

    if !shared.register(feed.channel.clone()) {
        shared.engine.remote().unsubscribe(&feed.channel);
        return;
    }
    shared.set_state(ListenerState::Subscribed);
    info!(%key, %screen, channel = %feed.channel, "change listener subscribed");

    let mut events = 0u64;
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = feed.events.recv() => event,
        };
        let Some(event) = event else {
            debug!(%key, %screen, "change feed closed by remote");
            break;
        };
        if !event.affects(&key) {
            continue;
        }

        events += 1;
        shared.set_state(ListenerState::Receiving { events });
        debug!(%key, %screen, change = ?event.change, "change event, resyncing");

        let resynced = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = shared.engine.resync(&key) => result,
        };
        match resynced {
            Ok(rows) => collection.reconcile(rows),
            Err(error) => warn!(%key, %screen, %error, "resync after change event failed"),
        }
    }

    shared.release();
    shared.set_state(ListenerState::Cancelled);
}
