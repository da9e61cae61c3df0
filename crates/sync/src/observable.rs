// Observable entity list backing one screen.
//
// Subscribers hold a `watch::Receiver` and see every committed snapshot.
// All mutations go through `send_if_modified`/`send_modify`, so a snapshot
// is replaced atomically and subscribers never observe a half-applied
// change. Provisional rows (`tmp-` ids) survive authoritative reconciles
// until they are promoted or retracted.

use std::sync::Arc;

use tokio::sync::watch;
use tracker_common::types::Entity;

#[derive(Clone)]
pub struct ObservableCollection {
    inner: Arc<Inner>,
}

struct Inner {
    entities: watch::Sender<Vec<Entity>>,
    error: watch::Sender<Option<String>>,
}

impl Default for ObservableCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservableCollection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entities: watch::Sender::new(Vec::new()),
                error: watch::Sender::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Entity>> {
        self.inner.entities.subscribe()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.inner.error.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Entity> {
        self.inner.entities.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entities.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entities.borrow().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.entities.borrow().iter().any(|e| e.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.inner.entities.borrow().iter().find(|e| e.id() == id).cloned()
    }

    /// Rows that came from the server rather than an optimistic insert.
    pub fn confirmed_len(&self) -> usize {
        self.inner.entities.borrow().iter().filter(|e| !e.is_provisional()).count()
    }

    /// Replace confirmed rows with `authoritative`, keeping pending
    /// provisional rows at the front.
    pub fn reconcile(&self, authoritative: Vec<Entity>) {
        self.inner.entities.send_if_modified(|current| {
            let mut next: Vec<Entity> =
                current.iter().filter(|e| e.is_provisional()).cloned().collect();
            next.extend(authoritative);
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Drop everything, provisional rows included.
    pub fn replace_all(&self, entities: Vec<Entity>) {
        self.inner.entities.send_replace(entities);
    }

    pub fn insert_provisional(&self, entity: Entity) {
        self.inner.entities.send_modify(|current| current.insert(0, entity));
    }

    /// Swap the provisional row `temp_id` for its confirmed form. A row
    /// already carrying the confirmed id (from a racing resync) is folded
    /// into the promoted one. Returns false if `temp_id` is gone.
    pub fn promote(&self, temp_id: &str, confirmed: Entity) -> bool {
        self.inner.entities.send_if_modified(|current| {
            if !current.iter().any(|e| e.id() == temp_id) {
                return false;
            }
            current.retain(|e| e.id() != confirmed.id());
            if let Some(slot) = current.iter_mut().find(|e| e.id() == temp_id) {
                *slot = confirmed;
            }
            true
        })
    }

    /// Remove the provisional row `temp_id`. Returns false if absent.
    pub fn retract(&self, temp_id: &str) -> bool {
        self.inner.entities.send_if_modified(|current| {
            let before = current.len();
            current.retain(|e| e.id() != temp_id);
            current.len() != before
        })
    }

    /// Replace the row with the same id as `entity`. Returns false if absent.
    pub fn replace_entity(&self, entity: Entity) -> bool {
        self.inner.entities.send_if_modified(|current| {
            match current.iter_mut().find(|e| e.id() == entity.id()) {
                Some(slot) if *slot != entity => {
                    *slot = entity.clone();
                    true
                }
                _ => false,
            }
        })
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.inner.error.send_replace(Some(message.into()));
    }

    pub fn clear_error(&self) {
        self.inner.error.send_if_modified(|error| error.take().is_some());
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.error.borrow().clone()
    }
}
