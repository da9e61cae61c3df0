// Change notifications pushed by the remote service.
//
// The payload is advisory: consumers resync the affected collection
// instead of applying the event to local state.

use serde::{Deserialize, Serialize};

use crate::kind::{EntityKind, FetchKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub change: ChangeType,
    /// Changed entity, when the feed reports it.
    pub entity_id: Option<String>,
    /// Listing the changed entity belongs to, when known.
    pub listing_id: Option<String>,
}

impl ChangeEvent {
    /// A change to some unspecified row of `kind`.
    pub fn collection_changed(kind: EntityKind) -> Self {
        Self { kind, change: ChangeType::Update, entity_id: None, listing_id: None }
    }

    /// Whether a subscriber for `key` should resync on this event.
    /// Events that do not name a listing affect every scope of their kind.
    pub fn affects(&self, key: &FetchKey) -> bool {
        if self.kind != key.kind {
            return false;
        }
        match (&key.scope, &self.listing_id) {
            (Some(scope), Some(listing_id)) => scope == listing_id,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_event_affects_every_scope_of_its_kind() {
        let event = ChangeEvent::collection_changed(EntityKind::Note);
        assert!(event.affects(&FetchKey::all(EntityKind::Note)));
        assert!(event.affects(&FetchKey::scoped(EntityKind::Note, "L1")));
        assert!(!event.affects(&FetchKey::all(EntityKind::Task)));
    }

    #[test]
    fn scoped_event_only_affects_matching_listing() {
        let event = ChangeEvent {
            kind: EntityKind::Note,
            change: ChangeType::Insert,
            entity_id: Some("n-1".into()),
            listing_id: Some("L1".into()),
        };
        assert!(event.affects(&FetchKey::scoped(EntityKind::Note, "L1")));
        assert!(!event.affects(&FetchKey::scoped(EntityKind::Note, "L2")));
        assert!(event.affects(&FetchKey::all(EntityKind::Note)));
    }
}
