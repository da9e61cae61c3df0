// Entity kinds and the keys used to coalesce fetches.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::types::Entity;

/// The entity collections mirrored by the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Activity,
    Listing,
    Note,
    Staff,
    Realtor,
}

impl EntityKind {
    /// Every kind, in full-sync order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Listing,
        EntityKind::Task,
        EntityKind::Activity,
        EntityKind::Note,
        EntityKind::Staff,
        EntityKind::Realtor,
    ];

    /// Collection name: table discriminator, HTTP path segment, and log field.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Activity => "activities",
            Self::Listing => "listings",
            Self::Note => "notes",
            Self::Staff => "staff",
            Self::Realtor => "realtors",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.collection() == name)
    }

    /// Whether fetches of this kind can be narrowed to a single listing.
    pub const fn is_listing_scoped(self) -> bool {
        matches!(self, Self::Task | Self::Activity | Self::Note)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Identifies a coalescable unit of work: a whole collection, or a
/// collection narrowed to one listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchKey {
    pub kind: EntityKind,
    /// Listing id the fetch is narrowed to.
    pub scope: Option<String>,
}

impl FetchKey {
    pub fn all(kind: EntityKind) -> Self {
        Self { kind, scope: None }
    }

    pub fn scoped(kind: EntityKind, listing_id: impl Into<String>) -> Self {
        Self { kind, scope: Some(listing_id.into()) }
    }

    /// True if `entity` belongs to the slice of data this key fetches.
    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.kind() != self.kind {
            return false;
        }
        match &self.scope {
            None => true,
            Some(scope) => entity.listing_id() == Some(scope.as_str()),
        }
    }
}

impl Display for FetchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.scope {
            None => write!(f, "{}", self.kind),
            Some(scope) => write!(f, "{}@{}", self.kind, scope),
        }
    }
}
