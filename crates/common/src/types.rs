// Core domain types shared across the tracker crates.
//
// Every entity carries an immutable `id`, an `updated_at` used for
// last-write-wins merging, and soft-delete markers instead of being
// physically removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::kind::EntityKind;

/// Prefix of client-generated ids for entities the server has not seen yet.
pub const PROVISIONAL_ID_PREFIX: &str = "tmp-";

/// Generate a fresh provisional id.
pub fn provisional_id() -> String {
    format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4())
}

pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}

// ── Shared enums ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    Claimed,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCategory {
    Admin,
    Marketing,
    Photo,
    Staging,
    Inspection,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    New,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Admin,
    Operations,
    Marketing,
    Support,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
    Pending,
}

// ── Entities ────────────────────────────────────────────────────────

/// A unit of work, optionally attached to a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(alias = "task_id")]
    pub id: String,
    pub listing_id: Option<String>,
    pub name: String,
    #[serde(alias = "task_category")]
    pub category: TaskCategory,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: u8,
    pub assignee_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

/// A listing-scoped activity shown on the listing's timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: String,
    pub listing_id: String,
    pub name: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    pub assignee_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: String,
    pub address: String,
    pub status: ListingStatus,
    #[serde(alias = "type")]
    pub listing_type: Option<String>,
    #[serde(alias = "assignee")]
    pub assignee_id: Option<String>,
    pub agent_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    /// Completion percentage, 0..=100.
    pub progress: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    #[serde(alias = "note_id")]
    pub id: String,
    pub listing_id: String,
    pub content: String,
    #[serde(default = "default_note_type", alias = "type")]
    pub note_type: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

fn default_note_type() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Staff {
    #[serde(alias = "staff_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: StaffRole,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Realtor {
    #[serde(alias = "realtor_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    pub brokerage: Option<String>,
    #[serde(default)]
    pub territories: Vec<String>,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

/// Closed union over every synced entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Task(Task),
    Activity(Activity),
    Listing(Listing),
    Note(Note),
    Staff(Staff),
    Realtor(Realtor),
}

impl Entity {
    /// Decode an untagged server object as the given kind.
    pub fn from_value(kind: EntityKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Task => Self::Task(serde_json::from_value(value)?),
            EntityKind::Activity => Self::Activity(serde_json::from_value(value)?),
            EntityKind::Listing => Self::Listing(serde_json::from_value(value)?),
            EntityKind::Note => Self::Note(serde_json::from_value(value)?),
            EntityKind::Staff => Self::Staff(serde_json::from_value(value)?),
            EntityKind::Realtor => Self::Realtor(serde_json::from_value(value)?),
        })
    }

    /// Encode without the `kind` tag, as the server expects.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Task(inner) => serde_json::to_value(inner),
            Self::Activity(inner) => serde_json::to_value(inner),
            Self::Listing(inner) => serde_json::to_value(inner),
            Self::Note(inner) => serde_json::to_value(inner),
            Self::Staff(inner) => serde_json::to_value(inner),
            Self::Realtor(inner) => serde_json::to_value(inner),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Activity(_) => EntityKind::Activity,
            Self::Listing(_) => EntityKind::Listing,
            Self::Note(_) => EntityKind::Note,
            Self::Staff(_) => EntityKind::Staff,
            Self::Realtor(_) => EntityKind::Realtor,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Task(inner) => &inner.id,
            Self::Activity(inner) => &inner.id,
            Self::Listing(inner) => &inner.id,
            Self::Note(inner) => &inner.id,
            Self::Staff(inner) => &inner.id,
            Self::Realtor(inner) => &inner.id,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Task(inner) => inner.updated_at,
            Self::Activity(inner) => inner.updated_at,
            Self::Listing(inner) => inner.updated_at,
            Self::Note(inner) => inner.updated_at,
            Self::Staff(inner) => inner.updated_at,
            Self::Realtor(inner) => inner.updated_at,
        }
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Task(inner) => inner.deleted_at,
            Self::Activity(inner) => inner.deleted_at,
            Self::Listing(inner) => inner.deleted_at,
            Self::Note(inner) => inner.deleted_at,
            Self::Staff(inner) => inner.deleted_at,
            Self::Realtor(inner) => inner.deleted_at,
        }
    }

    pub fn deleted_by(&self) -> Option<&str> {
        match self {
            Self::Task(inner) => inner.deleted_by.as_deref(),
            Self::Activity(inner) => inner.deleted_by.as_deref(),
            Self::Listing(inner) => inner.deleted_by.as_deref(),
            Self::Note(inner) => inner.deleted_by.as_deref(),
            Self::Staff(inner) => inner.deleted_by.as_deref(),
            Self::Realtor(inner) => inner.deleted_by.as_deref(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Listing this entity hangs off, for listing-scoped kinds.
    pub fn listing_id(&self) -> Option<&str> {
        match self {
            Self::Task(inner) => inner.listing_id.as_deref(),
            Self::Activity(inner) => Some(&inner.listing_id),
            Self::Note(inner) => Some(&inner.listing_id),
            Self::Listing(_) | Self::Staff(_) | Self::Realtor(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        is_provisional_id(self.id())
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match self {
            Self::Task(inner) => inner.id = id,
            Self::Activity(inner) => inner.id = id,
            Self::Listing(inner) => inner.id = id,
            Self::Note(inner) => inner.id = id,
            Self::Staff(inner) => inner.id = id,
            Self::Realtor(inner) => inner.id = id,
        }
    }

    pub fn set_updated_at(&mut self, at: DateTime<Utc>) {
        match self {
            Self::Task(inner) => inner.updated_at = at,
            Self::Activity(inner) => inner.updated_at = at,
            Self::Listing(inner) => inner.updated_at = at,
            Self::Note(inner) => inner.updated_at = at,
            Self::Staff(inner) => inner.updated_at = at,
            Self::Realtor(inner) => inner.updated_at = at,
        }
    }

    /// Soft delete: stamp the markers and bump `updated_at`.
    pub fn mark_deleted(&mut self, deleted_by: &str, at: DateTime<Utc>) {
        let by = Some(deleted_by.to_string());
        match self {
            Self::Task(inner) => (inner.deleted_at, inner.deleted_by) = (Some(at), by),
            Self::Activity(inner) => (inner.deleted_at, inner.deleted_by) = (Some(at), by),
            Self::Listing(inner) => (inner.deleted_at, inner.deleted_by) = (Some(at), by),
            Self::Note(inner) => (inner.deleted_at, inner.deleted_by) = (Some(at), by),
            Self::Staff(inner) => (inner.deleted_at, inner.deleted_by) = (Some(at), by),
            Self::Realtor(inner) => (inner.deleted_at, inner.deleted_by) = (Some(at), by),
        }
        self.set_updated_at(at);
    }
}

impl Note {
    /// Provisional note for an optimistic submit.
    pub fn provisional(
        listing_id: impl Into<String>,
        content: impl Into<String>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: provisional_id(),
            listing_id: listing_id.into(),
            content: content.into(),
            note_type: default_note_type(),
            created_by: Some(created_by.into()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        }
    }
}
