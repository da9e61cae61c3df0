// Field-level patches sent with remote mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::UserId;
use crate::types::{Entity, TaskStatus};

/// Fields a patch may never touch.
const IMMUTABLE_FIELDS: &[&str] = &["id", "kind", "created_at"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("field `{0}` is immutable")]
    ImmutableField(String),
    #[error("patch does not fit entity: {0}")]
    Invalid(String),
}

/// A JSON object of field assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `field`. Later assignments to the same field win.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // ── Task lifecycle ─────────────────────────────────────────────

    pub fn claim_task(assignee: &UserId, now: DateTime<Utc>) -> Self {
        Self::new()
            .set("status", status_value(TaskStatus::Claimed))
            .set("assignee_id", assignee.as_str())
            .set("claimed_at", now.to_rfc3339())
    }

    pub fn unclaim_task() -> Self {
        Self::new()
            .set("status", status_value(TaskStatus::Open))
            .set("assignee_id", Value::Null)
            .set("claimed_at", Value::Null)
    }

    pub fn complete_task(now: DateTime<Utc>) -> Self {
        Self::new()
            .set("status", status_value(TaskStatus::Done))
            .set("completed_at", now.to_rfc3339())
    }

    pub fn reopen_task() -> Self {
        Self::new()
            .set("status", status_value(TaskStatus::Open))
            .set("completed_at", Value::Null)
    }

    pub fn soft_delete(deleted_by: &UserId, now: DateTime<Utc>) -> Self {
        Self::new().set("deleted_at", now.to_rfc3339()).set("deleted_by", deleted_by.as_str())
    }

    /// Apply the assignments to a copy of `entity`.
    pub fn apply_to(&self, entity: &Entity) -> Result<Entity, PatchError> {
        if let Some(field) = self.fields().find(|field| IMMUTABLE_FIELDS.contains(field)) {
            return Err(PatchError::ImmutableField(field.to_string()));
        }

        let mut value =
            entity.to_value().map_err(|error| PatchError::Invalid(error.to_string()))?;
        let Some(object) = value.as_object_mut() else {
            return Err(PatchError::Invalid("entity did not encode as an object".into()));
        };
        for (field, assigned) in &self.0 {
            object.insert(field.clone(), assigned.clone());
        }

        Entity::from_value(entity.kind(), value)
            .map_err(|error| PatchError::Invalid(error.to_string()))
    }
}

fn status_value(status: TaskStatus) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}
