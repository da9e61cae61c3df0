use serde_json::json;
use tracker_common::auth::UserId;
use tracker_common::change::{ChangeEvent, ChangeType};
use tracker_common::kind::{EntityKind, FetchKey};
use tracker_common::patch::{Patch, PatchError};
use tracker_common::types::{Entity, TaskCategory, TaskStatus};

#[test]
fn server_task_payload_decodes_with_legacy_field_names() {
    let payload = json!({
        "task_id": "t-42",
        "listing_id": "L7",
        "name": "Book photographer",
        "task_category": "PHOTO",
        "status": "IN_PROGRESS",
        "assignee_id": "u-3",
        "due_date": null,
        "claimed_at": "2024-03-01T09:00:00Z",
        "completed_at": null,
        "created_at": "2024-02-28T12:00:00Z",
        "updated_at": "2024-03-01T09:00:00Z",
        "deleted_at": null,
        "deleted_by": null
    });

    let entity = Entity::from_value(EntityKind::Task, payload).unwrap();
    let Entity::Task(task) = &entity else { panic!("expected a task") };
    assert_eq!(task.id, "t-42");
    assert_eq!(task.category, TaskCategory::Photo);
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.priority, 0);
    assert_eq!(entity.listing_id(), Some("L7"));
    assert!(!entity.is_deleted());
}

#[test]
fn note_payload_accepts_type_alias_and_defaults_note_type() {
    let base = json!({
        "note_id": "n-1",
        "listing_id": "L1",
        "content": "Gate code 4411",
        "created_by": "u-1",
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "deleted_at": null,
        "deleted_by": null
    });

    let Entity::Note(note) = Entity::from_value(EntityKind::Note, base.clone()).unwrap() else {
        panic!("expected a note");
    };
    assert_eq!(note.note_type, "general");

    let mut typed = base;
    typed["type"] = json!("showing");
    let Entity::Note(note) = Entity::from_value(EntityKind::Note, typed).unwrap() else {
        panic!("expected a note");
    };
    assert_eq!(note.note_type, "showing");
}

#[test]
fn wrong_kind_payload_is_rejected() {
    let staff = json!({
        "id": "s-1",
        "name": "Ada",
        "email": "ada@example.com",
        "role": "operations",
        "status": "active",
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z"
    });
    assert!(Entity::from_value(EntityKind::Staff, staff.clone()).is_ok());
    assert!(Entity::from_value(EntityKind::Listing, staff).is_err());
}

#[test]
fn change_event_wire_shape() {
    let event: ChangeEvent = serde_json::from_value(json!({
        "kind": "activity",
        "change": "delete",
        "entity_id": "a-1",
        "listing_id": "L2"
    }))
    .unwrap();
    assert_eq!(event.kind, EntityKind::Activity);
    assert_eq!(event.change, ChangeType::Delete);
    assert!(event.affects(&FetchKey::scoped(EntityKind::Activity, "L2")));
    assert!(!event.affects(&FetchKey::scoped(EntityKind::Activity, "L3")));
}

#[test]
fn fetch_keys_render_for_logs() {
    assert_eq!(FetchKey::all(EntityKind::Realtor).to_string(), "realtors");
    assert_eq!(FetchKey::scoped(EntityKind::Note, "L1").to_string(), "notes@L1");
}

#[test]
fn claim_patch_serializes_as_field_assignments() {
    let user = UserId::new("u-5").unwrap();
    let at = "2024-05-01T08:30:00Z".parse().unwrap();
    let patch = Patch::claim_task(&user, at);

    let encoded = serde_json::to_value(&patch).unwrap();
    assert_eq!(encoded["status"], json!("CLAIMED"));
    assert_eq!(encoded["assignee_id"], json!("u-5"));
    assert_eq!(encoded["claimed_at"], json!("2024-05-01T08:30:00+00:00"));
}

#[test]
fn patch_cannot_rewrite_identity() {
    let staff = Entity::from_value(
        EntityKind::Staff,
        json!({
            "id": "s-1",
            "name": "Ada",
            "email": "ada@example.com",
            "role": "admin",
            "status": "pending",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }),
    )
    .unwrap();

    let error = Patch::new().set("id", "s-2").apply_to(&staff).unwrap_err();
    assert_eq!(error, PatchError::ImmutableField("id".into()));
}

#[test]
fn user_id_rejects_blank_values() {
    assert!(UserId::new("  ").is_err());
    assert!(serde_json::from_value::<UserId>(json!("")).is_err());
    assert_eq!(serde_json::from_value::<UserId>(json!("u-1")).unwrap().as_str(), "u-1");
}
