// Persistence: SQLite-backed mirror of every entity collection.

pub mod local;
pub mod migrations;

pub use local::{LocalStore, MergePolicy, UpsertOutcome};
