// tracker-common: entity types and identifiers shared by the tracker crates

pub mod auth;
pub mod change;
pub mod kind;
pub mod patch;
pub mod types;
