// tracker-sync library entry point.

pub mod coalesce;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod listener;
pub mod observable;
pub mod optimistic;
pub mod remote;
pub mod runtime;
pub mod scheduler;
pub mod security;
pub mod store;
