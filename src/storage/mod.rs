//! Persistent storage for workflows, versions, audit logs, tickets and
//! subscriptions.

pub mod models;
pub mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
