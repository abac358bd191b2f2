//! WorkflowGuard - HubSpot workflow snapshotting and rollback service.
//!
//! WorkflowGuard connects to a HubSpot account, periodically snapshots the
//! automation workflows it finds there, and stores a versioned copy every
//! time a definition changes. Stored versions can be compared field by field
//! and a live workflow can be rolled back to any prior snapshot.
//!
//! ## Key pieces
//!
//! - **Snapshot service**: cron-scheduled sync that records a new version
//!   only when a workflow's definition checksum changes
//! - **Version history**: append-only; a rollback pushes the old definition
//!   to HubSpot and records a *new* version rather than rewriting history
//! - **Resilience**: the HubSpot client runs behind a circuit breaker and a
//!   bounded exponential-backoff retry; the API runs behind a per-client
//!   sliding-window rate limiter
//! - **Live updates**: a WebSocket channel fans out `workflow:update` and
//!   `workflow:version` events to connected clients

pub mod api;
pub mod billing;
pub mod config;
pub mod diff;
pub mod error;
pub mod hubspot;
pub mod metrics;
pub mod resilience;
pub mod shutdown;
pub mod snapshot;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};
