//! PlaceCore - Rust implementation of the Atlas place-curation application core.
//!
//! This library provides the core functionality for Atlas:
//! - Data models (Entity, Curation, CandidateRecord)
//! - Local store (SQLite)
//! - Remote sync client (optimistic locking, retries, conflict merge)
//! - Catalog deduplication (exact provider keys plus fuzzy name/distance matching)
//! - Configuration management
//!
//! This is a pure Rust library designed to be embedded by the desktop and
//! mobile frontends; it owns no UI and no server-side components.

pub mod config;
pub mod conflicts;
pub mod database;
pub mod dedup;
pub mod error;
pub mod models;
pub mod retry;
pub mod sync_client;
pub mod transform;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use database::Database;
pub use dedup::{DedupOutcome, DeduplicationEngine, IngestOutcome};
pub use error::{PlaceError, PlaceResult};
pub use models::{CandidateRecord, Curation, Entity, EntityStatus, EntityType, SyncStatus};
pub use sync_client::{SweepResult, SyncClient};
