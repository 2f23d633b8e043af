//! Data models for Place Core.
//!
//! This module defines the core records: Entity (a real-world place),
//! Curation (editorial content attached to an entity), and the sync
//! metadata both carry. Business keys are caller-chosen opaque strings
//! (UUID7 hex when generated locally), independent of any id the remote
//! store assigns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of real-world place an entity describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Restaurant,
    Hotel,
    Venue,
    Cafe,
    Bar,
    Shop,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Restaurant => "restaurant",
            EntityType::Hotel => "hotel",
            EntityType::Venue => "venue",
            EntityType::Cafe => "cafe",
            EntityType::Bar => "bar",
            EntityType::Shop => "shop",
            EntityType::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "restaurant" => Some(EntityType::Restaurant),
            "hotel" => Some(EntityType::Hotel),
            "venue" => Some(EntityType::Venue),
            "cafe" => Some(EntityType::Cafe),
            "bar" => Some(EntityType::Bar),
            "shop" => Some(EntityType::Shop),
            "other" => Some(EntityType::Other),
            _ => None,
        }
    }
}

/// Publication status of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Inactive,
    Draft,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Inactive => "inactive",
            EntityStatus::Draft => "draft",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EntityStatus::Active),
            "inactive" => Some(EntityStatus::Inactive),
            "draft" => Some(EntityStatus::Draft),
            _ => None,
        }
    }
}

/// Where a record stands relative to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created or edited locally, not yet pushed
    Pending,
    /// A sync operation for this record is in flight
    Syncing,
    /// Local and remote agree as of `last_synced_at`
    Synced,
    /// A version conflict exhausted its merge budget; local edit preserved
    Conflict,
    /// A fatal error stopped sync for this record; local edit preserved
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "conflict" => Some(SyncStatus::Conflict),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Sync metadata carried by every syncable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Id the remote store assigned, None until the first successful sync
    pub server_id: Option<String>,
    /// Current sync status; mutated only by the sync client
    pub status: SyncStatus,
    /// When this record last reached `synced`
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Fresh local record: never synced
    pub fn pending() -> Self {
        Self {
            server_id: None,
            status: SyncStatus::Pending,
            last_synced_at: None,
        }
    }
}

/// Geographic point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Opaque provenance record: where a piece of entity data came from.
///
/// The raw payload is kept as-is for audit; the core never interprets it
/// beyond the provider key used by exact-match deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Catalog provider name (e.g., "places-catalog")
    pub provider: String,
    /// The provider's own key for this place, if it exposed one
    pub provider_key: Option<String>,
    /// Raw provider payload, uninterpreted
    pub raw: serde_json::Value,
    /// When this payload was fetched
    pub fetched_at: DateTime<Utc>,
}

/// A real-world place tracked by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Caller-chosen business key, globally unique
    pub entity_id: String,
    /// Kind of place
    pub entity_type: EntityType,
    /// Display name
    pub name: String,
    /// Publication status
    pub status: EntityStatus,
    /// Catalog provider key this entity was ingested from, if any
    pub external_id: Option<String>,
    /// Coordinates; required for fuzzy deduplication
    pub location: Option<GeoPoint>,
    /// Ordered provenance records, oldest first
    pub metadata: Vec<ProvenanceRecord>,
    /// Remote revision counter; +1 per accepted remote update
    pub version: i64,
    /// When the record was created locally
    pub created_at: DateTime<Utc>,
    /// When the record was last modified locally
    pub updated_at: DateTime<Utc>,
    /// Sync metadata
    pub sync: SyncState,
}

impl Entity {
    /// Create a new local entity with a generated business key
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self::with_id(Uuid::now_v7().simple().to_string(), name, entity_type)
    }

    /// Create a new local entity under a caller-chosen business key
    pub fn with_id(
        entity_id: impl Into<String>,
        name: impl Into<String>,
        entity_type: EntityType,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            entity_type,
            name: name.into(),
            status: EntityStatus::Draft,
            external_id: None,
            location: None,
            metadata: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            sync: SyncState::pending(),
        }
    }

    /// All provider keys this entity is known under: its own external id
    /// plus any key embedded in provenance metadata.
    pub fn provider_keys(&self) -> impl Iterator<Item = &str> {
        self.external_id
            .as_deref()
            .into_iter()
            .chain(self.metadata.iter().filter_map(|m| m.provider_key.as_deref()))
    }
}

/// Editorial content a curator attached to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curation {
    /// Caller-chosen business key, globally unique
    pub curation_id: String,
    /// Business key of the entity this curation belongs to
    pub entity_id: String,
    /// Identity of the curator who wrote it
    pub curator: String,
    /// Short title
    pub title: String,
    /// Body text
    pub body: String,
    /// Optional rating, 1.0 to 5.0
    pub rating: Option<f64>,
    /// Remote revision counter; +1 per accepted remote update
    pub version: i64,
    /// When the record was created locally
    pub created_at: DateTime<Utc>,
    /// When the record was last modified locally
    pub updated_at: DateTime<Utc>,
    /// Sync metadata
    pub sync: SyncState,
}

impl Curation {
    /// Create a new local curation with a generated business key
    pub fn new(
        entity_id: impl Into<String>,
        curator: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            curation_id: Uuid::now_v7().simple().to_string(),
            entity_id: entity_id.into(),
            curator: curator.into(),
            title: title.into(),
            body: body.into(),
            rating: None,
            version: 0,
            created_at: now,
            updated_at: now,
            sync: SyncState::pending(),
        }
    }
}

/// A candidate record pulled from the place catalog, not yet ingested.
///
/// This is the shape the deduplication engine judges before any local
/// entity is created for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Candidate display name
    pub name: String,
    /// Candidate coordinates
    pub location: GeoPoint,
    /// The catalog provider's key for this place, if it exposed one
    pub external_key: Option<String>,
}

impl CandidateRecord {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            location: GeoPoint::new(latitude, longitude),
            external_key: None,
        }
    }

    pub fn with_external_key(mut self, key: impl Into<String>) -> Self {
        self.external_key = Some(key.into());
        self
    }
}
