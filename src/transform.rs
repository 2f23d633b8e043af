//! Bidirectional mapping between remote documents and local records.
//!
//! The remote store speaks camelCase JSON with ISO-8601 dates and its own
//! `_id`; local records use the shapes in `models`. The two directions are
//! mutual inverses on every field both systems persist.
//!
//! Date parsing is total: any parseable ISO-8601 string or epoch value
//! succeeds, and unparseable input falls back to "now" with a logged
//! warning. The only fatal mapping failure is a remote document missing
//! its business key.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{PlaceError, PlaceResult};
use crate::models::{
    Curation, Entity, EntityStatus, EntityType, GeoPoint, ProvenanceRecord, SyncState, SyncStatus,
};
use crate::validation::{validate_curation, validate_entity};

/// Result of a batch transformation: failures are reported alongside
/// successes, never silently dropped and never aborting the batch.
#[derive(Debug, Default)]
pub struct BatchOutcome<T> {
    pub successes: Vec<T>,
    pub failures: Vec<BatchFailure>,
}

/// One element that failed to transform
#[derive(Debug)]
pub struct BatchFailure {
    /// Index of the element in the input batch
    pub index: usize,
    /// What went wrong
    pub error: PlaceError,
}

/// Map a remote entity document to a local record.
///
/// Fails only when `entityId` is absent; every other field degrades to a
/// sensible default with a warning.
pub fn entity_to_local(doc: &Value) -> PlaceResult<Entity> {
    let entity_id = doc
        .get("entityId")
        .and_then(Value::as_str)
        .ok_or_else(|| PlaceError::mapping("remote entity document has no entityId"))?
        .to_string();

    let entity_type = doc
        .get("type")
        .and_then(Value::as_str)
        .and_then(EntityType::from_str)
        .unwrap_or_else(|| {
            warn!(entity_id, "Unknown or missing entity type, defaulting to other");
            EntityType::Other
        });

    let status = doc
        .get("status")
        .and_then(Value::as_str)
        .and_then(EntityStatus::from_str)
        .unwrap_or(EntityStatus::Draft);

    let location = doc.get("location").and_then(|loc| {
        let lat = loc.get("lat").and_then(Value::as_f64)?;
        let lng = loc.get("lng").and_then(Value::as_f64)?;
        Some(GeoPoint::new(lat, lng))
    });

    let metadata = doc
        .get("metadata")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(provenance_to_local).collect())
        .unwrap_or_default();

    Ok(Entity {
        entity_id,
        entity_type,
        name: doc
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status,
        external_id: doc
            .get("externalId")
            .and_then(Value::as_str)
            .map(String::from),
        location,
        metadata,
        version: doc.get("version").and_then(Value::as_i64).unwrap_or(0),
        created_at: remote_datetime(doc.get("createdAt"), "createdAt"),
        updated_at: remote_datetime(doc.get("updatedAt"), "updatedAt"),
        sync: SyncState {
            server_id: doc.get("_id").and_then(Value::as_str).map(String::from),
            status: SyncStatus::Synced,
            last_synced_at: None,
        },
    })
}

/// Map a local entity to the remote document shape.
///
/// Validates once here, at the boundary; downstream code assumes a
/// well-formed document.
pub fn entity_to_remote(entity: &Entity) -> PlaceResult<Value> {
    validate_entity(entity)?;

    let mut doc = json!({
        "entityId": entity.entity_id,
        "type": entity.entity_type.as_str(),
        "displayName": entity.name,
        "status": entity.status.as_str(),
        "externalId": entity.external_id,
        "location": entity.location.map(|l| json!({"lat": l.latitude, "lng": l.longitude})),
        "metadata": entity.metadata.iter().map(provenance_to_remote).collect::<Vec<_>>(),
        "version": entity.version,
        "createdAt": entity.created_at.to_rfc3339(),
        "updatedAt": entity.updated_at.to_rfc3339(),
    });

    if let Some(server_id) = &entity.sync.server_id {
        doc["_id"] = json!(server_id);
    }

    Ok(doc)
}

/// Map a remote curation document to a local record
pub fn curation_to_local(doc: &Value) -> PlaceResult<Curation> {
    let curation_id = doc
        .get("curationId")
        .and_then(Value::as_str)
        .ok_or_else(|| PlaceError::mapping("remote curation document has no curationId"))?
        .to_string();

    let entity_id = doc
        .get("entityId")
        .and_then(Value::as_str)
        .ok_or_else(|| PlaceError::mapping("remote curation document has no entityId"))?
        .to_string();

    Ok(Curation {
        curation_id,
        entity_id,
        curator: doc
            .get("curatedBy")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        title: doc
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        body: doc
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        rating: doc.get("rating").and_then(Value::as_f64),
        version: doc.get("version").and_then(Value::as_i64).unwrap_or(0),
        created_at: remote_datetime(doc.get("createdAt"), "createdAt"),
        updated_at: remote_datetime(doc.get("updatedAt"), "updatedAt"),
        sync: SyncState {
            server_id: doc.get("_id").and_then(Value::as_str).map(String::from),
            status: SyncStatus::Synced,
            last_synced_at: None,
        },
    })
}

/// Map a local curation to the remote document shape
pub fn curation_to_remote(curation: &Curation) -> PlaceResult<Value> {
    validate_curation(curation)?;

    let mut doc = json!({
        "curationId": curation.curation_id,
        "entityId": curation.entity_id,
        "curatedBy": curation.curator,
        "title": curation.title,
        "body": curation.body,
        "rating": curation.rating,
        "version": curation.version,
        "createdAt": curation.created_at.to_rfc3339(),
        "updatedAt": curation.updated_at.to_rfc3339(),
    });

    if let Some(server_id) = &curation.sync.server_id {
        doc["_id"] = json!(server_id);
    }

    Ok(doc)
}

/// Transform a batch of remote entity documents element by element
pub fn entities_to_local(docs: &[Value]) -> BatchOutcome<Entity> {
    batch_to_local(docs, entity_to_local)
}

/// Transform a batch of remote curation documents element by element
pub fn curations_to_local(docs: &[Value]) -> BatchOutcome<Curation> {
    batch_to_local(docs, curation_to_local)
}

fn batch_to_local<T>(docs: &[Value], f: impl Fn(&Value) -> PlaceResult<T>) -> BatchOutcome<T> {
    let mut outcome = BatchOutcome {
        successes: Vec::with_capacity(docs.len()),
        failures: Vec::new(),
    };
    for (index, doc) in docs.iter().enumerate() {
        match f(doc) {
            Ok(record) => outcome.successes.push(record),
            Err(error) => {
                warn!(index, %error, "Skipping malformed document in batch");
                outcome.failures.push(BatchFailure { index, error });
            }
        }
    }
    outcome
}

fn provenance_to_local(item: &Value) -> ProvenanceRecord {
    ProvenanceRecord {
        provider: item
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        provider_key: item
            .get("providerKey")
            .and_then(Value::as_str)
            .map(String::from),
        raw: item.get("raw").cloned().unwrap_or(Value::Null),
        fetched_at: remote_datetime(item.get("fetchedAt"), "fetchedAt"),
    }
}

fn provenance_to_remote(record: &ProvenanceRecord) -> Value {
    json!({
        "provider": record.provider,
        "providerKey": record.provider_key,
        "raw": record.raw,
        "fetchedAt": record.fetched_at.to_rfc3339(),
    })
}

/// Parse a remote date value. Accepts ISO-8601 strings, the legacy
/// "YYYY-MM-DD HH:MM:SS" format, and epoch seconds or milliseconds.
/// Unparseable input falls back to now with a warning; this never fails.
pub fn remote_datetime(value: Option<&Value>, field_name: &str) -> DateTime<Utc> {
    match value {
        Some(Value::String(s)) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return dt.with_timezone(&Utc);
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Utc.from_utc_datetime(&naive);
            }
            warn!(field = field_name, value = %s, "Unparseable remote date, using now");
            Utc::now()
        }
        Some(Value::Number(n)) => {
            let epoch = n.as_i64().unwrap_or(0);
            // Values beyond ~year 2286 in seconds are epoch milliseconds
            let seconds = if epoch.abs() > 10_000_000_000 {
                epoch / 1000
            } else {
                epoch
            };
            match Utc.timestamp_opt(seconds, 0) {
                chrono::LocalResult::Single(dt) => dt,
                _ => {
                    warn!(field = field_name, value = epoch, "Epoch out of range, using now");
                    Utc::now()
                }
            }
        }
        _ => {
            warn!(field = field_name, "Missing remote date, using now");
            Utc::now()
        }
    }
}
