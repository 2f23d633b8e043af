//! Local store operations for Place Core.
//!
//! This module provides all data access functionality using SQLite.
//! Records are stored under their caller-chosen business keys; sync
//! metadata (server id, status, baseline document) lives in dedicated
//! columns next to the content fields.
//!
//! Sync status columns are mutated only through the `mark_*` / `adopt_*`
//! methods, and the sync client is the only caller of those.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::error::{PlaceError, PlaceResult};
use crate::models::{
    Curation, Entity, EntityStatus, EntityType, GeoPoint, SyncState, SyncStatus,
};
use crate::validation::{validate_curation, validate_entity};

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create a new database connection
    pub fn new<P: AsRef<Path>>(db_path: P) -> PlaceResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> PlaceResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_database(&self) -> PlaceResult<()> {
        self.conn.execute_batch(
            r#"
            -- Entities keyed by caller-chosen business key.
            -- Timestamps are RFC 3339 strings.
            CREATE TABLE IF NOT EXISTS entities (
                entity_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                external_id TEXT,
                latitude REAL,
                longitude REAL,
                metadata TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                server_id TEXT,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                last_synced_at TEXT,
                baseline_doc TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_entities_sync_status
                ON entities (sync_status);
            CREATE INDEX IF NOT EXISTS idx_entities_external_id
                ON entities (external_id);

            -- Curations, many per entity
            CREATE TABLE IF NOT EXISTS curations (
                curation_id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                curator TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                rating REAL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                server_id TEXT,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                last_synced_at TEXT,
                baseline_doc TEXT,
                FOREIGN KEY (entity_id) REFERENCES entities (entity_id)
            );

            CREATE INDEX IF NOT EXISTS idx_curations_sync_status
                ON curations (sync_status);
            CREATE INDEX IF NOT EXISTS idx_curations_entity_id
                ON curations (entity_id);
            "#,
        )?;
        Ok(())
    }

    /// Access the underlying connection (tests and migrations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Insert a new local entity. The record starts `pending`.
    pub fn insert_entity(&self, entity: &Entity) -> PlaceResult<()> {
        validate_entity(entity)?;
        self.conn.execute(
            "INSERT INTO entities (entity_id, entity_type, name, status, external_id, \
             latitude, longitude, metadata, version, created_at, updated_at, \
             server_id, sync_status, last_synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entity.entity_id,
                entity.entity_type.as_str(),
                entity.name,
                entity.status.as_str(),
                entity.external_id,
                entity.location.map(|l| l.latitude),
                entity.location.map(|l| l.longitude),
                serde_json::to_string(&entity.metadata)?,
                entity.version,
                entity.created_at.to_rfc3339(),
                entity.updated_at.to_rfc3339(),
                entity.sync.server_id,
                SyncStatus::Pending.as_str(),
                Option::<String>::None,
            ],
        )?;
        Ok(())
    }

    /// Get an entity by business key
    pub fn get_entity(&self, entity_id: &str) -> PlaceResult<Option<Entity>> {
        self.conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = ?1"),
                [entity_id],
                row_to_entity,
            )
            .optional()
            .map_err(PlaceError::from)
    }

    /// All entities, for deduplication scans.
    ///
    /// The scan is not linearizable against concurrent inserts; a missed
    /// duplicate is corrected by a later re-scan.
    pub fn all_entities(&self) -> PlaceResult<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ENTITY_COLUMNS} FROM entities"))?;
        let rows = stmt.query_map([], row_to_entity)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    /// Entities in a given sync status, oldest edits first
    pub fn entities_with_status(&self, status: SyncStatus) -> PlaceResult<Vec<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE sync_status = ?1 ORDER BY updated_at"
        ))?;
        let rows = stmt.query_map([status.as_str()], row_to_entity)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    /// Entities awaiting a sync attempt, oldest edits first: pending
    /// edits plus records whose last attempt ended in conflict or
    /// failure. Those are retried by every sweep until they settle.
    pub fn entities_needing_sync(&self) -> PlaceResult<Vec<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities \
             WHERE sync_status IN (?1, ?2, ?3) ORDER BY updated_at"
        ))?;
        let rows = stmt.query_map(
            params![
                SyncStatus::Pending.as_str(),
                SyncStatus::Conflict.as_str(),
                SyncStatus::Failed.as_str(),
            ],
            row_to_entity,
        )?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    /// Save a local edit to an entity's content fields.
    ///
    /// Bumps `updated_at` and moves the record back to `pending` so the
    /// next sweep picks it up. The stored baseline is left untouched: it
    /// still describes the last known-synced state the edit was based on.
    pub fn save_entity_edit(&self, entity: &Entity) -> PlaceResult<()> {
        validate_entity(entity)?;
        let updated = self.conn.execute(
            "UPDATE entities SET entity_type = ?2, name = ?3, status = ?4, external_id = ?5, \
             latitude = ?6, longitude = ?7, metadata = ?8, updated_at = ?9, \
             sync_status = ?10 WHERE entity_id = ?1",
            params![
                entity.entity_id,
                entity.entity_type.as_str(),
                entity.name,
                entity.status.as_str(),
                entity.external_id,
                entity.location.map(|l| l.latitude),
                entity.location.map(|l| l.longitude),
                serde_json::to_string(&entity.metadata)?,
                Utc::now().to_rfc3339(),
                SyncStatus::Pending.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "entity {} not in local store",
                entity.entity_id
            )));
        }
        Ok(())
    }

    /// Remove an entity from the local store (after a remote delete)
    pub fn remove_entity(&self, entity_id: &str) -> PlaceResult<()> {
        self.conn
            .execute("DELETE FROM entities WHERE entity_id = ?1", [entity_id])?;
        Ok(())
    }

    /// Set an entity's sync status. Sync-client use only.
    pub fn set_entity_sync_status(&self, entity_id: &str, status: SyncStatus) -> PlaceResult<()> {
        let updated = self.conn.execute(
            "UPDATE entities SET sync_status = ?2 WHERE entity_id = ?1",
            params![entity_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "entity {} not in local store",
                entity_id
            )));
        }
        Ok(())
    }

    /// Mark an entity synced: adopt the remote version and server id and
    /// store the baseline document the next edit will diff against.
    /// Sync-client use only.
    pub fn mark_entity_synced(
        &self,
        entity_id: &str,
        server_id: Option<&str>,
        version: i64,
        baseline_doc: &serde_json::Value,
    ) -> PlaceResult<()> {
        let updated = self.conn.execute(
            "UPDATE entities SET version = ?2, server_id = COALESCE(?3, server_id), \
             sync_status = ?4, last_synced_at = ?5, baseline_doc = ?6 WHERE entity_id = ?1",
            params![
                entity_id,
                version,
                server_id,
                SyncStatus::Synced.as_str(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(baseline_doc)?,
            ],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "entity {} not in local store",
                entity_id
            )));
        }
        Ok(())
    }

    /// Replace an entity's content with the canonical remote record and
    /// mark it synced. Used when a create hits a duplicate and the remote
    /// copy is adopted instead. Sync-client use only.
    pub fn adopt_remote_entity(
        &self,
        entity: &Entity,
        baseline_doc: &serde_json::Value,
    ) -> PlaceResult<()> {
        let updated = self.conn.execute(
            "UPDATE entities SET entity_type = ?2, name = ?3, status = ?4, external_id = ?5, \
             latitude = ?6, longitude = ?7, metadata = ?8, version = ?9, updated_at = ?10, \
             server_id = COALESCE(?11, server_id), sync_status = ?12, last_synced_at = ?13, \
             baseline_doc = ?14 WHERE entity_id = ?1",
            params![
                entity.entity_id,
                entity.entity_type.as_str(),
                entity.name,
                entity.status.as_str(),
                entity.external_id,
                entity.location.map(|l| l.latitude),
                entity.location.map(|l| l.longitude),
                serde_json::to_string(&entity.metadata)?,
                entity.version,
                Utc::now().to_rfc3339(),
                entity.sync.server_id,
                SyncStatus::Synced.as_str(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(baseline_doc)?,
            ],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "entity {} not in local store",
                entity.entity_id
            )));
        }
        Ok(())
    }

    /// The baseline document stored at the last successful sync, if any
    pub fn entity_baseline(&self, entity_id: &str) -> PlaceResult<Option<serde_json::Value>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT baseline_doc FROM entities WHERE entity_id = ?1",
                [entity_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Curations
    // =========================================================================

    /// Insert a new local curation. The record starts `pending`.
    pub fn insert_curation(&self, curation: &Curation) -> PlaceResult<()> {
        validate_curation(curation)?;
        self.conn.execute(
            "INSERT INTO curations (curation_id, entity_id, curator, title, body, rating, \
             version, created_at, updated_at, server_id, sync_status, last_synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                curation.curation_id,
                curation.entity_id,
                curation.curator,
                curation.title,
                curation.body,
                curation.rating,
                curation.version,
                curation.created_at.to_rfc3339(),
                curation.updated_at.to_rfc3339(),
                curation.sync.server_id,
                SyncStatus::Pending.as_str(),
                Option::<String>::None,
            ],
        )?;
        Ok(())
    }

    /// Get a curation by business key
    pub fn get_curation(&self, curation_id: &str) -> PlaceResult<Option<Curation>> {
        self.conn
            .query_row(
                &format!("SELECT {CURATION_COLUMNS} FROM curations WHERE curation_id = ?1"),
                [curation_id],
                row_to_curation,
            )
            .optional()
            .map_err(PlaceError::from)
    }

    /// Curations attached to one entity
    pub fn curations_for_entity(&self, entity_id: &str) -> PlaceResult<Vec<Curation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CURATION_COLUMNS} FROM curations WHERE entity_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([entity_id], row_to_curation)?;

        let mut curations = Vec::new();
        for row in rows {
            curations.push(row?);
        }
        Ok(curations)
    }

    /// Curations in a given sync status, oldest edits first
    pub fn curations_with_status(&self, status: SyncStatus) -> PlaceResult<Vec<Curation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CURATION_COLUMNS} FROM curations WHERE sync_status = ?1 ORDER BY updated_at"
        ))?;
        let rows = stmt.query_map([status.as_str()], row_to_curation)?;

        let mut curations = Vec::new();
        for row in rows {
            curations.push(row?);
        }
        Ok(curations)
    }

    /// Curations awaiting a sync attempt: pending, conflicted or failed,
    /// oldest edits first
    pub fn curations_needing_sync(&self) -> PlaceResult<Vec<Curation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CURATION_COLUMNS} FROM curations \
             WHERE sync_status IN (?1, ?2, ?3) ORDER BY updated_at"
        ))?;
        let rows = stmt.query_map(
            params![
                SyncStatus::Pending.as_str(),
                SyncStatus::Conflict.as_str(),
                SyncStatus::Failed.as_str(),
            ],
            row_to_curation,
        )?;

        let mut curations = Vec::new();
        for row in rows {
            curations.push(row?);
        }
        Ok(curations)
    }

    /// Save a local edit to a curation's content fields; moves it back to
    /// `pending`, keeping the stored baseline.
    pub fn save_curation_edit(&self, curation: &Curation) -> PlaceResult<()> {
        validate_curation(curation)?;
        let updated = self.conn.execute(
            "UPDATE curations SET curator = ?2, title = ?3, body = ?4, rating = ?5, \
             updated_at = ?6, sync_status = ?7 WHERE curation_id = ?1",
            params![
                curation.curation_id,
                curation.curator,
                curation.title,
                curation.body,
                curation.rating,
                Utc::now().to_rfc3339(),
                SyncStatus::Pending.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "curation {} not in local store",
                curation.curation_id
            )));
        }
        Ok(())
    }

    /// Remove a curation from the local store
    pub fn remove_curation(&self, curation_id: &str) -> PlaceResult<()> {
        self.conn
            .execute("DELETE FROM curations WHERE curation_id = ?1", [curation_id])?;
        Ok(())
    }

    /// Set a curation's sync status. Sync-client use only.
    pub fn set_curation_sync_status(
        &self,
        curation_id: &str,
        status: SyncStatus,
    ) -> PlaceResult<()> {
        let updated = self.conn.execute(
            "UPDATE curations SET sync_status = ?2 WHERE curation_id = ?1",
            params![curation_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "curation {} not in local store",
                curation_id
            )));
        }
        Ok(())
    }

    /// Mark a curation synced with its new version and baseline.
    /// Sync-client use only.
    pub fn mark_curation_synced(
        &self,
        curation_id: &str,
        server_id: Option<&str>,
        version: i64,
        baseline_doc: &serde_json::Value,
    ) -> PlaceResult<()> {
        let updated = self.conn.execute(
            "UPDATE curations SET version = ?2, server_id = COALESCE(?3, server_id), \
             sync_status = ?4, last_synced_at = ?5, baseline_doc = ?6 WHERE curation_id = ?1",
            params![
                curation_id,
                version,
                server_id,
                SyncStatus::Synced.as_str(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(baseline_doc)?,
            ],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "curation {} not in local store",
                curation_id
            )));
        }
        Ok(())
    }

    /// Replace a curation's content with the canonical remote record and
    /// mark it synced. Sync-client use only.
    pub fn adopt_remote_curation(
        &self,
        curation: &Curation,
        baseline_doc: &serde_json::Value,
    ) -> PlaceResult<()> {
        let updated = self.conn.execute(
            "UPDATE curations SET curator = ?2, title = ?3, body = ?4, rating = ?5, \
             version = ?6, updated_at = ?7, server_id = COALESCE(?8, server_id), \
             sync_status = ?9, last_synced_at = ?10, baseline_doc = ?11 WHERE curation_id = ?1",
            params![
                curation.curation_id,
                curation.curator,
                curation.title,
                curation.body,
                curation.rating,
                curation.version,
                Utc::now().to_rfc3339(),
                curation.sync.server_id,
                SyncStatus::Synced.as_str(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(baseline_doc)?,
            ],
        )?;
        if updated == 0 {
            return Err(PlaceError::NotFound(format!(
                "curation {} not in local store",
                curation.curation_id
            )));
        }
        Ok(())
    }

    /// The baseline document stored at the last successful sync, if any
    pub fn curation_baseline(&self, curation_id: &str) -> PlaceResult<Option<serde_json::Value>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT baseline_doc FROM curations WHERE curation_id = ?1",
                [curation_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

const ENTITY_COLUMNS: &str = "entity_id, entity_type, name, status, external_id, latitude, \
     longitude, metadata, version, created_at, updated_at, server_id, sync_status, last_synced_at";

const CURATION_COLUMNS: &str = "curation_id, entity_id, curator, title, body, rating, version, \
     created_at, updated_at, server_id, sync_status, last_synced_at";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let type_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let latitude: Option<f64> = row.get(5)?;
    let longitude: Option<f64> = row.get(6)?;
    let metadata_json: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let sync_status: String = row.get(12)?;
    let last_synced_at: Option<String> = row.get(13)?;

    let metadata = serde_json::from_str(&metadata_json).unwrap_or_else(|e| {
        warn!(error = %e, "Corrupt metadata JSON in local store, dropping");
        Vec::new()
    });

    Ok(Entity {
        entity_id: row.get(0)?,
        entity_type: EntityType::from_str(&type_str).unwrap_or(EntityType::Other),
        name: row.get(2)?,
        status: EntityStatus::from_str(&status_str).unwrap_or(EntityStatus::Draft),
        external_id: row.get(4)?,
        location: match (latitude, longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        },
        metadata,
        version: row.get(8)?,
        created_at: parse_stored_datetime(&created_at),
        updated_at: parse_stored_datetime(&updated_at),
        sync: SyncState {
            server_id: row.get(11)?,
            status: SyncStatus::from_str(&sync_status).unwrap_or(SyncStatus::Pending),
            last_synced_at: last_synced_at.map(|s| parse_stored_datetime(&s)),
        },
    })
}

fn row_to_curation(row: &Row<'_>) -> rusqlite::Result<Curation> {
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let sync_status: String = row.get(10)?;
    let last_synced_at: Option<String> = row.get(11)?;

    Ok(Curation {
        curation_id: row.get(0)?,
        entity_id: row.get(1)?,
        curator: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        rating: row.get(5)?,
        version: row.get(6)?,
        created_at: parse_stored_datetime(&created_at),
        updated_at: parse_stored_datetime(&updated_at),
        sync: SyncState {
            server_id: row.get(9)?,
            status: SyncStatus::from_str(&sync_status).unwrap_or(SyncStatus::Pending),
            last_synced_at: last_synced_at.map(|s| parse_stored_datetime(&s)),
        },
    })
}

/// Parse an RFC 3339 timestamp written by this store. Rows only ever hold
/// values we wrote, so a parse failure means corruption; fall back to now
/// rather than failing the whole query.
fn parse_stored_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(value = s, error = %e, "Corrupt timestamp in local store");
            Utc::now()
        })
}
