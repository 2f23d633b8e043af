//! Sync client for the remote entity store.
//!
//! This module provides the client side of synchronization, allowing
//! this device to:
//! - Push locally created records (idempotent create-or-adopt)
//! - Push local edits under optimistic locking (If-Match preconditions)
//! - Resolve version conflicts with a per-field merge
//! - Sweep all pending records, serialized per record
//!
//! Sync status transitions happen only here: pending -> syncing ->
//! {synced | conflict | failed}, and a local edit elsewhere moves a
//! record back to pending. A record that ends in conflict or failed
//! keeps its local edit and is retried by the next sweep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{ETAG, IF_MATCH, LOCATION};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conflicts::{edit_set, resolve_conflict, Resolution};
use crate::database::Database;
use crate::error::{PlaceError, PlaceResult};
use crate::models::{Curation, Entity, SyncStatus};
use crate::retry::retry_with_backoff;
use crate::transform::{curation_to_local, curation_to_remote, entity_to_local, entity_to_remote};

/// Response body fragments that identify a duplicate-key rejection even
/// when the remote store reports it as a 5xx.
const DUPLICATE_KEY_SIGNATURES: &[&str] = &[
    "duplicate key",
    "e11000",
    "unique constraint",
    "already exists",
];

/// Supplies a fresh bearer token when the remote rejects the current one.
/// Token issuance itself is opaque to this crate.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self) -> PlaceResult<String>;
}

/// Result of a sync sweep
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub success: bool,
    pub created: i64,
    pub updated: i64,
    pub conflicts: i64,
    pub failed: i64,
    pub skipped: i64,
    pub errors: Vec<String>,
}

/// Keyed in-flight set: a sweep never runs two operations against the
/// same record concurrently. Guards release on drop.
#[derive(Default)]
struct InFlightSet {
    keys: Mutex<HashSet<String>>,
}

impl InFlightSet {
    fn try_acquire(self: &Arc<Self>, key: String) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap();
        if keys.insert(key.clone()) {
            Some(InFlightGuard {
                set: Arc::clone(self),
                key,
            })
        } else {
            None
        }
    }
}

struct InFlightGuard {
    set: Arc<InFlightSet>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.keys.lock().unwrap().remove(&self.key);
    }
}

/// Sync client
pub struct SyncClient {
    db: Arc<Mutex<Database>>,
    config: Arc<Mutex<Config>>,
    client: Client,
    token_source: Option<Arc<dyn TokenSource>>,
    in_flight: Arc<InFlightSet>,
}

impl SyncClient {
    /// Create a new sync client
    pub fn new(db: Arc<Mutex<Database>>, config: Arc<Mutex<Config>>) -> PlaceResult<Self> {
        let timeout_secs = {
            let cfg = config.lock().unwrap();
            cfg.remote().request_timeout_secs
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PlaceError::Network(e.to_string()))?;

        Ok(Self {
            db,
            config,
            client,
            token_source: None,
            in_flight: Arc::new(InFlightSet::default()),
        })
    }

    /// Attach a token source used to refresh the bearer credential on 401
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Push a locally created entity to the remote store.
    ///
    /// If the remote already holds a record under this business key, the
    /// canonical remote record is fetched and adopted locally instead of
    /// erroring: creating the same logical record twice has the same
    /// observable effect as creating it once.
    pub async fn create_entity(&self, entity_id: &str) -> PlaceResult<Entity> {
        let entity = self.load_entity(entity_id)?;
        self.set_entity_status(entity_id, SyncStatus::Syncing)?;

        match self.create_entity_inner(&entity).await {
            Ok(created) => Ok(created),
            Err(err) => {
                self.set_entity_status(entity_id, SyncStatus::Failed)?;
                Err(err)
            }
        }
    }

    async fn create_entity_inner(&self, entity: &Entity) -> PlaceResult<Entity> {
        let entity_id = entity.entity_id.clone();
        let doc = entity_to_remote(entity)?;
        let (max_attempts, base_delay) = self.retry_params();

        let result = retry_with_backoff("create entity", max_attempts, base_delay, || {
            let doc = doc.clone();
            async move { self.post_remote_doc("entities", &doc).await }
        })
        .await;

        match result {
            Ok((server_id, version, body)) => {
                let mut baseline = body.unwrap_or_else(|| doc.clone());
                baseline["version"] = json!(version);
                if let Some(sid) = &server_id {
                    baseline["_id"] = json!(sid);
                }
                {
                    let db = self.db.lock().unwrap();
                    db.mark_entity_synced(&entity_id, server_id.as_deref(), version, &baseline)?;
                }
                info!(entity_id, version, "Entity created remotely");
                self.load_entity(&entity_id)
            }
            Err(PlaceError::Duplicate(detail)) => {
                info!(entity_id, detail, "Remote already has this entity, adopting canonical record");
                let canonical = self.fetch_remote_doc("entities", &entity_id).await?;
                let remote_entity = entity_to_local(&canonical)?;
                {
                    let db = self.db.lock().unwrap();
                    db.adopt_remote_entity(&remote_entity, &canonical)?;
                }
                self.load_entity(&entity_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Push local edits to an already-synced entity under optimistic
    /// locking. Version conflicts go through the per-field merge, bounded
    /// by the configured number of rounds; an exhausted budget marks the
    /// record `conflict` and surfaces `VersionConflict`, preserving the
    /// local edit.
    pub async fn update_entity(&self, entity_id: &str) -> PlaceResult<Entity> {
        let entity = self.load_entity(entity_id)?;
        self.set_entity_status(entity_id, SyncStatus::Syncing)?;

        match self.update_entity_inner(&entity).await {
            Ok(updated) => Ok(updated),
            Err(err @ PlaceError::VersionConflict { .. }) => {
                self.set_entity_status(entity_id, SyncStatus::Conflict)?;
                Err(err)
            }
            Err(err) => {
                self.set_entity_status(entity_id, SyncStatus::Failed)?;
                Err(err)
            }
        }
    }

    async fn update_entity_inner(&self, entity: &Entity) -> PlaceResult<Entity> {
        let entity_id = entity.entity_id.clone();
        let current_doc = entity_to_remote(entity)?;
        let mut baseline = {
            let db = self.db.lock().unwrap();
            db.entity_baseline(&entity_id)?
        };

        let mut edits = edit_set(&current_doc, baseline.as_ref());
        if edits.is_empty() {
            debug!(entity_id, "No fields changed since baseline, nothing to send");
            let doc = baseline.unwrap_or(current_doc);
            let db = self.db.lock().unwrap();
            db.mark_entity_synced(&entity_id, entity.sync.server_id.as_deref(), entity.version, &doc)?;
            drop(db);
            return self.load_entity(&entity_id);
        }

        let (max_attempts, base_delay) = self.retry_params();
        let conflict_rounds = self.conflict_rounds();
        let mut expected_version = entity.version;
        // Remote record adopted during conflict resolution, if any
        let mut merged_remote: Option<Value> = None;

        for round in 0..=conflict_rounds {
            let attempt = retry_with_backoff("update entity", max_attempts, base_delay, || {
                let patch = edits.clone();
                let entity_id = entity_id.clone();
                async move {
                    self.patch_remote_doc("entities", &entity_id, &patch, expected_version)
                        .await
                }
            })
            .await;

            match attempt {
                Ok((version, body)) => {
                    let mut final_doc = match (body, merged_remote) {
                        (Some(body), _) => body,
                        (None, Some(mut remote)) => {
                            for (field, value) in &edits {
                                remote[field] = value.clone();
                            }
                            remote
                        }
                        (None, None) => current_doc.clone(),
                    };
                    final_doc["version"] = json!(version);

                    let remote_entity = entity_to_local(&final_doc)?;
                    {
                        let db = self.db.lock().unwrap();
                        db.adopt_remote_entity(&remote_entity, &final_doc)?;
                    }
                    info!(entity_id, version, round, "Entity updated remotely");
                    return self.load_entity(&entity_id);
                }
                Err(PlaceError::VersionConflict { remote, .. }) if round < conflict_rounds => {
                    debug!(
                        entity_id,
                        round,
                        expected = expected_version,
                        remote,
                        "Version precondition failed, merging against remote"
                    );
                    let remote_doc = self.fetch_remote_doc("entities", &entity_id).await?;
                    let remote_version =
                        remote_doc.get("version").and_then(Value::as_i64).unwrap_or(0);

                    match resolve_conflict(&edits, baseline.as_ref(), &remote_doc) {
                        Resolution::AlreadySatisfied => {
                            info!(
                                entity_id,
                                remote_version,
                                "All local edits superseded remotely, adopting remote record"
                            );
                            let remote_entity = entity_to_local(&remote_doc)?;
                            {
                                let db = self.db.lock().unwrap();
                                db.adopt_remote_entity(&remote_entity, &remote_doc)?;
                            }
                            return self.load_entity(&entity_id);
                        }
                        Resolution::Retry { patch } => {
                            edits = patch;
                            expected_version = remote_version;
                            baseline = Some(remote_doc.clone());
                            merged_remote = Some(remote_doc);
                        }
                    }
                }
                Err(PlaceError::VersionConflict { remote, .. }) => {
                    warn!(
                        entity_id,
                        rounds = conflict_rounds,
                        "Conflict resolution budget exhausted, marking record conflicted"
                    );
                    return Err(PlaceError::VersionConflict {
                        id: entity_id,
                        expected: expected_version,
                        remote,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        unreachable!("conflict loop returns on the last round")
    }

    /// Delete an entity remotely and drop it from the local store.
    /// Idempotent: a remote 404 means the record is already gone.
    pub async fn delete_entity(&self, entity_id: &str) -> PlaceResult<()> {
        let (max_attempts, base_delay) = self.retry_params();
        let result = retry_with_backoff("delete entity", max_attempts, base_delay, || {
            let entity_id = entity_id.to_string();
            async move { self.delete_remote_doc("entities", &entity_id).await }
        })
        .await;

        match result {
            Ok(()) => {
                let db = self.db.lock().unwrap();
                db.remove_entity(entity_id)?;
                info!(entity_id, "Entity deleted");
                Ok(())
            }
            Err(err) => {
                // Keep the record; the next sweep can retry the delete
                let db = self.db.lock().unwrap();
                if db.get_entity(entity_id)?.is_some() {
                    db.set_entity_sync_status(entity_id, SyncStatus::Failed)?;
                }
                Err(err)
            }
        }
    }

    /// Create-or-update dispatch: a record that never synced is created,
    /// anything else is updated.
    pub async fn sync_entity(&self, entity_id: &str) -> PlaceResult<Entity> {
        let has_server_id = self.load_entity(entity_id)?.sync.server_id.is_some();
        if has_server_id {
            self.update_entity(entity_id).await
        } else {
            self.create_entity(entity_id).await
        }
    }

    // =========================================================================
    // Curations
    // =========================================================================

    /// Push a locally created curation; adopts the canonical remote
    /// record if one already exists under this business key.
    pub async fn create_curation(&self, curation_id: &str) -> PlaceResult<Curation> {
        let curation = self.load_curation(curation_id)?;
        self.set_curation_status(curation_id, SyncStatus::Syncing)?;

        match self.create_curation_inner(&curation).await {
            Ok(created) => Ok(created),
            Err(err) => {
                self.set_curation_status(curation_id, SyncStatus::Failed)?;
                Err(err)
            }
        }
    }

    async fn create_curation_inner(&self, curation: &Curation) -> PlaceResult<Curation> {
        let curation_id = curation.curation_id.clone();
        let doc = curation_to_remote(curation)?;
        let (max_attempts, base_delay) = self.retry_params();

        let result = retry_with_backoff("create curation", max_attempts, base_delay, || {
            let doc = doc.clone();
            async move { self.post_remote_doc("curations", &doc).await }
        })
        .await;

        match result {
            Ok((server_id, version, body)) => {
                let mut baseline = body.unwrap_or_else(|| doc.clone());
                baseline["version"] = json!(version);
                if let Some(sid) = &server_id {
                    baseline["_id"] = json!(sid);
                }
                {
                    let db = self.db.lock().unwrap();
                    db.mark_curation_synced(&curation_id, server_id.as_deref(), version, &baseline)?;
                }
                info!(curation_id, version, "Curation created remotely");
                self.load_curation(&curation_id)
            }
            Err(PlaceError::Duplicate(detail)) => {
                info!(curation_id, detail, "Remote already has this curation, adopting canonical record");
                let canonical = self.fetch_remote_doc("curations", &curation_id).await?;
                let remote_curation = curation_to_local(&canonical)?;
                {
                    let db = self.db.lock().unwrap();
                    db.adopt_remote_curation(&remote_curation, &canonical)?;
                }
                self.load_curation(&curation_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Push local edits to an already-synced curation under optimistic
    /// locking, with the same bounded per-field merge as entities.
    pub async fn update_curation(&self, curation_id: &str) -> PlaceResult<Curation> {
        let curation = self.load_curation(curation_id)?;
        self.set_curation_status(curation_id, SyncStatus::Syncing)?;

        match self.update_curation_inner(&curation).await {
            Ok(updated) => Ok(updated),
            Err(err @ PlaceError::VersionConflict { .. }) => {
                self.set_curation_status(curation_id, SyncStatus::Conflict)?;
                Err(err)
            }
            Err(err) => {
                self.set_curation_status(curation_id, SyncStatus::Failed)?;
                Err(err)
            }
        }
    }

    async fn update_curation_inner(&self, curation: &Curation) -> PlaceResult<Curation> {
        let curation_id = curation.curation_id.clone();
        let current_doc = curation_to_remote(curation)?;
        let mut baseline = {
            let db = self.db.lock().unwrap();
            db.curation_baseline(&curation_id)?
        };

        let mut edits = edit_set(&current_doc, baseline.as_ref());
        if edits.is_empty() {
            debug!(curation_id, "No fields changed since baseline, nothing to send");
            let doc = baseline.unwrap_or(current_doc);
            let db = self.db.lock().unwrap();
            db.mark_curation_synced(
                &curation_id,
                curation.sync.server_id.as_deref(),
                curation.version,
                &doc,
            )?;
            drop(db);
            return self.load_curation(&curation_id);
        }

        let (max_attempts, base_delay) = self.retry_params();
        let conflict_rounds = self.conflict_rounds();
        let mut expected_version = curation.version;
        let mut merged_remote: Option<Value> = None;

        for round in 0..=conflict_rounds {
            let attempt = retry_with_backoff("update curation", max_attempts, base_delay, || {
                let patch = edits.clone();
                let curation_id = curation_id.clone();
                async move {
                    self.patch_remote_doc("curations", &curation_id, &patch, expected_version)
                        .await
                }
            })
            .await;

            match attempt {
                Ok((version, body)) => {
                    let mut final_doc = match (body, merged_remote) {
                        (Some(body), _) => body,
                        (None, Some(mut remote)) => {
                            for (field, value) in &edits {
                                remote[field] = value.clone();
                            }
                            remote
                        }
                        (None, None) => current_doc.clone(),
                    };
                    final_doc["version"] = json!(version);

                    let remote_curation = curation_to_local(&final_doc)?;
                    {
                        let db = self.db.lock().unwrap();
                        db.adopt_remote_curation(&remote_curation, &final_doc)?;
                    }
                    info!(curation_id, version, round, "Curation updated remotely");
                    return self.load_curation(&curation_id);
                }
                Err(PlaceError::VersionConflict { remote, .. }) if round < conflict_rounds => {
                    let remote_doc = self.fetch_remote_doc("curations", &curation_id).await?;
                    let remote_version =
                        remote_doc.get("version").and_then(Value::as_i64).unwrap_or(0);
                    debug!(
                        curation_id,
                        round, remote, remote_version, "Version precondition failed, merging"
                    );

                    match resolve_conflict(&edits, baseline.as_ref(), &remote_doc) {
                        Resolution::AlreadySatisfied => {
                            let remote_curation = curation_to_local(&remote_doc)?;
                            {
                                let db = self.db.lock().unwrap();
                                db.adopt_remote_curation(&remote_curation, &remote_doc)?;
                            }
                            return self.load_curation(&curation_id);
                        }
                        Resolution::Retry { patch } => {
                            edits = patch;
                            expected_version = remote_version;
                            baseline = Some(remote_doc.clone());
                            merged_remote = Some(remote_doc);
                        }
                    }
                }
                Err(PlaceError::VersionConflict { remote, .. }) => {
                    warn!(
                        curation_id,
                        rounds = conflict_rounds,
                        "Conflict resolution budget exhausted, marking record conflicted"
                    );
                    return Err(PlaceError::VersionConflict {
                        id: curation_id,
                        expected: expected_version,
                        remote,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        unreachable!("conflict loop returns on the last round")
    }

    /// Delete a curation remotely and drop it locally. Idempotent.
    pub async fn delete_curation(&self, curation_id: &str) -> PlaceResult<()> {
        let (max_attempts, base_delay) = self.retry_params();
        let result = retry_with_backoff("delete curation", max_attempts, base_delay, || {
            let curation_id = curation_id.to_string();
            async move { self.delete_remote_doc("curations", &curation_id).await }
        })
        .await;

        match result {
            Ok(()) => {
                let db = self.db.lock().unwrap();
                db.remove_curation(curation_id)?;
                Ok(())
            }
            Err(err) => {
                let db = self.db.lock().unwrap();
                if db.get_curation(curation_id)?.is_some() {
                    db.set_curation_sync_status(curation_id, SyncStatus::Failed)?;
                }
                Err(err)
            }
        }
    }

    /// Create-or-update dispatch for curations
    pub async fn sync_curation(&self, curation_id: &str) -> PlaceResult<Curation> {
        let has_server_id = self.load_curation(curation_id)?.sync.server_id.is_some();
        if has_server_id {
            self.update_curation(curation_id).await
        } else {
            self.create_curation(curation_id).await
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Synchronize every record needing sync: pending edits plus records
    /// left in `conflict` or `failed` by an earlier sweep, which are
    /// retried automatically until they settle.
    ///
    /// Records run concurrently up to the configured limit, with a keyed
    /// in-flight set serializing operations per record. A record that
    /// fails or conflicts is counted and left for the next sweep; it
    /// never aborts the others. Cancellation is cooperative at record
    /// boundaries: one record's in-flight request runs to completion.
    pub async fn sync_pending(&self) -> SweepResult {
        let concurrency = {
            let cfg = self.config.lock().unwrap();
            cfg.sweep_concurrency()
        };

        let (entities, curations) = {
            let db = self.db.lock().unwrap();
            let entities = db.entities_needing_sync();
            let curations = db.curations_needing_sync();
            match (entities, curations) {
                (Ok(e), Ok(c)) => (e, c),
                (e, c) => {
                    let mut result = SweepResult::default();
                    for err in [e.err(), c.err()].into_iter().flatten() {
                        result.errors.push(format!("Failed to list pending records: {}", err));
                    }
                    return result;
                }
            }
        };

        enum Job {
            Entity { id: String, is_create: bool },
            Curation { id: String, is_create: bool },
        }

        let jobs: Vec<Job> = entities
            .into_iter()
            .map(|e| Job::Entity {
                is_create: e.sync.server_id.is_none(),
                id: e.entity_id,
            })
            .chain(curations.into_iter().map(|c| Job::Curation {
                is_create: c.sync.server_id.is_none(),
                id: c.curation_id,
            }))
            .collect();

        let totals = Mutex::new(SweepResult::default());
        let totals_ref = &totals;

        stream::iter(jobs)
            .for_each_concurrent(concurrency, |job| async move {
                let (key, id, is_create) = match &job {
                    Job::Entity { id, is_create } => (format!("entity:{id}"), id.clone(), *is_create),
                    Job::Curation { id, is_create } => {
                        (format!("curation:{id}"), id.clone(), *is_create)
                    }
                };

                let Some(_guard) = self.in_flight.try_acquire(key) else {
                    totals_ref.lock().unwrap().skipped += 1;
                    return;
                };

                let outcome = match &job {
                    Job::Entity { id, .. } => self.sync_entity(id).await.map(|_| ()),
                    Job::Curation { id, .. } => self.sync_curation(id).await.map(|_| ()),
                };

                let mut totals = totals_ref.lock().unwrap();
                match outcome {
                    Ok(()) if is_create => totals.created += 1,
                    Ok(()) => totals.updated += 1,
                    Err(PlaceError::VersionConflict { .. }) => totals.conflicts += 1,
                    Err(err) => {
                        totals.failed += 1;
                        totals.errors.push(format!("{}: {}", id, err));
                    }
                }
            })
            .await;

        let mut result = totals.into_inner().unwrap();
        result.success = result.errors.is_empty();
        result
    }

    // =========================================================================
    // Remote HTTP primitives
    // =========================================================================

    async fn post_remote_doc(
        &self,
        collection: &str,
        doc: &Value,
    ) -> PlaceResult<(Option<String>, i64, Option<Value>)> {
        let url = format!("{}/{}", self.base_url(), collection);
        let response = self.send_authed(|client| client.post(&url).json(doc)).await?;
        let status = response.status();

        if status.is_success() {
            let server_id = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| loc.rsplit('/').find(|s| !s.is_empty()))
                .map(String::from);
            let header_version = version_from_etag(&response);
            let body: Option<Value> = response.json().await.ok();
            let version = header_version
                .or_else(|| body.as_ref().and_then(|b| b.get("version")).and_then(Value::as_i64))
                .ok_or_else(|| {
                    PlaceError::sync("create response carried neither an ETag nor a version")
                })?;
            return Ok((server_id, version, body));
        }

        let body_text = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT
            || (status.is_server_error() && is_duplicate_signature(&body_text))
        {
            return Err(PlaceError::Duplicate(format!("HTTP {}: {}", status, body_text)));
        }
        Err(classify_failure(status, body_text, "create"))
    }

    async fn patch_remote_doc(
        &self,
        collection: &str,
        key: &str,
        patch: &Map<String, Value>,
        expected_version: i64,
    ) -> PlaceResult<(i64, Option<Value>)> {
        let url = self.item_url(collection, key);
        let body = Value::Object(patch.clone());
        let response = self
            .send_authed(|client| {
                client
                    .patch(&url)
                    .header(IF_MATCH, format!("\"{}\"", expected_version))
                    .json(&body)
            })
            .await?;
        let status = response.status();

        if status.is_success() {
            let header_version = version_from_etag(&response);
            let body: Option<Value> = response.json().await.ok();
            let version = header_version
                .or_else(|| body.as_ref().and_then(|b| b.get("version")).and_then(Value::as_i64))
                .ok_or_else(|| {
                    PlaceError::sync("update response carried neither an ETag nor a version")
                })?;
            return Ok((version, body));
        }

        let body_text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => {
                let remote = serde_json::from_str::<Value>(&body_text)
                    .ok()
                    .and_then(|v| v.get("version").and_then(Value::as_i64))
                    .unwrap_or(-1);
                Err(PlaceError::VersionConflict {
                    id: key.to_string(),
                    expected: expected_version,
                    remote,
                })
            }
            StatusCode::NOT_FOUND => Err(PlaceError::NotFound(format!(
                "{}/{} no longer exists remotely",
                collection, key
            ))),
            _ => Err(classify_failure(status, body_text, "update")),
        }
    }

    /// GET a document by business key, with transient retry
    async fn fetch_remote_doc(&self, collection: &str, key: &str) -> PlaceResult<Value> {
        let (max_attempts, base_delay) = self.retry_params();
        retry_with_backoff("fetch record", max_attempts, base_delay, || {
            let url = self.item_url(collection, key);
            async move {
                let response = self.send_authed(|client| client.get(&url)).await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json::<Value>().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status == StatusCode::NOT_FOUND {
                    return Err(PlaceError::NotFound(format!("{}/{}", collection, key)));
                }
                Err(classify_failure(status, body_text, "fetch"))
            }
        })
        .await
    }

    async fn delete_remote_doc(&self, collection: &str, key: &str) -> PlaceResult<()> {
        let url = self.item_url(collection, key);
        let response = self.send_authed(|client| client.delete(&url)).await?;
        let status = response.status();

        if status.is_success() || status == StatusCode::NOT_FOUND {
            // Already-deleted is success: delete is idempotent
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        Err(classify_failure(status, body_text, "delete"))
    }

    /// Send a request with the bearer credential attached, refreshing it
    /// once through the token source if the remote answers 401.
    async fn send_authed<B>(&self, build: B) -> PlaceResult<reqwest::Response>
    where
        B: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let token = {
            let cfg = self.config.lock().unwrap();
            cfg.remote().bearer_token.clone()
        };

        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(source) = &self.token_source else {
            return Err(PlaceError::sync("remote rejected credentials (401)"));
        };

        info!("Bearer token rejected, refreshing");
        let fresh = source.refresh().await?;
        {
            let mut cfg = self.config.lock().unwrap();
            cfg.set_bearer_token(&fresh)?;
        }

        let response = build(&self.client).bearer_auth(&fresh).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(PlaceError::sync("remote rejected refreshed credentials (401)"));
        }
        Ok(response)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn base_url(&self) -> String {
        let cfg = self.config.lock().unwrap();
        cfg.remote().base_url.trim_end_matches('/').to_string()
    }

    fn item_url(&self, collection: &str, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url(),
            collection,
            urlencoding::encode(key)
        )
    }

    fn retry_params(&self) -> (u32, Duration) {
        let cfg = self.config.lock().unwrap();
        (
            cfg.retry().max_attempts,
            Duration::from_millis(cfg.retry().base_delay_ms),
        )
    }

    fn conflict_rounds(&self) -> u32 {
        let cfg = self.config.lock().unwrap();
        cfg.retry().conflict_rounds
    }

    fn load_entity(&self, entity_id: &str) -> PlaceResult<Entity> {
        let db = self.db.lock().unwrap();
        db.get_entity(entity_id)?
            .ok_or_else(|| PlaceError::NotFound(format!("entity {} not in local store", entity_id)))
    }

    fn load_curation(&self, curation_id: &str) -> PlaceResult<Curation> {
        let db = self.db.lock().unwrap();
        db.get_curation(curation_id)?.ok_or_else(|| {
            PlaceError::NotFound(format!("curation {} not in local store", curation_id))
        })
    }

    fn set_entity_status(&self, entity_id: &str, status: SyncStatus) -> PlaceResult<()> {
        let db = self.db.lock().unwrap();
        db.set_entity_sync_status(entity_id, status)
    }

    fn set_curation_status(&self, curation_id: &str, status: SyncStatus) -> PlaceResult<()> {
        let db = self.db.lock().unwrap();
        db.set_curation_sync_status(curation_id, status)
    }
}

fn is_duplicate_signature(body: &str) -> bool {
    let lower = body.to_lowercase();
    DUPLICATE_KEY_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Parse the version out of an ETag header: `"3"` or `W/"3"`
fn version_from_etag(response: &reqwest::Response) -> Option<i64> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("W/").trim_matches('"'))
        .and_then(|v| v.parse().ok())
}

fn classify_failure(status: StatusCode, body: String, operation: &str) -> PlaceError {
    if status.is_server_error() {
        PlaceError::RemoteUnavailable {
            status: status.as_u16(),
            body,
        }
    } else {
        PlaceError::sync(format!("{} failed with HTTP {}: {}", operation, status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigData;
    use crate::models::{EntityType, GeoPoint};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        db: Arc<Mutex<Database>>,
        config: Arc<Mutex<Config>>,
        client: SyncClient,
        _server: MockServer,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn setup() -> Fixture {
        init_tracing();
        let server = MockServer::start().await;
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));

        let mut data = ConfigData::default();
        data.remote.base_url = server.uri();
        data.remote.bearer_token = "test-token".to_string();
        data.retry.base_delay_ms = 1; // keep tests fast
        let config = Arc::new(Mutex::new(Config::in_memory(data)));

        let client = SyncClient::new(db.clone(), config.clone()).unwrap();
        Fixture {
            db,
            config,
            client,
            _server: server,
        }
    }

    fn insert_pending_entity(fx: &Fixture, name: &str) -> Entity {
        let mut entity = Entity::new(name, EntityType::Cafe);
        entity.location = Some(GeoPoint::new(48.8566, 2.3522));
        fx.db.lock().unwrap().insert_entity(&entity).unwrap();
        entity
    }

    fn remote_doc_for(entity: &Entity, version: i64) -> Value {
        let mut doc = entity_to_remote(entity).unwrap();
        doc["version"] = json!(version);
        doc["_id"] = json!("srv-1");
        doc
    }

    #[tokio::test]
    async fn test_create_success_adopts_version_and_server_id() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("POST"))
            .and(path("/entities"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("etag", "\"1\"")
                    .insert_header("location", "/entities/srv-77"),
            )
            .mount(&fx._server)
            .await;

        let created = fx.client.create_entity(&entity.entity_id).await.unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.sync.server_id.as_deref(), Some("srv-77"));
        assert_eq!(created.sync.status, SyncStatus::Synced);
        assert!(created.sync.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_idempotent_create_adopts_canonical_on_409() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already exists"))
            .mount(&fx._server)
            .await;

        let mut canonical = remote_doc_for(&entity, 5);
        canonical["displayName"] = json!("Café Luna (canonical)");
        Mock::given(method("GET"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(&canonical))
            .mount(&fx._server)
            .await;

        let adopted = fx.client.create_entity(&entity.entity_id).await.unwrap();
        assert_eq!(adopted.version, 5);
        assert_eq!(adopted.name, "Café Luna (canonical)");
        assert_eq!(adopted.sync.server_id.as_deref(), Some("srv-1"));
        assert_eq!(adopted.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_duplicate_key_signature_in_5xx_body_is_duplicate() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("E11000 duplicate key error collection: entities"),
            )
            .mount(&fx._server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(remote_doc_for(&entity, 2)))
            .mount(&fx._server)
            .await;

        let adopted = fx.client.create_entity(&entity.entity_id).await.unwrap();
        assert_eq!(adopted.version, 2);
        assert_eq!(adopted.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_create_retries_transient_then_succeeds() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .up_to_n_times(2)
            .mount(&fx._server)
            .await;
        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"1\""))
            .mount(&fx._server)
            .await;

        let created = fx.client.create_entity(&entity.entity_id).await.unwrap();
        assert_eq!(created.version, 1);
    }

    #[tokio::test]
    async fn test_create_exhausted_retries_marks_failed() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&fx._server)
            .await;

        let err = fx.client.create_entity(&entity.entity_id).await.unwrap_err();
        assert!(matches!(err, PlaceError::RemoteUnavailable { .. }));

        let stored = fx.db.lock().unwrap().get_entity(&entity.entity_id).unwrap().unwrap();
        assert_eq!(stored.sync.status, SyncStatus::Failed);
    }

    /// Sync an entity to "synced" with a known baseline, then apply a
    /// local edit, ready for update tests.
    fn synced_entity_with_edit(fx: &Fixture) -> Entity {
        let mut entity = insert_pending_entity(fx, "Café Luna");
        entity.sync.server_id = Some("srv-1".to_string());
        entity.version = 1;

        let baseline = remote_doc_for(&entity, 1);
        fx.db
            .lock()
            .unwrap()
            .mark_entity_synced(&entity.entity_id, Some("srv-1"), 1, &baseline)
            .unwrap();

        // Local edit: rename
        entity.name = "Café Luna Nueva".to_string();
        fx.db.lock().unwrap().save_entity_edit(&entity).unwrap();
        fx.db.lock().unwrap().get_entity(&entity.entity_id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_update_success_carries_if_match() {
        let fx = setup().await;
        let entity = synced_entity_with_edit(&fx);

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .and(header("if-match", "\"1\""))
            .and(body_partial_json(json!({"displayName": "Café Luna Nueva"})))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"2\""))
            .mount(&fx._server)
            .await;

        let updated = fx.client.update_entity(&entity.entity_id).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.name, "Café Luna Nueva");
        assert_eq!(updated.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_version_monotonicity_across_updates() {
        let fx = setup().await;
        let mut entity = synced_entity_with_edit(&fx);

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"2\""))
            .up_to_n_times(1)
            .mount(&fx._server)
            .await;
        let updated = fx.client.update_entity(&entity.entity_id).await.unwrap();
        assert_eq!(updated.version, 2);

        // Second local edit and accepted update
        entity = updated;
        entity.status = crate::models::EntityStatus::Active;
        fx.db.lock().unwrap().save_entity_edit(&entity).unwrap();

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .and(header("if-match", "\"2\""))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"3\""))
            .mount(&fx._server)
            .await;
        let updated = fx.client.update_entity(&entity.entity_id).await.unwrap();
        assert_eq!(updated.version, 3); // initial 1 + 2 accepted updates
    }

    #[tokio::test]
    async fn test_disjoint_field_merge_keeps_both_writers() {
        let fx = setup().await;
        let entity = synced_entity_with_edit(&fx); // local edited displayName

        // Remote writer changed status (a field local did not touch)
        let mut remote = remote_doc_for(&entity, 2);
        remote["displayName"] = json!("Café Luna"); // unchanged from baseline
        remote["status"] = json!("active");

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .and(header("if-match", "\"1\""))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .mount(&fx._server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(&remote))
            .mount(&fx._server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .and(header("if-match", "\"2\""))
            .and(body_partial_json(json!({"displayName": "Café Luna Nueva"})))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"3\""))
            .mount(&fx._server)
            .await;

        let updated = fx.client.update_entity(&entity.entity_id).await.unwrap();
        // Local's rename survived, remote's status change adopted
        assert_eq!(updated.name, "Café Luna Nueva");
        assert_eq!(updated.status, crate::models::EntityStatus::Active);
        assert_eq!(updated.version, 3);
        assert_eq!(updated.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_same_field_conflict_remote_wins_without_error() {
        let fx = setup().await;
        let entity = synced_entity_with_edit(&fx); // local edited displayName

        // Remote writer renamed it too
        let mut remote = remote_doc_for(&entity, 2);
        remote["displayName"] = json!("Luna Coffee House");

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .mount(&fx._server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(&remote))
            .mount(&fx._server)
            .await;

        let updated = fx.client.update_entity(&entity.entity_id).await.unwrap();
        assert_eq!(updated.name, "Luna Coffee House");
        assert_eq!(updated.version, 2);
        assert_eq!(updated.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_exhausted_conflict_rounds_marks_conflict() {
        let fx = setup().await;
        let entity = synced_entity_with_edit(&fx);

        // Remote holds the baseline name, so the local edit always
        // survives the merge and every retry hits 409 again.
        let mut remote = remote_doc_for(&entity, 2);
        remote["displayName"] = json!("Café Luna");

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(409))
            .mount(&fx._server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(&remote))
            .mount(&fx._server)
            .await;

        let err = fx.client.update_entity(&entity.entity_id).await.unwrap_err();
        assert!(matches!(err, PlaceError::VersionConflict { .. }));

        let stored = fx.db.lock().unwrap().get_entity(&entity.entity_id).unwrap().unwrap();
        assert_eq!(stored.sync.status, SyncStatus::Conflict);
        // The local edit is preserved, never silently discarded
        assert_eq!(stored.name, "Café Luna Nueva");
    }

    #[tokio::test]
    async fn test_update_with_no_changes_is_satisfied_locally() {
        let fx = setup().await;
        let mut entity = insert_pending_entity(&fx, "Café Luna");
        entity.sync.server_id = Some("srv-1".to_string());
        entity.version = 1;

        let baseline = remote_doc_for(&entity, 1);
        fx.db
            .lock()
            .unwrap()
            .mark_entity_synced(&entity.entity_id, Some("srv-1"), 1, &baseline)
            .unwrap();
        fx.db
            .lock()
            .unwrap()
            .set_entity_sync_status(&entity.entity_id, SyncStatus::Pending)
            .unwrap();

        // No mock mounted: a network write would fail the test
        let updated = fx.client.update_entity(&entity.entity_id).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_on_404() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("DELETE"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&fx._server)
            .await;

        fx.client.delete_entity(&entity.entity_id).await.unwrap();
        assert!(fx.db.lock().unwrap().get_entity(&entity.entity_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_success() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");

        Mock::given(method("DELETE"))
            .and(path(format!("/entities/{}", entity.entity_id)))
            .respond_with(ResponseTemplate::new(204))
            .mount(&fx._server)
            .await;

        fx.client.delete_entity(&entity.entity_id).await.unwrap();
        assert!(fx.db.lock().unwrap().get_entity(&entity.entity_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_refresh_on_401() {
        struct StaticSource;
        #[async_trait]
        impl TokenSource for StaticSource {
            async fn refresh(&self) -> PlaceResult<String> {
                Ok("fresh-token".to_string())
            }
        }

        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");
        let client = SyncClient::new(fx.db.clone(), fx.config.clone())
            .unwrap()
            .with_token_source(Arc::new(StaticSource));

        Mock::given(method("POST"))
            .and(path("/entities"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"1\""))
            .mount(&fx._server)
            .await;
        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&fx._server)
            .await;

        let created = client.create_entity(&entity.entity_id).await.unwrap();
        assert_eq!(created.version, 1);
    }

    #[tokio::test]
    async fn test_sweep_syncs_all_pending_and_tolerates_failures() {
        let fx = setup().await;
        let good = insert_pending_entity(&fx, "Café Luna");
        let _bad = {
            let mut entity = Entity::new("Broken Place", EntityType::Bar);
            // A server id with no baseline forces the update path, and the
            // remote will 404 it
            entity.sync.server_id = Some("srv-gone".to_string());
            entity.version = 3;
            fx.db.lock().unwrap().insert_entity(&entity).unwrap();
            fx.db
                .lock()
                .unwrap()
                .mark_entity_synced(&entity.entity_id, Some("srv-gone"), 3, &json!({}))
                .unwrap();
            let mut edited = entity.clone();
            edited.name = "Broken Place 2".to_string();
            fx.db.lock().unwrap().save_entity_edit(&edited).unwrap();
            entity
        };

        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"1\""))
            .mount(&fx._server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&fx._server)
            .await;

        let result = fx.client.sync_pending().await;
        assert_eq!(result.created, 1);
        assert_eq!(result.failed, 1);
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);

        // The failure never aborted the sweep: the good record synced
        let stored = fx.db.lock().unwrap().get_entity(&good.entity_id).unwrap().unwrap();
        assert_eq!(stored.sync.status, SyncStatus::Synced);
        let stored_bad = fx.db.lock().unwrap().get_entity(&_bad.entity_id).unwrap().unwrap();
        assert_eq!(stored_bad.sync.status, SyncStatus::Failed);
        assert_eq!(stored_bad.name, "Broken Place 2");
    }

    #[tokio::test]
    async fn test_sweep_retries_conflicted_and_failed_records() {
        let fx = setup().await;

        // Settled in conflict on an earlier sweep; the remote accepts now
        let conflicted = synced_entity_with_edit(&fx);
        fx.db
            .lock()
            .unwrap()
            .set_entity_sync_status(&conflicted.entity_id, SyncStatus::Conflict)
            .unwrap();

        // Failed before it ever synced; the create is retried
        let failed = insert_pending_entity(&fx, "Bar Central");
        fx.db
            .lock()
            .unwrap()
            .set_entity_sync_status(&failed.entity_id, SyncStatus::Failed)
            .unwrap();

        Mock::given(method("PATCH"))
            .and(path(format!("/entities/{}", conflicted.entity_id)))
            .and(header("if-match", "\"1\""))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"2\""))
            .mount(&fx._server)
            .await;
        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"1\""))
            .mount(&fx._server)
            .await;

        let result = fx.client.sync_pending().await;
        assert!(result.success);
        assert_eq!(result.updated, 1);
        assert_eq!(result.created, 1);

        let stored = fx.db.lock().unwrap().get_entity(&conflicted.entity_id).unwrap().unwrap();
        assert_eq!(stored.sync.status, SyncStatus::Synced);
        assert_eq!(stored.name, "Café Luna Nueva");
        assert_eq!(stored.version, 2);

        let stored = fx.db.lock().unwrap().get_entity(&failed.entity_id).unwrap().unwrap();
        assert_eq!(stored.sync.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_sweep_includes_curations() {
        let fx = setup().await;
        let entity = insert_pending_entity(&fx, "Café Luna");
        let curation = Curation::new(&entity.entity_id, "alex", "Review", "Good.");
        fx.db.lock().unwrap().insert_curation(&curation).unwrap();

        Mock::given(method("POST"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"1\""))
            .mount(&fx._server)
            .await;
        Mock::given(method("POST"))
            .and(path("/curations"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"1\""))
            .mount(&fx._server)
            .await;

        let result = fx.client.sync_pending().await;
        assert!(result.success);
        assert_eq!(result.created, 2);

        let stored = fx.db.lock().unwrap().get_curation(&curation.curation_id).unwrap().unwrap();
        assert_eq!(stored.sync.status, SyncStatus::Synced);
    }
}
