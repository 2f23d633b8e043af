//! Deduplication of catalog candidates against the local store.
//!
//! A candidate pulled from the place catalog is checked in two stages
//! before an entity is created for it:
//!
//! 1. Exact: its external key against every stored external id and every
//!    provider key embedded in provenance metadata.
//! 2. Fuzzy: Levenshtein name similarity AND haversine distance, both
//!    within threshold. The conditions are conjunctive: similarly named
//!    places far apart are different businesses (chains), and co-located
//!    places with very different names are treated as distinct (a rename
//!    is ambiguous and is not auto-merged).

use std::sync::{Arc, Mutex};

use tracing::debug;

use chrono::Utc;

use crate::config::DedupConfig;
use crate::database::Database;
use crate::error::PlaceResult;
use crate::models::{CandidateRecord, Entity, EntityType, GeoPoint, ProvenanceRecord};

/// Mean Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Rough kilometers per degree of latitude, for the bounding-box prefilter
const KM_PER_DEGREE_LAT: f64 = 111.0;

/// How a duplicate was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The candidate's external key matched a stored provider key
    ExternalKey,
    /// Name similarity and proximity both passed threshold
    Fuzzy,
}

/// Outcome of a deduplication check, with the matched record for audit
#[derive(Debug)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub matched: Option<Entity>,
    pub match_kind: Option<MatchKind>,
}

impl DedupOutcome {
    fn no_match() -> Self {
        Self {
            is_duplicate: false,
            matched: None,
            match_kind: None,
        }
    }

    fn matched(entity: Entity, kind: MatchKind) -> Self {
        Self {
            is_duplicate: true,
            matched: Some(entity),
            match_kind: Some(kind),
        }
    }
}

/// Decides whether a catalog candidate already exists locally
pub struct DeduplicationEngine {
    db: Arc<Mutex<Database>>,
    config: DedupConfig,
}

impl DeduplicationEngine {
    /// Create a new engine over the local store
    pub fn new(db: Arc<Mutex<Database>>, config: DedupConfig) -> Self {
        Self { db, config }
    }

    /// Check a candidate against every stored entity.
    ///
    /// Full scan; the snapshot is taken once, so an insert racing the
    /// scan can produce a false negative. A later re-scan corrects it.
    pub fn check(&self, candidate: &CandidateRecord) -> PlaceResult<DedupOutcome> {
        let entities = {
            let db = self.db.lock().unwrap();
            db.all_entities()?
        };

        // Stage 1: exact external-key match
        if let Some(key) = candidate.external_key.as_deref() {
            for entity in &entities {
                if entity.provider_keys().any(|k| k == key) {
                    debug!(
                        candidate = %candidate.name,
                        entity_id = %entity.entity_id,
                        key,
                        "Candidate matched stored external key"
                    );
                    return Ok(DedupOutcome::matched(entity.clone(), MatchKind::ExternalKey));
                }
            }
        }

        // Stage 2: fuzzy name + proximity
        for entity in &entities {
            let Some(location) = entity.location else {
                continue;
            };

            // Cheap bounding-box prefilter so most comparisons never pay
            // for edit distance
            if !within_bounding_box(&candidate.location, &location, self.config.max_distance_km) {
                continue;
            }

            let distance_km = haversine_km(&candidate.location, &location);
            if distance_km > self.config.max_distance_km {
                continue;
            }

            let similarity = name_similarity(&candidate.name, &entity.name);
            if similarity >= self.config.name_similarity_threshold {
                debug!(
                    candidate = %candidate.name,
                    entity_id = %entity.entity_id,
                    similarity,
                    distance_km,
                    "Candidate fuzzy-matched stored entity"
                );
                return Ok(DedupOutcome::matched(entity.clone(), MatchKind::Fuzzy));
            }
        }

        Ok(DedupOutcome::no_match())
    }

    /// Check a candidate and, if it is new, store it as a pending entity
    /// carrying a provenance record for the catalog payload.
    pub fn ingest(
        &self,
        candidate: &CandidateRecord,
        entity_type: EntityType,
        provider: &str,
    ) -> PlaceResult<IngestOutcome> {
        let outcome = self.check(candidate)?;
        if let Some(existing) = outcome.matched {
            debug!(
                candidate = %candidate.name,
                entity_id = %existing.entity_id,
                "Skipping ingest, candidate is a duplicate"
            );
            return Ok(IngestOutcome::Duplicate(existing));
        }

        let mut entity = Entity::new(&candidate.name, entity_type);
        entity.location = Some(candidate.location);
        entity.external_id = candidate.external_key.clone();
        entity.metadata.push(ProvenanceRecord {
            provider: provider.to_string(),
            provider_key: candidate.external_key.clone(),
            raw: serde_json::to_value(candidate)?,
            fetched_at: Utc::now(),
        });

        {
            let db = self.db.lock().unwrap();
            db.insert_entity(&entity)?;
        }
        Ok(IngestOutcome::Created(entity))
    }
}

/// Outcome of ingesting a catalog candidate
#[derive(Debug)]
pub enum IngestOutcome {
    /// No duplicate found: a new pending entity was stored
    Created(Entity),
    /// The candidate already exists locally; nothing was stored
    Duplicate(Entity),
}

/// Coarse rectangle test: can `b` possibly be within `max_km` of `a`?
/// Uses a 1.5x margin so the exact haversine check is never skipped for a
/// true neighbor.
fn within_bounding_box(a: &GeoPoint, b: &GeoPoint, max_km: f64) -> bool {
    let margin_deg_lat = max_km * 1.5 / KM_PER_DEGREE_LAT;
    if (a.latitude - b.latitude).abs() > margin_deg_lat {
        return false;
    }
    let cos_lat = a.latitude.to_radians().cos().abs().max(0.01);
    let margin_deg_lon = margin_deg_lat / cos_lat;
    (a.longitude - b.longitude).abs() <= margin_deg_lon
}

/// Great-circle distance between two points, in kilometers
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Name similarity in [0, 1]: `1 - levenshtein / max(len)`,
/// case-insensitive. Two empty names are identical.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Classic Levenshtein distance with unit-cost insert, delete and
/// substitute, using a single rolling row.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitute_cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j] + substitute_cost)
                .min(prev[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, ProvenanceRecord};
    use chrono::Utc;

    fn engine_with(entities: Vec<Entity>) -> DeduplicationEngine {
        let db = Database::new_in_memory().unwrap();
        for entity in &entities {
            db.insert_entity(entity).unwrap();
        }
        DeduplicationEngine::new(Arc::new(Mutex::new(db)), DedupConfig::default())
    }

    fn place(name: &str, lat: f64, lon: f64) -> Entity {
        let mut entity = Entity::new(name, EntityType::Cafe);
        entity.location = Some(GeoPoint::new(lat, lon));
        entity
    }

    #[test]
    fn test_levenshtein_basics() {
        let chars = |s: &str| s.chars().collect::<Vec<_>>();
        assert_eq!(levenshtein(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(levenshtein(&chars("abc"), &chars("abc")), 0);
        assert_eq!(levenshtein(&chars(""), &chars("abc")), 3);
        assert_eq!(levenshtein(&chars("abc"), &chars("")), 3);
    }

    #[test]
    fn test_name_similarity_case_insensitive() {
        assert_eq!(name_similarity("Starbucks", "STARBUCKS"), 1.0);
        let sim = name_similarity("Café Luna", "Cafe Luna");
        assert!(sim > 0.85 && sim < 1.0, "similarity was {}", sim);
        assert_eq!(name_similarity("", ""), 1.0);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London, about 344 km
        let paris = GeoPoint::new(48.8566, 2.3522);
        let london = GeoPoint::new(51.5074, -0.1278);
        let d = haversine_km(&paris, &london);
        assert!((d - 344.0).abs() < 5.0, "distance was {}", d);

        assert_eq!(haversine_km(&paris, &paris), 0.0);
    }

    #[test]
    fn test_exact_match_on_external_id() {
        let mut existing = place("Café Luna", 48.8566, 2.3522);
        existing.external_id = Some("cat-1".to_string());
        let engine = engine_with(vec![existing]);

        let candidate =
            CandidateRecord::new("Totally Different Name", 10.0, 10.0).with_external_key("cat-1");
        let outcome = engine.check(&candidate).unwrap();
        assert!(outcome.is_duplicate);
        assert_eq!(outcome.match_kind, Some(MatchKind::ExternalKey));
    }

    #[test]
    fn test_exact_match_on_provenance_key() {
        let mut existing = place("Café Luna", 48.8566, 2.3522);
        existing.metadata.push(ProvenanceRecord {
            provider: "places-catalog".to_string(),
            provider_key: Some("cat-2".to_string()),
            raw: serde_json::Value::Null,
            fetched_at: Utc::now(),
        });
        let engine = engine_with(vec![existing]);

        let candidate = CandidateRecord::new("Another Name", 10.0, 10.0).with_external_key("cat-2");
        assert!(engine.check(&candidate).unwrap().is_duplicate);
    }

    #[test]
    fn test_fuzzy_duplicate_nearby_similar_name() {
        // 80 m apart: 0.00072 degrees of latitude
        let engine = engine_with(vec![place("Café Luna", 48.8566, 2.3522)]);
        let candidate = CandidateRecord::new("Cafe Luna", 48.85732, 2.3522);

        let outcome = engine.check(&candidate).unwrap();
        assert!(outcome.is_duplicate);
        assert_eq!(outcome.match_kind, Some(MatchKind::Fuzzy));
        assert_eq!(outcome.matched.unwrap().name, "Café Luna");
    }

    #[test]
    fn test_chain_stores_are_not_duplicates() {
        // Same name, 5 km apart
        let engine = engine_with(vec![place("Starbucks", 48.8566, 2.3522)]);
        let candidate = CandidateRecord::new("Starbucks", 48.9016, 2.3522);

        assert!(!engine.check(&candidate).unwrap().is_duplicate);
    }

    #[test]
    fn test_colocated_different_names_not_duplicates() {
        // A closed restaurant replaced by a new one at the same address
        let engine = engine_with(vec![place("Le Petit Jardin", 48.8566, 2.3522)]);
        let candidate = CandidateRecord::new("Burger Palace", 48.8566, 2.3522);

        assert!(!engine.check(&candidate).unwrap().is_duplicate);
    }

    #[test]
    fn test_entities_without_location_skip_fuzzy() {
        let entity = Entity::new("Café Luna", EntityType::Cafe);
        let engine = engine_with(vec![entity]);

        let candidate = CandidateRecord::new("Cafe Luna", 48.8566, 2.3522);
        assert!(!engine.check(&candidate).unwrap().is_duplicate);
    }

    #[test]
    fn test_ingest_creates_then_skips_duplicate() {
        let engine = engine_with(vec![]);
        let candidate =
            CandidateRecord::new("Café Luna", 48.8566, 2.3522).with_external_key("cat-7");

        let first = engine
            .ingest(&candidate, EntityType::Cafe, "places-catalog")
            .unwrap();
        let created = match first {
            IngestOutcome::Created(e) => e,
            other => panic!("expected Created, got {:?}", other),
        };
        assert_eq!(created.external_id.as_deref(), Some("cat-7"));
        assert_eq!(created.metadata.len(), 1);
        assert_eq!(created.metadata[0].provider, "places-catalog");

        // Re-ingesting the same candidate hits the exact-key stage
        let second = engine
            .ingest(&candidate, EntityType::Cafe, "places-catalog")
            .unwrap();
        match second {
            IngestOutcome::Duplicate(e) => assert_eq!(e.entity_id, created.entity_id),
            other => panic!("expected Duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_store_never_matches() {
        let engine = engine_with(vec![]);
        let candidate = CandidateRecord::new("Café Luna", 48.8566, 2.3522);
        assert!(!engine.check(&candidate).unwrap().is_duplicate);
    }
}
