//! Input validation for Place Core.
//!
//! This module provides validation functions for record fields.
//! All validators return PlaceError::Validation on failure. Validation
//! runs once, at the transformer boundary, not ad hoc downstream.

use crate::error::{PlaceError, PlaceResult};
use crate::models::{Curation, Entity, GeoPoint};

// Limits (matching the remote store's constraints)
pub const MAX_NAME_LENGTH: usize = 200;
pub const MAX_BUSINESS_KEY_LENGTH: usize = 64;
pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_BODY_LENGTH: usize = 100_000; // 100KB of text
pub const MIN_RATING: f64 = 1.0;
pub const MAX_RATING: f64 = 5.0;

/// Validate a business key (entity_id / curation_id).
///
/// Keys are caller-chosen opaque strings; the only constraints are that
/// they are nonempty, bounded, and contain no whitespace (they appear in
/// URL path segments).
pub fn validate_business_key(value: &str, field_name: &str) -> PlaceResult<()> {
    if value.is_empty() {
        return Err(PlaceError::validation(field_name, "must not be empty"));
    }
    if value.len() > MAX_BUSINESS_KEY_LENGTH {
        return Err(PlaceError::validation(
            field_name,
            format!(
                "must be at most {} characters, got {}",
                MAX_BUSINESS_KEY_LENGTH,
                value.len()
            ),
        ));
    }
    if value.chars().any(|c| c.is_whitespace()) {
        return Err(PlaceError::validation(
            field_name,
            "must not contain whitespace",
        ));
    }
    Ok(())
}

/// Validate a display name
pub fn validate_name(value: &str, field_name: &str) -> PlaceResult<()> {
    if value.trim().is_empty() {
        return Err(PlaceError::validation(field_name, "must not be empty"));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(PlaceError::validation(
            field_name,
            format!(
                "must be at most {} characters, got {}",
                MAX_NAME_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Validate coordinates are within decimal-degree ranges
pub fn validate_location(location: &GeoPoint, field_name: &str) -> PlaceResult<()> {
    if !(-90.0..=90.0).contains(&location.latitude) {
        return Err(PlaceError::validation(
            field_name,
            format!("latitude must be between -90 and 90, got {}", location.latitude),
        ));
    }
    if !(-180.0..=180.0).contains(&location.longitude) {
        return Err(PlaceError::validation(
            field_name,
            format!(
                "longitude must be between -180 and 180, got {}",
                location.longitude
            ),
        ));
    }
    Ok(())
}

/// Validate an optional rating is within range
pub fn validate_rating(rating: Option<f64>, field_name: &str) -> PlaceResult<()> {
    if let Some(r) = rating {
        if !(MIN_RATING..=MAX_RATING).contains(&r) {
            return Err(PlaceError::validation(
                field_name,
                format!("must be between {MIN_RATING} and {MAX_RATING}, got {r}"),
            ));
        }
    }
    Ok(())
}

/// Validate a whole entity before it enters the local store or the wire
pub fn validate_entity(entity: &Entity) -> PlaceResult<()> {
    validate_business_key(&entity.entity_id, "entity_id")?;
    validate_name(&entity.name, "name")?;
    if let Some(location) = &entity.location {
        validate_location(location, "location")?;
    }
    if entity.version < 0 {
        return Err(PlaceError::validation("version", "must not be negative"));
    }
    Ok(())
}

/// Validate a whole curation before it enters the local store or the wire
pub fn validate_curation(curation: &Curation) -> PlaceResult<()> {
    validate_business_key(&curation.curation_id, "curation_id")?;
    validate_business_key(&curation.entity_id, "entity_id")?;
    validate_name(&curation.title, "title")?;
    if curation.body.len() > MAX_BODY_LENGTH {
        return Err(PlaceError::validation(
            "body",
            format!("must be at most {} bytes", MAX_BODY_LENGTH),
        ));
    }
    validate_rating(curation.rating, "rating")?;
    if curation.version < 0 {
        return Err(PlaceError::validation("version", "must not be negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;

    #[test]
    fn test_business_key_rules() {
        assert!(validate_business_key("abc-123", "entity_id").is_ok());
        assert!(validate_business_key("", "entity_id").is_err());
        assert!(validate_business_key("has space", "entity_id").is_err());
        assert!(validate_business_key(&"x".repeat(65), "entity_id").is_err());
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("Café Luna", "name").is_ok());
        assert!(validate_name("   ", "name").is_err());
        assert!(validate_name(&"x".repeat(201), "name").is_err());
    }

    #[test]
    fn test_location_ranges() {
        assert!(validate_location(&GeoPoint::new(48.85, 2.35), "location").is_ok());
        assert!(validate_location(&GeoPoint::new(91.0, 0.0), "location").is_err());
        assert!(validate_location(&GeoPoint::new(0.0, -181.0), "location").is_err());
    }

    #[test]
    fn test_rating_ranges() {
        assert!(validate_rating(None, "rating").is_ok());
        assert!(validate_rating(Some(3.5), "rating").is_ok());
        assert!(validate_rating(Some(0.5), "rating").is_err());
        assert!(validate_rating(Some(5.1), "rating").is_err());
    }

    #[test]
    fn test_validate_entity() {
        let mut entity = Entity::new("Café Luna", EntityType::Cafe);
        assert!(validate_entity(&entity).is_ok());

        entity.location = Some(GeoPoint::new(120.0, 0.0));
        assert!(validate_entity(&entity).is_err());
    }
}
