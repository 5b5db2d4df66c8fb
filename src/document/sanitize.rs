//! Document Field Name Validation
//!
//! Field and collection names end up as keys of filter documents; a name
//! starting with `$` or containing `.` would be read as an operator or a
//! path. Mappings are checked before a session is handed out.

use regex::Regex;

use super::{CLASS_FIELD, ID_FIELD};

/// Fields the backend manages itself
pub const RESERVED_FIELDS: &[&str] = &[ID_FIELD, CLASS_FIELD];

/// Validate a document field name
///
/// Rules:
/// - Must start with a letter or underscore
/// - Can only contain letters, digits, underscores and hyphens
/// - Cannot be one of `reserved`
///
/// # Example
/// ```
/// use runtara_datastore::document::sanitize::{validate_field_name, RESERVED_FIELDS};
///
/// assert!(validate_field_name("firstName", RESERVED_FIELDS).is_ok());
/// assert!(validate_field_name("$where", RESERVED_FIELDS).is_err());
/// assert!(validate_field_name("_class", RESERVED_FIELDS).is_err());
/// ```
pub fn validate_field_name(name: &str, reserved: &[&str]) -> Result<(), String> {
    if name.is_empty() {
        return Err("Field name cannot be empty".to_string());
    }

    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").map_err(|e| e.to_string())?;
    if !re.is_match(name) {
        return Err(format!(
            "Field name '{}' is invalid. Must start with a letter or underscore and contain only letters, digits, underscores and hyphens.",
            name
        ));
    }

    if reserved.contains(&name) {
        return Err(format!("Field name '{}' is reserved and cannot be used.", name));
    }

    Ok(())
}

/// Validate a collection name
///
/// Dots are allowed (counter collections are named `<family>.next_id`), the
/// `system.` prefix is not.
pub fn validate_collection_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Collection name cannot be empty".to_string());
    }

    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").map_err(|e| e.to_string())?;
    if !re.is_match(name) {
        return Err(format!("Collection name '{}' is invalid.", name));
    }

    if name.starts_with("system.") {
        return Err(format!(
            "Collection name '{}' uses the reserved 'system.' prefix.",
            name
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // validate_field_name Tests
    // =========================================================================

    #[test]
    fn test_valid_field_names() {
        assert!(validate_field_name("name", RESERVED_FIELDS).is_ok());
        assert!(validate_field_name("lastUpdated", RESERVED_FIELDS).is_ok());
        assert!(validate_field_name("_private", RESERVED_FIELDS).is_ok());
        assert!(validate_field_name("zip-code", RESERVED_FIELDS).is_ok());
        assert!(validate_field_name("a1", RESERVED_FIELDS).is_ok());
    }

    #[test]
    fn test_operator_like_names_rejected() {
        assert!(validate_field_name("$gt", RESERVED_FIELDS).is_err());
        assert!(validate_field_name("address.city", RESERVED_FIELDS).is_err());
        assert!(validate_field_name("1st", RESERVED_FIELDS).is_err());
        assert!(validate_field_name("has space", RESERVED_FIELDS).is_err());
    }

    #[test]
    fn test_empty_field_name() {
        let err = validate_field_name("", RESERVED_FIELDS).unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_reserved_field_names() {
        assert!(validate_field_name("_id", RESERVED_FIELDS).is_err());
        assert!(validate_field_name("_class", RESERVED_FIELDS).is_err());
        assert!(validate_field_name("_id", &[]).is_ok());
    }

    // =========================================================================
    // validate_collection_name Tests
    // =========================================================================

    #[test]
    fn test_collection_names() {
        assert!(validate_collection_name("person").is_ok());
        assert!(validate_collection_name("person.next_id").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("$cmd").is_err());
        assert!(validate_collection_name("system.indexes").is_err());
    }
}
