/*!
 * @file validation.rs
 * @brief Database and collection name validation
 */

use crate::error::{MirageError, Result};

const MAX_NAME_LEN: usize = 255;

/// System collections allowed under the reserved `system.` prefix.
const KNOWN_SYSTEM_COLLECTIONS: [&str; 4] = [
    "system.indexes",
    "system.users",
    "system.views",
    "system.profile",
];

/// Database names: non-empty, at most 255 characters, `[A-Za-z0-9_-]`
/// only, no leading dot, no path separators or NUL bytes.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MirageError::InvalidArgument(
            "database name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MirageError::InvalidArgument(format!(
            "database name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    if name.starts_with('.') {
        return Err(MirageError::InvalidArgument(
            "database name must not start with '.'".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(MirageError::InvalidArgument(format!(
            "database name contains forbidden characters: {}",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MirageError::InvalidArgument(format!(
            "database name may only contain letters, digits, '_' and '-': {}",
            name
        )));
    }
    Ok(())
}

/// Collection names: non-empty, at most 255 characters, must begin with a
/// letter or underscore, dots allowed after the first character, the
/// `system.` prefix reserved for known system collections, no NUL bytes.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MirageError::InvalidArgument(
            "collection name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MirageError::InvalidArgument(format!(
            "collection name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(MirageError::InvalidArgument(
            "collection name must not contain NUL bytes".to_string(),
        ));
    }
    let first = name.chars().next().expect("non-empty");
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(MirageError::InvalidArgument(format!(
            "collection name must begin with a letter or '_': {}",
            name
        )));
    }
    if name.starts_with("system.") && !KNOWN_SYSTEM_COLLECTIONS.contains(&name) {
        return Err(MirageError::InvalidArgument(format!(
            "the system. prefix is reserved: {}",
            name
        )));
    }
    Ok(())
}
