//! Validation for entry names, offstream names and entry paths
//!
//! Names are stored as raw UTF-8 in table records, where an inline name is
//! terminated by a NUL byte, so no name may contain NUL. Hierarchical
//! containers additionally reserve `/` as the path separator.

use crate::error::{CofferError, Result};

/// Path separator for hierarchical containers
pub const PATH_SEPARATOR: char = '/';

/// Width of the name field at the head of every offstream
pub const OFFSTREAM_NAME_LEN: usize = 32;

/// Validate an entry name
///
/// # Rules
/// - No NUL bytes
/// - Hierarchical containers: non-empty, no `/`, not `.` or `..`
/// - Single-file containers: any NUL-free name, including the empty name
///
/// # Examples
///
/// ```
/// use coffer_rs::core::validation::validate_entry_name;
///
/// assert!(validate_entry_name("notes.txt", false).is_ok());
/// assert!(validate_entry_name("a/b", false).is_err());
/// assert!(validate_entry_name("", true).is_ok());
/// ```
pub fn validate_entry_name(name: &str, single_file: bool) -> Result<()> {
    if name.contains('\0') {
        return Err(CofferError::InvalidName(
            "name cannot contain NUL bytes".to_string(),
        ));
    }

    if single_file {
        return Ok(());
    }

    if name.is_empty() {
        return Err(CofferError::InvalidName("name cannot be empty".to_string()));
    }

    if name.contains(PATH_SEPARATOR) {
        return Err(CofferError::InvalidName(format!(
            "name '{}' cannot contain '{}'",
            name, PATH_SEPARATOR
        )));
    }

    if name == "." || name == ".." {
        return Err(CofferError::InvalidName(format!(
            "'{}' is a reserved name",
            name
        )));
    }

    Ok(())
}

/// Validate an offstream name (non-empty, NUL-free, fits the name field)
pub fn validate_offstream_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CofferError::InvalidName(
            "offstream name cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(CofferError::InvalidName(
            "offstream name cannot contain NUL bytes".to_string(),
        ));
    }

    if name.len() > OFFSTREAM_NAME_LEN {
        return Err(CofferError::InvalidName(format!(
            "offstream name is {} bytes, limit is {}",
            name.len(),
            OFFSTREAM_NAME_LEN
        )));
    }

    Ok(())
}

/// Split a `/`-separated entry path into its components
///
/// Leading, trailing and repeated separators are ignored.
///
/// ```
/// use coffer_rs::core::validation::split_path;
///
/// assert_eq!(split_path("/docs//readme.md/"), vec!["docs", "readme.md"]);
/// assert!(split_path("/").is_empty());
/// ```
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Join path components with the separator, rooted at `/`
pub fn join_path<'a, I>(components: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut path = String::new();
    for component in components {
        path.push(PATH_SEPARATOR);
        path.push_str(component);
    }
    if path.is_empty() {
        path.push(PATH_SEPARATOR);
    }
    path
}
