//! Input validation for security-critical data
//!
//! This module provides validation functions for user-supplied input: requested
//! tunnel subdomains, tunnel user emails, and request paths relayed to agents.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Subdomains: lowercase alphanumeric labels joined by single dashes
static SUBDOMAIN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid subdomain regex"));

/// Deliberately loose: one `@`, a dotted domain, no whitespace
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

/// Maximum length of a DNS label
pub const MAX_SUBDOMAIN_LENGTH: usize = 63;

/// Maximum length for HTTP paths
pub const MAX_PATH_LENGTH: usize = 8192;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("subdomain must contain only a-z, 0-9 and `-` (not leading or trailing): {0}")]
    InvalidSubdomain(String),

    #[error("subdomain too long: {0} chars (max: {1})")]
    SubdomainTooLong(usize, usize),

    #[error("enter a valid email address")]
    InvalidEmail,

    #[error("Path too long: {0} bytes (max: {1})")]
    PathTooLong(usize, usize),
}

/// Validate a requested tunnel subdomain
///
/// # Examples
///
/// ```
/// use warren_common::validation::validate_subdomain;
///
/// assert!(validate_subdomain("my-app").is_ok());
/// assert!(validate_subdomain("-app").is_err());
/// assert!(validate_subdomain("").is_err());
/// ```
pub fn validate_subdomain(subdomain: &str) -> Result<(), ValidationError> {
    if subdomain.len() > MAX_SUBDOMAIN_LENGTH {
        return Err(ValidationError::SubdomainTooLong(
            subdomain.len(),
            MAX_SUBDOMAIN_LENGTH,
        ));
    }
    if !SUBDOMAIN_REGEX.is_match(subdomain) {
        return Err(ValidationError::InvalidSubdomain(
            subdomain.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate an email address
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if !EMAIL_REGEX.is_match(email) {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

/// Validate and sanitize HTTP path
///
/// - Removes control characters
/// - Enforces length limits
/// - Ensures path starts with /
pub fn validate_path(path: &str) -> Result<String, ValidationError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path.len(), MAX_PATH_LENGTH));
    }

    let sanitized: String = path.chars().filter(|c| !c.is_control()).collect();

    if sanitized.is_empty() {
        Ok("/".to_string())
    } else if sanitized.starts_with('/') {
        Ok(sanitized)
    } else {
        Ok(format!("/{}", sanitized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_subdomain_valid() {
        assert!(validate_subdomain("test").is_ok());
        assert!(validate_subdomain("abc123").is_ok());
        assert!(validate_subdomain("my-cool-app").is_ok());
        assert!(validate_subdomain(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_validate_subdomain_invalid() {
        assert!(validate_subdomain("").is_err());
        assert!(validate_subdomain("UPPER").is_err());
        assert!(validate_subdomain("-leading").is_err());
        assert!(validate_subdomain("trailing-").is_err());
        assert!(validate_subdomain("double--dash").is_err());
        assert!(validate_subdomain("dot.ted").is_err());
        assert!(matches!(
            validate_subdomain(&"a".repeat(64)),
            Err(ValidationError::SubdomainTooLong(64, 63))
        ));
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("test@warren.dev").is_ok());
        assert!(validate_email(" test ").is_err());
        assert!(validate_email("no-at-sign.dev").is_err());
        assert!(validate_email("two@@signs.dev").is_err());
    }

    #[test]
    fn test_validate_path() {
        assert_eq!(validate_path("/foo/bar?x=1").unwrap(), "/foo/bar?x=1");
        assert_eq!(validate_path("foo/bar").unwrap(), "/foo/bar");
        assert_eq!(validate_path("").unwrap(), "/");

        let sanitized = validate_path("/foo\x00/bar\n/baz").unwrap();
        assert_eq!(sanitized, "/foo/bar/baz");

        let long_path = "/".to_string() + &"a".repeat(MAX_PATH_LENGTH);
        assert!(validate_path(&long_path).is_err());
    }
}
