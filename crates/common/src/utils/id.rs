use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use uuid::Uuid;

use crate::constants::{RANDOM_SUBDOMAIN_LENGTH, SECRET_KEY_LENGTH};

fn random_lowercase(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| c.to_ascii_lowercase())
        .map(char::from)
        .collect()
}

/// Generate a random, URL-safe subdomain
/// Format: 6 lowercase alphanumeric characters
pub fn generate_subdomain() -> String {
    random_lowercase(RANDOM_SUBDOMAIN_LENGTH)
}

/// Generate a tunnel user secret key
pub fn generate_secret_key() -> String {
    random_lowercase(SECRET_KEY_LENGTH)
}

/// Generate a unique identifier for one transport connection using UUID v4
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_subdomain_format() {
        let subdomain = generate_subdomain();

        assert_eq!(subdomain.len(), RANDOM_SUBDOMAIN_LENGTH);
        assert!(subdomain.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(subdomain.chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_secret_key_format() {
        let key = generate_secret_key();
        assert_eq!(key.len(), SECRET_KEY_LENGTH);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_connection_id_uniqueness() {
        let mut ids = HashSet::new();

        for _ in 0..1000 {
            let id = generate_connection_id();
            assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
            assert!(ids.insert(id), "Generated duplicate connection ID");
        }
    }
}
