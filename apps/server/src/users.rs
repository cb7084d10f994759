//! Tunnel user store
//!
//! The server only needs a handful of operations from user persistence: resolve a
//! secret key at registration, reflect session activity, and the administrative
//! create/rotate/delete/list calls. [`MemoryUserStore`] keeps everything in process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;
use warren_common::validation::validate_email;
use warren_common::{TunnelUser, generate_secret_key};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserError {
    #[error("enter a valid email address")]
    InvalidEmail,

    #[error("a user with email {0} already exists")]
    EmailTaken(String),

    #[error("no user with email {0}")]
    UnknownEmail(String),

    #[error("no user with id {0}")]
    UnknownId(u64),

    #[error("secret key is already in use")]
    SecretTaken,
}

pub trait UserStore: Send + Sync {
    /// Create a user with a freshly generated secret key
    fn create(&self, email: &str) -> Result<TunnelUser, UserError>;

    /// Create a user with a caller-chosen secret key
    fn create_with_secret(&self, email: &str, secret_key: &str) -> Result<TunnelUser, UserError>;

    fn find_by_secret(&self, secret_key: &str) -> Option<TunnelUser>;

    /// Replace the user's secret key; the returned record carries the new one
    fn rotate_secret(&self, email: &str) -> Result<TunnelUser, UserError>;

    /// Soft delete: the record stays but is hidden and can no longer authenticate
    fn delete(&self, id: u64) -> Result<(), UserError>;

    /// Users that are not deleted, ordered by id
    fn list(&self) -> Vec<TunnelUser>;

    /// One of the user's tunnels registered; the user is active while any is open
    fn session_opened(&self, id: u64);

    /// One of the user's tunnels closed
    fn session_closed(&self, id: u64);

    /// Record tunnel activity for the user
    fn touch(&self, id: u64);
}

#[derive(Debug, Default)]
struct UserTable {
    users: BTreeMap<u64, TunnelUser>,
    /// Open tunnels per user id
    open_sessions: HashMap<u64, usize>,
    next_id: u64,
}

impl UserTable {
    fn live(&self) -> impl Iterator<Item = &TunnelUser> {
        self.users.values().filter(|u| !u.is_deleted())
    }

    fn live_by_email_mut(&mut self, email: &str) -> Option<&mut TunnelUser> {
        self.users
            .values_mut()
            .find(|u| !u.is_deleted() && u.email.eq_ignore_ascii_case(email))
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    table: Mutex<UserTable>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, UserTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserStore for MemoryUserStore {
    fn create(&self, email: &str) -> Result<TunnelUser, UserError> {
        self.create_with_secret(email, &generate_secret_key())
    }

    fn create_with_secret(&self, email: &str, secret_key: &str) -> Result<TunnelUser, UserError> {
        let email = email.trim();
        validate_email(email).map_err(|_| UserError::InvalidEmail)?;

        let mut table = self.table();
        if table.live().any(|u| u.email.eq_ignore_ascii_case(email)) {
            return Err(UserError::EmailTaken(email.to_string()));
        }
        if table.live().any(|u| u.secret_key == secret_key) {
            return Err(UserError::SecretTaken);
        }

        table.next_id += 1;
        let user = TunnelUser::new(table.next_id, email.to_string(), secret_key.to_string());
        table.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn find_by_secret(&self, secret_key: &str) -> Option<TunnelUser> {
        if secret_key.is_empty() {
            return None;
        }
        self.table()
            .live()
            .find(|u| u.secret_key == secret_key)
            .cloned()
    }

    fn rotate_secret(&self, email: &str) -> Result<TunnelUser, UserError> {
        let mut table = self.table();
        let user = table
            .live_by_email_mut(email.trim())
            .ok_or_else(|| UserError::UnknownEmail(email.to_string()))?;
        user.secret_key = generate_secret_key();
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    fn delete(&self, id: u64) -> Result<(), UserError> {
        let mut table = self.table();
        let user = table
            .users
            .get_mut(&id)
            .filter(|u| !u.is_deleted())
            .ok_or(UserError::UnknownId(id))?;
        let now = Utc::now();
        user.deleted_at = Some(now);
        user.updated_at = now;
        user.active = false;
        Ok(())
    }

    fn list(&self) -> Vec<TunnelUser> {
        self.table().live().cloned().collect()
    }

    fn session_opened(&self, id: u64) {
        let mut table = self.table();
        *table.open_sessions.entry(id).or_default() += 1;
        if let Some(user) = table.users.get_mut(&id)
            && !user.is_deleted()
        {
            user.active = true;
            user.last_active_at = Some(Utc::now());
        }
    }

    fn session_closed(&self, id: u64) {
        let mut table = self.table();
        let remaining = match table.open_sessions.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            table.open_sessions.remove(&id);
        }
        if let Some(user) = table.users.get_mut(&id) {
            user.active = remaining > 0 && !user.is_deleted();
        }
    }

    fn touch(&self, id: u64) {
        if let Some(user) = self.table().users.get_mut(&id) {
            user.last_active_at = Some(Utc::now());
        }
    }
}
