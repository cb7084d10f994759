use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Administrative record of a user allowed to open tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TunnelUser {
    #[serde(rename = "ID")]
    pub id: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Set when the user is soft-deleted
    pub deleted_at: Option<DateTime<Utc>>,

    pub email: String,

    /// Never serialized; only shown once when created or rotated
    #[serde(skip)]
    pub secret_key: String,

    /// True while one of the user's tunnels is connected
    pub active: bool,

    /// None means the user never connected
    pub last_active_at: Option<DateTime<Utc>>,
}

impl TunnelUser {
    pub fn new(id: u64, email: String, secret_key: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            email,
            secret_key,
            active: false,
            last_active_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
