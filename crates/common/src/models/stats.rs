use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity of one tunnel session as shown on the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Session identifier (the tunnel subdomain)
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Active")]
    pub active: bool,

    /// Last time the session registered or completed a forwarded request
    #[serde(rename = "LastActiveAt")]
    pub last_active_at: DateTime<Utc>,
}

/// Point-in-time read of connection and resource statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Number of entries in `connection_status` that are active
    pub active_connections: usize,

    /// CPU usage percentage supplied by the resource sampler
    pub cpu_used: f64,

    /// Memory usage percentage supplied by the resource sampler
    pub memory_used: f64,

    /// Open and recently closed sessions ordered by identifier
    pub connection_status: Vec<ConnectionStatus>,

    /// Requests forwarded since start
    #[serde(default)]
    pub total_requests: u64,

    /// Forwarded requests that ended in a tunnel failure since start
    #[serde(default)]
    pub failed_requests: u64,
}

impl StatsSnapshot {
    /// Check the snapshot's own consistency: the active count matches the status list
    pub fn is_consistent(&self) -> bool {
        self.active_connections == self.connection_status.iter().filter(|s| s.active).count()
    }
}
