//! Stats aggregator
//!
//! Tracks per-session activity for the dashboard and process-wide request counters.
//! Closed sessions stay visible (inactive) until they age out of the retention
//! window or are evicted by the closed-entry cap, oldest first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use warren_common::{ConnectionStatus, StatsSnapshot};

use crate::sampler::ResourceSampler;

#[derive(Debug, Clone)]
struct StatusEntry {
    connection_id: String,
    active: bool,
    last_active_at: DateTime<Utc>,
}

/// Retention of closed sessions in `connection_status`
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_closed_entries: usize,
}

pub struct StatsAggregator {
    entries: RwLock<BTreeMap<String, StatusEntry>>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    sampler: Arc<dyn ResourceSampler>,
    retention: RetentionPolicy,
}

impl StatsAggregator {
    pub fn new(sampler: Arc<dyn ResourceSampler>, retention: RetentionPolicy) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            sampler,
            retention,
        }
    }

    /// Record a newly registered session as active, replacing any closed entry
    pub fn session_opened(&self, id: &str, connection_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            id.to_string(),
            StatusEntry {
                connection_id: connection_id.to_string(),
                active: true,
                last_active_at: Utc::now(),
            },
        );
    }

    /// Mark a session inactive, keeping its last-active time
    ///
    /// Ignored if the entry already belongs to a newer connection.
    pub fn session_closed(&self, id: &str, connection_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(id)
            && entry.connection_id == connection_id
        {
            entry.active = false;
        }
    }

    /// Count a public request routed to a session
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A forwarded request completed: refresh the session's last-active time
    pub fn record_success(&self, id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(id) {
            entry.last_active_at = Utc::now();
        }
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters, resource gauges and per-session status ordered by identifier
    ///
    /// `active_connections` is computed from the same locked view as
    /// `connection_status`, so the two always agree.
    pub fn snapshot(&self) -> StatsSnapshot {
        let connection_status: Vec<ConnectionStatus> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .map(|(id, entry)| ConnectionStatus {
                    id: id.clone(),
                    active: entry.active,
                    last_active_at: entry.last_active_at,
                })
                .collect()
        };
        let active_connections = connection_status.iter().filter(|s| s.active).count();
        let usage = self.sampler.sample();

        StatsSnapshot {
            active_connections,
            cpu_used: usage.cpu_used,
            memory_used: usage.memory_used,
            connection_status,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }

    /// Drop closed entries that outlived the retention policy; returns how many
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.retention.max_age)
            .unwrap_or(chrono::Duration::MAX);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();

        entries.retain(|_, entry| entry.active || now - entry.last_active_at <= max_age);

        let mut closed: Vec<(DateTime<Utc>, String)> = entries
            .iter()
            .filter(|(_, entry)| !entry.active)
            .map(|(id, entry)| (entry.last_active_at, id.clone()))
            .collect();
        if closed.len() > self.retention.max_closed_entries {
            closed.sort();
            let excess = closed.len() - self.retention.max_closed_entries;
            for (_, id) in closed.into_iter().take(excess) {
                entries.remove(&id);
            }
        }

        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} closed session entries", purged);
        }
        purged
    }
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator")
            .field("retention", &self.retention)
            .field("total_requests", &self.total_requests)
            .field("failed_requests", &self.failed_requests)
            .finish_non_exhaustive()
    }
}
