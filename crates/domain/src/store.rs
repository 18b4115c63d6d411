//! Datastore seams used by the evaluators.
//!
//! The evaluators only ever see these traits. Backends live elsewhere: the
//! in-memory tables in [`crate::memory`] and the JetStream KV store in the
//! gateway.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::model::{
    BlockedApp, ControlPolicy, GeofenceAlert, GeofenceEvent, SafeZone, ScreenTimeAlert,
    ScreenTimeSession, Versioned, ZoneId, ZoneResidency,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Reads and writes needed by the geofence evaluator
#[async_trait]
pub trait GeofenceStore: Send + Sync {
    /// Zones watching `subject` with `is_active = true`.
    async fn active_zones(&self, subject: &str) -> StoreResult<Vec<SafeZone>>;

    /// Every event recorded for `subject`, most recent first.
    async fn events_newest_first(&self, subject: &str) -> StoreResult<Vec<GeofenceEvent>>;

    /// Residency records for `subject`, keyed by zone.
    async fn residencies(&self, subject: &str)
        -> StoreResult<HashMap<ZoneId, Versioned<ZoneResidency>>>;

    /// Write `residency` only if the stored revision still equals `expected`
    /// (`None` means no record may exist yet). Returns the new revision, or
    /// [`StoreError::Conflict`] when another writer got there first.
    async fn swap_residency(
        &self,
        residency: &ZoneResidency,
        expected: Option<u64>,
    ) -> StoreResult<u64>;

    async fn insert_events(&self, events: &[GeofenceEvent]) -> StoreResult<()>;

    async fn insert_alerts(&self, alerts: &[GeofenceAlert]) -> StoreResult<()>;
}

/// Reads and writes needed by the control policy evaluator
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn control_policy(&self, child: &str) -> StoreResult<Option<ControlPolicy>>;

    async fn is_app_blocked(&self, child: &str, package_name: &str) -> StoreResult<bool>;

    /// Sum of session durations for sessions started at or after `since`.
    async fn minutes_used_since(&self, child: &str, since: DateTime<Utc>) -> StoreResult<u32>;

    async fn insert_screen_time_alert(&self, alert: &ScreenTimeAlert) -> StoreResult<()>;
}

/// Parent-side mutations. The evaluators never call these.
#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn put_zone(&self, zone: &SafeZone) -> StoreResult<()>;

    /// Remove a zone entirely. Returns whether it existed.
    async fn delete_zone(&self, zone_id: &str) -> StoreResult<bool>;

    /// Flip an alert to read. Returns whether it existed.
    async fn mark_alert_read(&self, alert_id: &str) -> StoreResult<bool>;

    async fn put_control_policy(&self, policy: &ControlPolicy) -> StoreResult<()>;

    /// Fetch the (parent, child) policy, creating it with defaults if absent.
    async fn control_policy_or_default(
        &self,
        parent_id: &str,
        child_id: &str,
    ) -> StoreResult<ControlPolicy>;

    async fn block_app(&self, app: &BlockedApp) -> StoreResult<()>;

    /// Delete the block row. Returns whether one existed.
    async fn unblock_app(&self, child_id: &str, package_name: &str) -> StoreResult<bool>;

    async fn record_session(&self, session: &ScreenTimeSession) -> StoreResult<()>;
}

/// Reduce a newest-first event list to the latest event per zone.
pub fn latest_event_per_zone(events: Vec<GeofenceEvent>) -> HashMap<ZoneId, GeofenceEvent> {
    let mut latest = HashMap::new();
    for event in events {
        latest.entry(event.safe_zone_id.clone()).or_insert(event);
    }
    latest
}
