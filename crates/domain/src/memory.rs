//! In-process tables implementing every store trait.
//!
//! Used by tests and by the gateway when no external store is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{
    BlockedApp, ControlPolicy, GeofenceAlert, GeofenceEvent, SafeZone, ScreenTimeAlert,
    ScreenTimeSession, Versioned, ZoneId, ZoneResidency,
};
use crate::store::{AdminStore, ControlStore, GeofenceStore, StoreResult};

#[derive(Default)]
struct Tables {
    zones: HashMap<ZoneId, SafeZone>,
    events: Vec<GeofenceEvent>,
    alerts: Vec<GeofenceAlert>,
    residencies: HashMap<(String, ZoneId), Versioned<ZoneResidency>>,
    policies: HashMap<(String, String), ControlPolicy>,
    blocked: Vec<BlockedApp>,
    sessions: Vec<ScreenTimeSession>,
    screen_time_alerts: Vec<ScreenTimeAlert>,
    next_revision: u64,
}

/// Cheaply cloneable handle to shared tables
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events in insertion order.
    pub async fn events(&self) -> Vec<GeofenceEvent> {
        self.tables.read().await.events.clone()
    }

    /// Geofence alerts in insertion order.
    pub async fn alerts(&self) -> Vec<GeofenceAlert> {
        self.tables.read().await.alerts.clone()
    }

    pub async fn screen_time_alerts(&self) -> Vec<ScreenTimeAlert> {
        self.tables.read().await.screen_time_alerts.clone()
    }

    pub async fn residency(&self, subject: &str, zone_id: &str) -> Option<Versioned<ZoneResidency>> {
        self.tables
            .read()
            .await
            .residencies
            .get(&(subject.to_string(), zone_id.to_string()))
            .cloned()
    }

    /// Forget residency state, leaving only the event history behind.
    pub async fn clear_residencies(&self) {
        self.tables.write().await.residencies.clear();
    }
}

#[async_trait]
impl GeofenceStore for InMemoryStore {
    async fn active_zones(&self, subject: &str) -> StoreResult<Vec<SafeZone>> {
        let tables = self.tables.read().await;
        let mut zones: Vec<SafeZone> = tables
            .zones
            .values()
            .filter(|z| z.child_id == subject && z.is_active)
            .cloned()
            .collect();
        zones.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(zones)
    }

    async fn events_newest_first(&self, subject: &str) -> StoreResult<Vec<GeofenceEvent>> {
        let tables = self.tables.read().await;
        // Reverse insertion order first so equal timestamps resolve to the later write.
        let mut events: Vec<GeofenceEvent> = tables
            .events
            .iter()
            .rev()
            .filter(|e| e.user_id == subject)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    async fn residencies(
        &self,
        subject: &str,
    ) -> StoreResult<HashMap<ZoneId, Versioned<ZoneResidency>>> {
        let tables = self.tables.read().await;
        Ok(tables
            .residencies
            .iter()
            .filter(|((user, _), _)| user == subject)
            .map(|((_, zone), record)| (zone.clone(), record.clone()))
            .collect())
    }

    async fn swap_residency(
        &self,
        residency: &ZoneResidency,
        expected: Option<u64>,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let key = (residency.user_id.clone(), residency.safe_zone_id.clone());
        let current = tables.residencies.get(&key).map(|r| r.revision);
        if current != expected {
            debug!(
                "Residency swap rejected for {}/{}: expected {:?}, found {:?}",
                key.0, key.1, expected, current
            );
            return Err(StoreError::Conflict {
                key: format!("{}.{}", key.0, key.1),
            });
        }
        tables.next_revision += 1;
        let revision = tables.next_revision;
        tables.residencies.insert(
            key,
            Versioned {
                value: residency.clone(),
                revision,
            },
        );
        Ok(revision)
    }

    async fn insert_events(&self, events: &[GeofenceEvent]) -> StoreResult<()> {
        self.tables.write().await.events.extend_from_slice(events);
        Ok(())
    }

    async fn insert_alerts(&self, alerts: &[GeofenceAlert]) -> StoreResult<()> {
        self.tables.write().await.alerts.extend_from_slice(alerts);
        Ok(())
    }
}

#[async_trait]
impl ControlStore for InMemoryStore {
    async fn control_policy(&self, child: &str) -> StoreResult<Option<ControlPolicy>> {
        let tables = self.tables.read().await;
        Ok(tables
            .policies
            .values()
            .find(|p| p.child_id == child)
            .cloned())
    }

    async fn is_app_blocked(&self, child: &str, package_name: &str) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .blocked
            .iter()
            .any(|b| b.child_id == child && b.package_name == package_name && b.is_blocked))
    }

    async fn minutes_used_since(&self, child: &str, since: DateTime<Utc>) -> StoreResult<u32> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.user_id == child && s.started_at >= since)
            .map(|s| s.duration_minutes.unwrap_or(0))
            .fold(0u32, u32::saturating_add))
    }

    async fn insert_screen_time_alert(&self, alert: &ScreenTimeAlert) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .screen_time_alerts
            .push(alert.clone());
        Ok(())
    }
}

#[async_trait]
impl AdminStore for InMemoryStore {
    async fn put_zone(&self, zone: &SafeZone) -> StoreResult<()> {
        zone.validate()?;
        self.tables
            .write()
            .await
            .zones
            .insert(zone.id.clone(), zone.clone());
        Ok(())
    }

    async fn delete_zone(&self, zone_id: &str) -> StoreResult<bool> {
        Ok(self.tables.write().await.zones.remove(zone_id).is_some())
    }

    async fn mark_alert_read(&self, alert_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_control_policy(&self, policy: &ControlPolicy) -> StoreResult<()> {
        self.tables.write().await.policies.insert(
            (policy.parent_id.clone(), policy.child_id.clone()),
            policy.clone(),
        );
        Ok(())
    }

    async fn control_policy_or_default(
        &self,
        parent_id: &str,
        child_id: &str,
    ) -> StoreResult<ControlPolicy> {
        let mut tables = self.tables.write().await;
        let policy = tables
            .policies
            .entry((parent_id.to_string(), child_id.to_string()))
            .or_insert_with(|| ControlPolicy::with_defaults(parent_id, child_id));
        Ok(policy.clone())
    }

    async fn block_app(&self, app: &BlockedApp) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .blocked
            .retain(|b| !(b.child_id == app.child_id && b.package_name == app.package_name));
        tables.blocked.push(app.clone());
        Ok(())
    }

    async fn unblock_app(&self, child_id: &str, package_name: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.blocked.len();
        tables
            .blocked
            .retain(|b| !(b.child_id == child_id && b.package_name == package_name));
        Ok(tables.blocked.len() != before)
    }

    async fn record_session(&self, session: &ScreenTimeSession) -> StoreResult<()> {
        self.tables.write().await.sessions.push(session.clone());
        Ok(())
    }
}
