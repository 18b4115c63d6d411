//! JetStream KV store backend
//!
//! Every record is one JSON value. Identifier segments are hex-encoded so
//! arbitrary ids (e.g. `auth0|abc`) stay within the KV key alphabet.
//!
//! Key layout:
//! - `zone.<child>.<zone>`
//! - `event.<user>.<event>`
//! - `alert.<child>.<alert>`
//! - `residency.<user>.<zone>` (revision drives the conditional write)
//! - `policy.<child>.<parent>`
//! - `blocked.<child>.<package>`
//! - `session.<user>.<session>`
//! - `stalert.<user>.<alert>`

use anyhow::Result;
use async_nats::jetstream::{self, kv::Operation, kv::Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use haven_domain::model::{
    BlockedApp, ControlPolicy, GeofenceAlert, GeofenceEvent, SafeZone, ScreenTimeAlert,
    ScreenTimeSession, Versioned, ZoneId, ZoneResidency,
};
use haven_domain::{AdminStore, ControlStore, GeofenceStore, StoreError, StoreResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Hex-encode one key segment.
pub fn segment(id: &str) -> String {
    hex::encode(id.as_bytes())
}

fn zone_key(child: &str, zone: &str) -> String {
    format!("zone.{}.{}", segment(child), segment(zone))
}

fn event_key(user: &str, event: &str) -> String {
    format!("event.{}.{}", segment(user), segment(event))
}

fn alert_key(child: &str, alert: &str) -> String {
    format!("alert.{}.{}", segment(child), segment(alert))
}

pub fn residency_key(user: &str, zone: &str) -> String {
    format!("residency.{}.{}", segment(user), segment(zone))
}

fn policy_key(child: &str, parent: &str) -> String {
    format!("policy.{}.{}", segment(child), segment(parent))
}

fn blocked_key(child: &str, package: &str) -> String {
    format!("blocked.{}.{}", segment(child), segment(package))
}

fn session_key(user: &str, session: &str) -> String {
    format!("session.{}.{}", segment(user), segment(session))
}

fn screen_time_alert_key(user: &str, alert: &str) -> String {
    format!("stalert.{}.{}", segment(user), segment(alert))
}

fn backend<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{}: {}", context, e))
}

/// What to do with a stored value that no longer deserializes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undecodable {
    /// Log and leave the record out
    Skip,
    /// Fail the read; for records that drive state inference
    Fail,
}

/// Decode raw `(key, bytes)` pairs into records.
pub fn decode_records<T: DeserializeOwned>(
    raw: Vec<(String, Vec<u8>)>,
    undecodable: Undecodable,
) -> StoreResult<Vec<T>> {
    let mut values = Vec::with_capacity(raw.len());
    for (key, bytes) in raw {
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => values.push(value),
            Err(e) if undecodable == Undecodable::Skip => {
                warn!("Failed to parse record for key {}: {}", key, e);
            }
            Err(e) => {
                return Err(StoreError::Serialization(format!(
                    "record {} is unreadable: {}",
                    key, e
                )))
            }
        }
    }
    Ok(values)
}

/// JetStream KV client holding every Haven record
#[derive(Clone)]
pub struct KvStore {
    kv_store: Store,
}

impl KvStore {
    /// Connect to NATS and open (or create) the bucket.
    pub async fn connect(nats_url: &str, creds_path: Option<&str>, bucket_name: &str) -> Result<Self> {
        info!(
            "Connecting to NATS at {} for KV operations (bucket: {})",
            nats_url, bucket_name
        );

        let client = if let Some(creds_path) = creds_path {
            info!("Using credentials file: {}", creds_path);
            async_nats::ConnectOptions::new()
                .credentials_file(creds_path)
                .await?
                .connect(nats_url)
                .await?
        } else {
            warn!("No NATS credentials provided, connecting without auth");
            async_nats::connect(nats_url).await?
        };

        let jetstream = jetstream::new(client);

        let kv_store = match jetstream.get_key_value(bucket_name).await {
            Ok(store) => {
                info!("Using existing KV bucket: {}", bucket_name);
                store
            }
            Err(_) => {
                info!("Creating new KV bucket: {}", bucket_name);
                let config = jetstream::kv::Config {
                    bucket: bucket_name.to_string(),
                    description: "Haven safe zone and parental control records".to_string(),
                    history: 5,
                    ..Default::default()
                };
                jetstream.create_key_value(config).await?
            }
        };

        Ok(Self { kv_store })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self
            .kv_store
            .get(key)
            .await
            .map_err(backend("KV get failed"))?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<u64> {
        let bytes = serde_json::to_vec(value)?;
        self.kv_store
            .put(key, bytes.into())
            .await
            .map_err(backend("KV put failed"))
    }

    /// Live revision for `key`, ignoring delete markers.
    async fn live_revision(&self, key: &str) -> StoreResult<Option<u64>> {
        let entry = self
            .kv_store
            .entry(key)
            .await
            .map_err(backend("KV entry read failed"))?;
        Ok(entry
            .filter(|e| matches!(e.operation, Operation::Put))
            .map(|e| e.revision))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = self
            .kv_store
            .keys()
            .await
            .map_err(backend("KV key listing failed"))?
            .boxed();

        let mut matching = Vec::new();
        while let Some(key_result) = keys.next().await {
            match key_result {
                Ok(key) if key.starts_with(prefix) => matching.push(key),
                Ok(_) => {}
                Err(e) => warn!("Error reading key from KV: {}", e),
            }
        }
        Ok(matching)
    }

    async fn values_with_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
        undecodable: Undecodable,
    ) -> StoreResult<Vec<T>> {
        let mut raw = Vec::new();
        for key in self.keys_with_prefix(prefix).await? {
            let bytes = self
                .kv_store
                .get(key.as_str())
                .await
                .map_err(backend("KV get failed"))?;
            if let Some(bytes) = bytes {
                raw.push((key, bytes.to_vec()));
            }
        }
        decode_records(raw, undecodable)
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.kv_store
            .delete(key)
            .await
            .map_err(backend("KV delete failed"))
    }
}

#[async_trait]
impl GeofenceStore for KvStore {
    async fn active_zones(&self, subject: &str) -> StoreResult<Vec<SafeZone>> {
        let prefix = format!("zone.{}.", segment(subject));
        let mut zones: Vec<SafeZone> = self
            .values_with_prefix::<SafeZone>(&prefix, Undecodable::Skip)
            .await?
            .into_iter()
            .filter(|z| z.is_active)
            .collect();
        zones.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("Loaded {} active zones for {}", zones.len(), subject);
        Ok(zones)
    }

    async fn events_newest_first(&self, subject: &str) -> StoreResult<Vec<GeofenceEvent>> {
        let prefix = format!("event.{}.", segment(subject));
        let mut events = self
            .values_with_prefix::<GeofenceEvent>(&prefix, Undecodable::Fail)
            .await?;
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    async fn residencies(
        &self,
        subject: &str,
    ) -> StoreResult<HashMap<ZoneId, Versioned<ZoneResidency>>> {
        let prefix = format!("residency.{}.", segment(subject));
        let mut records = HashMap::new();
        for key in self.keys_with_prefix(&prefix).await? {
            let entry = self
                .kv_store
                .entry(key.as_str())
                .await
                .map_err(backend("KV entry read failed"))?;
            let Some(entry) = entry.filter(|e| matches!(e.operation, Operation::Put)) else {
                continue;
            };
            let value: ZoneResidency = serde_json::from_slice(&entry.value)?;
            records.insert(
                value.safe_zone_id.clone(),
                Versioned {
                    value,
                    revision: entry.revision,
                },
            );
        }
        Ok(records)
    }

    async fn swap_residency(
        &self,
        residency: &ZoneResidency,
        expected: Option<u64>,
    ) -> StoreResult<u64> {
        let key = residency_key(&residency.user_id, &residency.safe_zone_id);
        let bytes = serde_json::to_vec(residency)?;

        let written = match expected {
            None => self
                .kv_store
                .create(key.as_str(), bytes.into())
                .await
                .map_err(|e| e.to_string()),
            Some(revision) => self
                .kv_store
                .update(key.as_str(), bytes.into(), revision)
                .await
                .map_err(|e| e.to_string()),
        };

        match written {
            Ok(revision) => Ok(revision),
            Err(reason) => {
                // Distinguish a lost race from a backend failure by re-reading.
                let current = self.live_revision(&key).await?;
                if current != expected {
                    debug!(
                        "Residency swap lost for {}: expected {:?}, found {:?}",
                        key, expected, current
                    );
                    Err(StoreError::Conflict { key })
                } else {
                    Err(StoreError::Backend(format!(
                        "KV conditional write failed: {}",
                        reason
                    )))
                }
            }
        }
    }

    async fn insert_events(&self, events: &[GeofenceEvent]) -> StoreResult<()> {
        let mut written: Vec<String> = Vec::with_capacity(events.len());
        for event in events {
            let key = event_key(&event.user_id, &event.id);
            if let Err(e) = self.put_json(&key, event).await {
                // All or nothing: drop the events that already landed.
                for key in &written {
                    if let Err(undo) = self.delete_key(key).await {
                        warn!("Could not remove partially written event {}: {}", key, undo);
                    }
                }
                return Err(e);
            }
            written.push(key);
        }
        debug!("Stored {} geofence events", events.len());
        Ok(())
    }

    async fn insert_alerts(&self, alerts: &[GeofenceAlert]) -> StoreResult<()> {
        for alert in alerts {
            self.put_json(&alert_key(&alert.child_id, &alert.id), alert)
                .await?;
        }
        debug!("Stored {} geofence alerts", alerts.len());
        Ok(())
    }
}

#[async_trait]
impl ControlStore for KvStore {
    async fn control_policy(&self, child: &str) -> StoreResult<Option<ControlPolicy>> {
        let prefix = format!("policy.{}.", segment(child));
        Ok(self
            .values_with_prefix::<ControlPolicy>(&prefix, Undecodable::Skip)
            .await?
            .into_iter()
            .next())
    }

    async fn is_app_blocked(&self, child: &str, package_name: &str) -> StoreResult<bool> {
        Ok(self
            .get_json::<BlockedApp>(&blocked_key(child, package_name))
            .await?
            .is_some_and(|b| b.is_blocked))
    }

    async fn minutes_used_since(&self, child: &str, since: DateTime<Utc>) -> StoreResult<u32> {
        let prefix = format!("session.{}.", segment(child));
        Ok(self
            .values_with_prefix::<ScreenTimeSession>(&prefix, Undecodable::Skip)
            .await?
            .iter()
            .filter(|s| s.started_at >= since)
            .map(|s| s.duration_minutes.unwrap_or(0))
            .fold(0u32, u32::saturating_add))
    }

    async fn insert_screen_time_alert(&self, alert: &ScreenTimeAlert) -> StoreResult<()> {
        self.put_json(&screen_time_alert_key(&alert.user_id, &alert.id), alert)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AdminStore for KvStore {
    async fn put_zone(&self, zone: &SafeZone) -> StoreResult<()> {
        zone.validate()?;
        // A zone reassigned to another child must not linger under the old key.
        self.delete_zone(&zone.id).await?;
        self.put_json(&zone_key(&zone.child_id, &zone.id), zone)
            .await?;
        Ok(())
    }

    async fn delete_zone(&self, zone_id: &str) -> StoreResult<bool> {
        let suffix = format!(".{}", segment(zone_id));
        let mut deleted = false;
        for key in self.keys_with_prefix("zone.").await? {
            if key.ends_with(&suffix) {
                self.delete_key(&key).await?;
                deleted = true;
            }
        }
        Ok(deleted)
    }

    async fn mark_alert_read(&self, alert_id: &str) -> StoreResult<bool> {
        let suffix = format!(".{}", segment(alert_id));
        for key in self.keys_with_prefix("alert.").await? {
            if !key.ends_with(&suffix) {
                continue;
            }
            if let Some(mut alert) = self.get_json::<GeofenceAlert>(&key).await? {
                alert.is_read = true;
                self.put_json(&key, &alert).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn put_control_policy(&self, policy: &ControlPolicy) -> StoreResult<()> {
        self.put_json(&policy_key(&policy.child_id, &policy.parent_id), policy)
            .await?;
        Ok(())
    }

    async fn control_policy_or_default(
        &self,
        parent_id: &str,
        child_id: &str,
    ) -> StoreResult<ControlPolicy> {
        let key = policy_key(child_id, parent_id);
        if let Some(existing) = self.get_json::<ControlPolicy>(&key).await? {
            return Ok(existing);
        }

        let defaults = ControlPolicy::with_defaults(parent_id, child_id);
        let bytes = serde_json::to_vec(&defaults)?;
        match self.kv_store.create(key.as_str(), bytes.into()).await {
            Ok(_) => {
                info!("Created default controls for child {}", child_id);
                Ok(defaults)
            }
            Err(e) => {
                // Someone else created it in between.
                debug!("Default controls create raced for {}: {}", key, e);
                self.get_json::<ControlPolicy>(&key)
                    .await?
                    .ok_or_else(|| StoreError::Backend(format!("KV create failed: {}", e)))
            }
        }
    }

    async fn block_app(&self, app: &BlockedApp) -> StoreResult<()> {
        self.put_json(&blocked_key(&app.child_id, &app.package_name), app)
            .await?;
        Ok(())
    }

    async fn unblock_app(&self, child_id: &str, package_name: &str) -> StoreResult<bool> {
        let key = blocked_key(child_id, package_name);
        if self.get_json::<BlockedApp>(&key).await?.is_none() {
            return Ok(false);
        }
        self.delete_key(&key).await?;
        Ok(true)
    }

    async fn record_session(&self, session: &ScreenTimeSession) -> StoreResult<()> {
        self.put_json(&session_key(&session.user_id, &session.id), session)
            .await?;
        Ok(())
    }
}
