use chrono::{DateTime, Utc};
use haven_domain::model::{
    new_record_id, EventKind, GeofenceAlert, GeofenceEvent, SafeZone, ZoneResidency, ZoneState,
};
use haven_domain::store::latest_event_per_zone;
use haven_domain::{Clock, Error, GeofenceStore, Result, StoreError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::geometry::{distance_meters, within_radius, Coordinate};

/// Records created by one evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeofenceOutcome {
    pub zones_checked: usize,
    pub events: Vec<GeofenceEvent>,
    pub alerts: Vec<GeofenceAlert>,
}

/// Decide the transition for one zone, if any.
pub fn transition(was_inside: bool, is_inside: bool) -> Option<EventKind> {
    match (was_inside, is_inside) {
        (false, true) => Some(EventKind::Entry),
        (true, false) => Some(EventKind::Exit),
        _ => None,
    }
}

fn notifies(zone: &SafeZone, kind: EventKind) -> bool {
    match kind {
        EventKind::Entry => zone.notify_on_entry,
        EventKind::Exit => zone.notify_on_exit,
    }
}

fn alert_message(zone: &SafeZone, kind: EventKind) -> String {
    match kind {
        EventKind::Entry => format!("Child entered {}", zone.name),
        EventKind::Exit => format!("Child left {}", zone.name),
    }
}

/// A residency write made during this evaluation, kept so it can be undone.
struct Claim {
    previous: ZoneResidency,
    revision: u64,
    event_id: String,
}

/// Detects safe zone entries and exits for a stream of location samples.
///
/// Each zone's last known state comes from its residency record when one
/// exists, otherwise from the most recent event (no event means outside).
/// A transition is only emitted after the residency record has been claimed
/// with a conditional write, so two concurrent samples cannot both emit it.
#[derive(Clone)]
pub struct GeofenceEvaluator {
    store: Arc<dyn GeofenceStore>,
    clock: Arc<dyn Clock>,
}

impl GeofenceEvaluator {
    pub fn new(store: Arc<dyn GeofenceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn evaluate(
        &self,
        subject: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<GeofenceOutcome> {
        if subject.trim().is_empty() {
            return Err(Error::Authentication("missing subject identity".to_string()));
        }
        let sample = Coordinate::new(latitude, longitude);
        if !sample.is_valid() {
            return Err(Error::Validation(format!(
                "Invalid coordinates: latitude {} longitude {}",
                latitude, longitude
            )));
        }

        info!(
            "Checking geofences for user {} at location: {}, {}",
            subject, latitude, longitude
        );

        let zones = self.store.active_zones(subject).await?;
        if zones.is_empty() {
            debug!("No active safe zones for user {}", subject);
            return Ok(GeofenceOutcome::default());
        }

        let residencies = self.store.residencies(subject).await?;
        let latest = latest_event_per_zone(self.store.events_newest_first(subject).await?);
        let now = self.clock.now();

        let mut claims = Vec::new();
        let mut events = Vec::new();
        let mut alerts = Vec::new();

        for zone in &zones {
            let center = Coordinate::new(zone.latitude, zone.longitude);
            let distance = distance_meters(sample, center);
            let is_inside = within_radius(sample, center, zone.radius_meters);

            let (was_inside, revision) = match residencies.get(&zone.id) {
                Some(record) => (record.value.state.is_inside(), Some(record.revision)),
                None => (
                    latest
                        .get(&zone.id)
                        .map(|e| e.event_type == EventKind::Entry)
                        .unwrap_or(false),
                    None,
                ),
            };

            debug!(
                zone_id = %zone.id,
                distance_m = distance,
                radius_m = zone.radius_meters,
                is_inside,
                was_inside,
                "Zone classified"
            );

            let Some(kind) = transition(was_inside, is_inside) else {
                continue;
            };

            let next = ZoneResidency {
                user_id: subject.to_string(),
                safe_zone_id: zone.id.clone(),
                state: ZoneState::from_inside(is_inside),
                updated_at: now,
            };
            let claimed = match self.store.swap_residency(&next, revision).await {
                Ok(claimed) => claimed,
                Err(StoreError::Conflict { key }) => {
                    warn!(
                        "Residency for {} changed concurrently; skipping {} for zone {}",
                        key, kind, zone.name
                    );
                    continue;
                }
                Err(e) => {
                    error!("Failed to record residency for zone {}: {}", zone.id, e);
                    self.release(claims).await;
                    return Err(e.into());
                }
            };
            let event = build_event(zone, subject, kind, sample, now);
            claims.push(Claim {
                previous: ZoneResidency {
                    state: ZoneState::from_inside(was_inside),
                    ..next
                },
                revision: claimed,
                event_id: event.id.clone(),
            });

            info!("{} detected for zone {}", kind, zone.name);
            events.push(event);
            if notifies(zone, kind) {
                alerts.push(build_alert(zone, kind, now));
            }
        }

        if !events.is_empty() {
            if let Err(e) = self.store.insert_events(&events).await {
                error!("Failed to insert {} geofence events: {}", events.len(), e);
                let unrecorded = self.unrecorded(subject, claims).await;
                self.release(unrecorded).await;
                return Err(e.into());
            }
        }

        if !alerts.is_empty() {
            // Events are already durable at this point and stay authoritative.
            self.store.insert_alerts(&alerts).await.map_err(|e| {
                error!("Failed to insert {} geofence alerts: {}", alerts.len(), e);
                Error::from(e)
            })?;
        }

        Ok(GeofenceOutcome {
            zones_checked: zones.len(),
            events,
            alerts,
        })
    }

    /// Claims whose event is missing from the stored history. A partial
    /// insert keeps the claims of the events that landed.
    async fn unrecorded(&self, subject: &str, claims: Vec<Claim>) -> Vec<Claim> {
        match self.store.events_newest_first(subject).await {
            Ok(stored) => {
                let landed: HashSet<String> = stored.into_iter().map(|e| e.id).collect();
                claims
                    .into_iter()
                    .filter(|c| !landed.contains(&c.event_id))
                    .collect()
            }
            Err(e) => {
                warn!(
                    "Could not re-read events for {} after failed insert: {}",
                    subject, e
                );
                claims
            }
        }
    }

    /// Best-effort revert of residency claims whose events never landed.
    async fn release(&self, claims: Vec<Claim>) {
        for claim in claims {
            if let Err(e) = self
                .store
                .swap_residency(&claim.previous, Some(claim.revision))
                .await
            {
                warn!(
                    "Could not revert residency for {}/{}: {}",
                    claim.previous.user_id, claim.previous.safe_zone_id, e
                );
            }
        }
    }
}

fn build_event(
    zone: &SafeZone,
    subject: &str,
    kind: EventKind,
    sample: Coordinate,
    now: DateTime<Utc>,
) -> GeofenceEvent {
    GeofenceEvent {
        id: new_record_id(),
        safe_zone_id: zone.id.clone(),
        user_id: subject.to_string(),
        event_type: kind,
        location_latitude: sample.latitude,
        location_longitude: sample.longitude,
        created_at: now,
    }
}

fn build_alert(zone: &SafeZone, kind: EventKind, now: DateTime<Utc>) -> GeofenceAlert {
    GeofenceAlert {
        id: new_record_id(),
        parent_id: zone.parent_id.clone(),
        child_id: zone.child_id.clone(),
        safe_zone_id: zone.id.clone(),
        event_type: kind,
        message: alert_message(zone, kind),
        is_read: false,
        created_at: now,
    }
}
