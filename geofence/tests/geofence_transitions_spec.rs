//! Transition behavior of the geofence evaluator over the in-memory store

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use haven_domain::model::{
    EventKind, GeofenceAlert, GeofenceEvent, SafeZone, Versioned, ZoneId, ZoneResidency,
    ZoneState,
};
use haven_domain::{
    AdminStore, Error, FixedClock, GeofenceStore, InMemoryStore, StoreError, StoreResult,
};
use haven_geofence::{distance_meters, Coordinate, GeofenceEvaluator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const CHILD: &str = "child-1";

fn school_zone() -> SafeZone {
    SafeZone {
        id: "zone-school".to_string(),
        parent_id: "parent-1".to_string(),
        child_id: CHILD.to_string(),
        name: "School".to_string(),
        latitude: 12.0022,
        longitude: 8.5919,
        radius_meters: 150.0,
        is_active: true,
        notify_on_entry: true,
        notify_on_exit: true,
    }
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 9, 2, 7, 45, 0).unwrap(),
    ))
}

async fn setup(zones: &[SafeZone]) -> Result<(InMemoryStore, Arc<FixedClock>, GeofenceEvaluator)> {
    let store = InMemoryStore::new();
    for zone in zones {
        store.put_zone(zone).await?;
    }
    let clock = clock();
    let evaluator = GeofenceEvaluator::new(Arc::new(store.clone()), clock.clone());
    Ok((store, clock, evaluator))
}

#[tokio::test]
async fn given_no_zones_when_evaluated_then_returns_empty_outcome() -> Result<()> {
    let (store, _, evaluator) = setup(&[]).await?;

    let outcome = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;

    assert!(outcome.events.is_empty());
    assert!(outcome.alerts.is_empty());
    assert_eq!(outcome.zones_checked, 0);
    assert!(store.events().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_school_zone_when_child_arrives_leaves_and_stays_away_then_events_follow() -> Result<()> {
    let (store, clock, evaluator) = setup(&[school_zone()]).await?;

    // Sample 1: at the center
    let first = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].event_type, EventKind::Entry);
    assert_eq!(first.alerts.len(), 1);
    assert_eq!(first.alerts[0].message, "Child entered School");
    assert_eq!(first.alerts[0].parent_id, "parent-1");
    assert!(!first.alerts[0].is_read);

    // Sample 2: about 1.2 km away
    clock.advance(chrono::Duration::minutes(5));
    let second = evaluator.evaluate(CHILD, 12.01, 8.60).await?;
    assert_eq!(second.events.len(), 1);
    assert_eq!(second.events[0].event_type, EventKind::Exit);
    assert_eq!(second.alerts.len(), 1);
    assert_eq!(second.alerts[0].message, "Child left School");

    // Sample 3: same place again
    clock.advance(chrono::Duration::minutes(5));
    let third = evaluator.evaluate(CHILD, 12.01, 8.60).await?;
    assert!(third.events.is_empty());
    assert!(third.alerts.is_empty());

    assert_eq!(store.events().await.len(), 2);
    assert_eq!(store.alerts().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn given_sample_exactly_on_boundary_when_evaluated_then_entry_is_emitted() -> Result<()> {
    let sample = Coordinate::new(12.0032, 8.5919);
    let center = Coordinate::new(12.0022, 8.5919);
    let mut zone = school_zone();
    zone.radius_meters = distance_meters(sample, center);
    let (_, _, evaluator) = setup(&[zone]).await?;

    let outcome = evaluator
        .evaluate(CHILD, sample.latitude, sample.longitude)
        .await?;

    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].event_type, EventKind::Entry);
    Ok(())
}

#[tokio::test]
async fn given_sample_just_beyond_boundary_when_evaluated_then_no_event() -> Result<()> {
    let sample = Coordinate::new(12.0032, 8.5919);
    let center = Coordinate::new(12.0022, 8.5919);
    let mut zone = school_zone();
    zone.radius_meters = distance_meters(sample, center) - 1e-6;
    let (store, _, evaluator) = setup(&[zone]).await?;

    let outcome = evaluator
        .evaluate(CHILD, sample.latitude, sample.longitude)
        .await?;

    assert!(outcome.events.is_empty());
    assert!(store.events().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_no_history_when_sample_is_outside_then_no_exit_is_emitted() -> Result<()> {
    let (store, _, evaluator) = setup(&[school_zone()]).await?;

    let outcome = evaluator.evaluate(CHILD, 12.5, 8.5919).await?;

    assert!(outcome.events.is_empty());
    assert!(store.events().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_identical_samples_when_evaluated_twice_then_second_call_is_a_no_op() -> Result<()> {
    let (store, _, evaluator) = setup(&[school_zone()]).await?;

    let first = evaluator.evaluate(CHILD, 12.0023, 8.5920).await?;
    let second = evaluator.evaluate(CHILD, 12.0023, 8.5920).await?;

    assert_eq!(first.events.len(), 1);
    assert!(second.events.is_empty());
    assert_eq!(store.events().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn given_alternating_samples_when_evaluated_then_kinds_strictly_alternate() -> Result<()> {
    let (store, clock, evaluator) = setup(&[school_zone()]).await?;
    let inside = (12.0022, 8.5919);
    let outside = (12.03, 8.5919);
    let samples = [inside, inside, outside, outside, inside, outside, inside, inside];

    for (lat, lon) in samples {
        evaluator.evaluate(CHILD, lat, lon).await?;
        clock.advance(chrono::Duration::seconds(30));
    }

    let kinds: Vec<EventKind> = store.events().await.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Entry,
            EventKind::Exit,
            EventKind::Entry,
            EventKind::Exit,
            EventKind::Entry
        ]
    );
    let events = store.events().await;
    assert!(events.windows(2).all(|w| w[0].created_at < w[1].created_at));
    Ok(())
}

#[tokio::test]
async fn given_notify_flags_off_when_transitions_happen_then_events_without_alerts() -> Result<()> {
    let mut zone = school_zone();
    zone.notify_on_entry = false;
    let (store, _, evaluator) = setup(&[zone]).await?;

    let entry = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert_eq!(entry.events.len(), 1);
    assert!(entry.alerts.is_empty());

    let exit = evaluator.evaluate(CHILD, 12.05, 8.5919).await?;
    assert_eq!(exit.events.len(), 1);
    assert_eq!(exit.alerts.len(), 1);
    assert_eq!(exit.alerts[0].event_type, EventKind::Exit);

    assert_eq!(store.alerts().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn given_overlapping_zones_when_sample_inside_both_then_each_gets_an_entry() -> Result<()> {
    let mut park = school_zone();
    park.id = "zone-park".to_string();
    park.name = "Park".to_string();
    park.radius_meters = 5_000.0;
    let mut far = school_zone();
    far.id = "zone-far".to_string();
    far.latitude = -33.0;
    let (_, _, evaluator) = setup(&[school_zone(), park, far]).await?;

    let outcome = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;

    assert_eq!(outcome.zones_checked, 3);
    let mut zones: Vec<&str> = outcome.events.iter().map(|e| e.safe_zone_id.as_str()).collect();
    zones.sort();
    assert_eq!(zones, vec!["zone-park", "zone-school"]);
    Ok(())
}

#[tokio::test]
async fn given_zone_for_another_child_when_evaluated_then_it_is_ignored() -> Result<()> {
    let mut sibling = school_zone();
    sibling.id = "zone-sibling".to_string();
    sibling.child_id = "child-2".to_string();
    let (_, _, evaluator) = setup(&[sibling]).await?;

    let outcome = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert!(outcome.events.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_invalid_coordinates_when_evaluated_then_validation_error_and_no_writes() -> Result<()> {
    let (store, _, evaluator) = setup(&[school_zone()]).await?;

    for (lat, lon) in [(91.0, 0.0), (0.0, -181.0), (f64::NAN, 8.0), (12.0, f64::INFINITY)] {
        let err = evaluator.evaluate(CHILD, lat, lon).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err:?}");
    }
    assert!(store.events().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_blank_subject_when_evaluated_then_authentication_error() -> Result<()> {
    let (_, _, evaluator) = setup(&[school_zone()]).await?;
    let err = evaluator.evaluate("  ", 12.0, 8.0).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
    Ok(())
}

#[tokio::test]
async fn given_event_history_without_residency_when_evaluated_then_history_decides() -> Result<()> {
    let (store, clock, evaluator) = setup(&[school_zone()]).await?;
    evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    store.clear_residencies().await;
    clock.advance(chrono::Duration::minutes(1));

    // Last event is an entry, so staying inside must not re-fire.
    let stay = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert!(stay.events.is_empty());

    let leave = evaluator.evaluate(CHILD, 12.02, 8.5919).await?;
    assert_eq!(leave.events.len(), 1);
    assert_eq!(leave.events[0].event_type, EventKind::Exit);

    let residency = store.residency(CHILD, "zone-school").await.unwrap();
    assert_eq!(residency.value.state, ZoneState::Outside);
    Ok(())
}

#[tokio::test]
async fn given_residency_that_contradicts_history_when_evaluated_then_residency_wins() -> Result<()> {
    let (store, _, evaluator) = setup(&[school_zone()]).await?;
    store
        .swap_residency(
            &ZoneResidency {
                user_id: CHILD.to_string(),
                safe_zone_id: "zone-school".to_string(),
                state: ZoneState::Inside,
                updated_at: Utc::now(),
            },
            None,
        )
        .await?;

    let outcome = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert!(outcome.events.is_empty());
    Ok(())
}

/// Store wrapper that lets a test interfere with specific writes.
struct FaultyStore {
    inner: InMemoryStore,
    fail_events: AtomicBool,
    partial_events: AtomicBool,
    fail_alerts: AtomicBool,
    race_residency: AtomicBool,
}

impl FaultyStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            fail_events: AtomicBool::new(false),
            partial_events: AtomicBool::new(false),
            fail_alerts: AtomicBool::new(false),
            race_residency: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl GeofenceStore for FaultyStore {
    async fn active_zones(&self, subject: &str) -> StoreResult<Vec<SafeZone>> {
        self.inner.active_zones(subject).await
    }

    async fn events_newest_first(&self, subject: &str) -> StoreResult<Vec<GeofenceEvent>> {
        self.inner.events_newest_first(subject).await
    }

    async fn residencies(
        &self,
        subject: &str,
    ) -> StoreResult<HashMap<ZoneId, Versioned<ZoneResidency>>> {
        self.inner.residencies(subject).await
    }

    async fn swap_residency(
        &self,
        residency: &ZoneResidency,
        expected: Option<u64>,
    ) -> StoreResult<u64> {
        if self.race_residency.swap(false, Ordering::SeqCst) {
            // Another sample claims the same transition first.
            self.inner.swap_residency(residency, expected).await?;
        }
        self.inner.swap_residency(residency, expected).await
    }

    async fn insert_events(&self, events: &[GeofenceEvent]) -> StoreResult<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("events table unavailable".to_string()));
        }
        if self.partial_events.swap(false, Ordering::SeqCst) && events.len() > 1 {
            // First write lands, the rest are lost.
            self.inner.insert_events(&events[..1]).await?;
            return Err(StoreError::Backend("put failed".to_string()));
        }
        self.inner.insert_events(events).await
    }

    async fn insert_alerts(&self, alerts: &[GeofenceAlert]) -> StoreResult<()> {
        if self.fail_alerts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("alerts table unavailable".to_string()));
        }
        self.inner.insert_alerts(alerts).await
    }
}

#[tokio::test]
async fn given_concurrent_claim_when_residency_swap_loses_then_no_duplicate_entry() -> Result<()> {
    let inner = InMemoryStore::new();
    inner.put_zone(&school_zone()).await?;
    let store = Arc::new(FaultyStore::new(inner.clone()));
    store.race_residency.store(true, Ordering::SeqCst);
    let evaluator = GeofenceEvaluator::new(store, clock());

    let outcome = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;

    assert!(outcome.events.is_empty());
    assert!(inner.events().await.is_empty());
    let residency = inner.residency(CHILD, "zone-school").await.unwrap();
    assert_eq!(residency.value.state, ZoneState::Inside);
    Ok(())
}

#[tokio::test]
async fn given_event_write_failure_when_evaluated_then_residency_is_reverted_and_retry_succeeds(
) -> Result<()> {
    let inner = InMemoryStore::new();
    inner.put_zone(&school_zone()).await?;
    let store = Arc::new(FaultyStore::new(inner.clone()));
    store.fail_events.store(true, Ordering::SeqCst);
    let evaluator = GeofenceEvaluator::new(store.clone(), clock());

    let err = evaluator.evaluate(CHILD, 12.0022, 8.5919).await.unwrap_err();
    assert!(matches!(err, Error::Datastore(StoreError::Backend(_))));
    assert!(inner.events().await.is_empty());
    assert!(inner.alerts().await.is_empty());
    let residency = inner.residency(CHILD, "zone-school").await.unwrap();
    assert_eq!(residency.value.state, ZoneState::Outside);

    store.fail_events.store(false, Ordering::SeqCst);
    let retry = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert_eq!(retry.events.len(), 1);
    assert_eq!(retry.events[0].event_type, EventKind::Entry);
    Ok(())
}

#[tokio::test]
async fn given_alert_write_failure_when_evaluated_then_events_persist() -> Result<()> {
    let inner = InMemoryStore::new();
    inner.put_zone(&school_zone()).await?;
    let store = Arc::new(FaultyStore::new(inner.clone()));
    store.fail_alerts.store(true, Ordering::SeqCst);
    let evaluator = GeofenceEvaluator::new(store, clock());

    let err = evaluator.evaluate(CHILD, 12.0022, 8.5919).await.unwrap_err();
    assert!(matches!(err, Error::Datastore(_)));
    assert_eq!(inner.events().await.len(), 1);
    assert!(inner.alerts().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_partial_event_write_when_retried_then_each_zone_has_one_entry() -> Result<()> {
    let mut park = school_zone();
    park.id = "zone-park".to_string();
    park.name = "Park".to_string();
    park.radius_meters = 5_000.0;
    let inner = InMemoryStore::new();
    inner.put_zone(&park).await?;
    inner.put_zone(&school_zone()).await?;
    let store = Arc::new(FaultyStore::new(inner.clone()));
    store.partial_events.store(true, Ordering::SeqCst);
    let evaluator = GeofenceEvaluator::new(store, clock());

    let err = evaluator.evaluate(CHILD, 12.0022, 8.5919).await.unwrap_err();
    assert!(matches!(err, Error::Datastore(StoreError::Backend(_))));
    let landed = inner.events().await;
    assert_eq!(landed.len(), 1);

    // The zone whose event landed keeps its claim; the other was reverted.
    let landed_zone = landed[0].safe_zone_id.clone();
    let kept = inner.residency(CHILD, &landed_zone).await.unwrap();
    assert_eq!(kept.value.state, ZoneState::Inside);

    let retry = evaluator.evaluate(CHILD, 12.0022, 8.5919).await?;
    assert_eq!(retry.events.len(), 1);
    assert_ne!(retry.events[0].safe_zone_id, landed_zone);

    for zone in ["zone-park", "zone-school"] {
        let kinds: Vec<EventKind> = inner
            .events()
            .await
            .iter()
            .filter(|e| e.safe_zone_id == zone)
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![EventKind::Entry], "zone {zone}");
    }
    Ok(())
}
