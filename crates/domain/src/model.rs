//! Persisted records shared by the evaluators and the stores.
//!
//! Field names follow the column names the mobile app writes, so records
//! round-trip through any JSON-backed store unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

pub type ZoneId = String;
pub type SubjectId = String;

/// Default daily screen-time allowance when a policy leaves it unset.
pub const DEFAULT_SCREEN_TIME_LIMIT: u32 = 300;

/// Generate a fresh record identifier.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Entry or exit across a safe zone boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Entry => write!(f, "entry"),
            EventKind::Exit => write!(f, "exit"),
        }
    }
}

/// Circular region watched for a single child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeZone {
    pub id: ZoneId,
    pub parent_id: String,
    pub child_id: SubjectId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub notify_on_entry: bool,
    #[serde(default = "default_true")]
    pub notify_on_exit: bool,
}

impl SafeZone {
    /// Reject zones that would break distance classification.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(StoreError::InvalidRecord(format!(
                "zone {} radius must be positive, got {}",
                self.id, self.radius_meters
            )));
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(StoreError::InvalidRecord(format!(
                "zone {} latitude out of range: {}",
                self.id, self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(StoreError::InvalidRecord(format!(
                "zone {} longitude out of range: {}",
                self.id, self.longitude
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Durable record of a boundary crossing. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub id: String,
    pub safe_zone_id: ZoneId,
    pub user_id: SubjectId,
    pub event_type: EventKind,
    pub location_latitude: f64,
    pub location_longitude: f64,
    pub created_at: DateTime<Utc>,
}

/// Parent-facing notification derived from a [`GeofenceEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceAlert {
    pub id: String,
    pub parent_id: String,
    pub child_id: SubjectId,
    pub safe_zone_id: ZoneId,
    pub event_type: EventKind,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Where a subject currently is relative to one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    Inside,
    Outside,
}

impl ZoneState {
    pub fn from_inside(inside: bool) -> Self {
        if inside {
            ZoneState::Inside
        } else {
            ZoneState::Outside
        }
    }

    pub fn is_inside(self) -> bool {
        self == ZoneState::Inside
    }
}

/// Explicit per (subject, zone) state, replaced only by compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneResidency {
    pub user_id: SubjectId,
    pub safe_zone_id: ZoneId,
    pub state: ZoneState,
    pub updated_at: DateTime<Utc>,
}

/// Value paired with the store revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

/// Parental control settings for one (parent, child) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPolicy {
    pub id: String,
    pub parent_id: String,
    pub child_id: SubjectId,
    #[serde(default)]
    pub screen_time_limit: Option<u32>,
    #[serde(default)]
    pub school_mode_enabled: bool,
    #[serde(default)]
    pub school_mode_start: Option<String>,
    #[serde(default)]
    pub school_mode_end: Option<String>,
    #[serde(default)]
    pub bedtime_mode_enabled: bool,
    #[serde(default)]
    pub bedtime_start: Option<String>,
    #[serde(default)]
    pub bedtime_end: Option<String>,
    #[serde(default = "default_true")]
    pub location_tracking_enabled: bool,
}

impl ControlPolicy {
    /// Settings a parent gets before changing anything.
    pub fn with_defaults(parent_id: &str, child_id: &str) -> Self {
        Self {
            id: new_record_id(),
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            screen_time_limit: Some(DEFAULT_SCREEN_TIME_LIMIT),
            school_mode_enabled: false,
            school_mode_start: None,
            school_mode_end: None,
            bedtime_mode_enabled: false,
            bedtime_start: None,
            bedtime_end: None,
            location_tracking_enabled: true,
        }
    }

    /// Daily limit in minutes; unset and zero both fall back to the default.
    pub fn effective_limit(&self) -> u32 {
        match self.screen_time_limit {
            Some(limit) if limit > 0 => limit,
            _ => DEFAULT_SCREEN_TIME_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedApp {
    pub id: String,
    pub parent_id: String,
    pub child_id: SubjectId,
    pub app_name: String,
    pub package_name: String,
    #[serde(default = "default_true")]
    pub is_blocked: bool,
    pub blocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenTimeSession {
    pub id: String,
    pub user_id: SubjectId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenTimeAlert {
    pub id: String,
    pub user_id: SubjectId,
    pub alert_type: String,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
