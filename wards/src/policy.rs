use haven_domain::model::{new_record_id, ControlPolicy, ScreenTimeAlert, DEFAULT_SCREEN_TIME_LIMIT};
use haven_domain::{Clock, ControlStore, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::schedule::{Hhmm, LocalCalendar, TimeWindow};

/// The only action that records a restriction alert when denied.
pub const OPEN_ACTION: &str = "open";

/// Why an app-open was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    AppBlocked,
    ScreenTimeExceeded,
    SchoolMode,
    BedtimeMode,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::AppBlocked => "app_blocked",
            ReasonCode::ScreenTimeExceeded => "screen_time_exceeded",
            ReasonCode::SchoolMode => "school_mode",
            ReasonCode::BedtimeMode => "bedtime_mode",
        }
    }

    pub fn alert_message(&self, app_package: &str) -> String {
        match self {
            ReasonCode::AppBlocked => format!("{} is blocked", app_package),
            ReasonCode::ScreenTimeExceeded => "Screen time limit exceeded".to_string(),
            ReasonCode::SchoolMode => "School mode is active".to_string(),
            ReasonCode::BedtimeMode => "Bedtime mode is active".to_string(),
        }
    }
}

/// Everything the rules look at, gathered before any rule runs
#[derive(Debug, Clone)]
pub struct Facts<'a> {
    pub app_blocked: bool,
    pub minutes_used: u32,
    pub limit: u32,
    pub now: Hhmm,
    pub policy: Option<&'a ControlPolicy>,
}

fn app_blocked(f: &Facts<'_>) -> bool {
    f.app_blocked
}

fn screen_time_exceeded(f: &Facts<'_>) -> bool {
    f.minutes_used >= f.limit
}

fn school_mode(f: &Facts<'_>) -> bool {
    f.policy.is_some_and(|p| {
        p.school_mode_enabled
            && TimeWindow::school(p.school_mode_start.as_deref(), p.school_mode_end.as_deref())
                .contains(f.now)
    })
}

fn bedtime_mode(f: &Facts<'_>) -> bool {
    f.policy.is_some_and(|p| {
        p.bedtime_mode_enabled
            && TimeWindow::bedtime(p.bedtime_start.as_deref(), p.bedtime_end.as_deref())
                .contains(f.now)
    })
}

pub type Rule = (ReasonCode, fn(&Facts<'_>) -> bool);

/// Restrictions in precedence order; the first match is the reported reason.
pub const RULES: &[Rule] = &[
    (ReasonCode::AppBlocked, app_blocked),
    (ReasonCode::ScreenTimeExceeded, screen_time_exceeded),
    (ReasonCode::SchoolMode, school_mode),
    (ReasonCode::BedtimeMode, bedtime_mode),
];

pub fn first_match(facts: &Facts<'_>) -> Option<ReasonCode> {
    RULES
        .iter()
        .find(|(_, applies)| applies(facts))
        .map(|(reason, _)| *reason)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenTimeSummary {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

impl ScreenTimeSummary {
    pub fn new(used: u32, limit: u32) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlDecision {
    pub allowed: bool,
    pub reason: Option<ReasonCode>,
    pub screen_time: ScreenTimeSummary,
}

/// Gates app-open intents against a child's parental control settings.
#[derive(Clone)]
pub struct ControlPolicyEvaluator {
    store: Arc<dyn ControlStore>,
    clock: Arc<dyn Clock>,
    calendar: LocalCalendar,
}

impl ControlPolicyEvaluator {
    pub fn new(store: Arc<dyn ControlStore>, clock: Arc<dyn Clock>, calendar: LocalCalendar) -> Self {
        Self {
            store,
            clock,
            calendar,
        }
    }

    pub async fn evaluate(
        &self,
        subject: &str,
        app_package: &str,
        action: &str,
    ) -> Result<ControlDecision> {
        if subject.trim().is_empty() {
            return Err(Error::Authentication("missing subject identity".to_string()));
        }
        if app_package.trim().is_empty() {
            return Err(Error::Validation("appPackageName is required".to_string()));
        }

        info!(
            "Checking parental controls for user {}, app: {}, action: {}",
            subject, app_package, action
        );

        let policy = self.store.control_policy(subject).await?;
        let blocked = self.store.is_app_blocked(subject, app_package).await?;

        let now = self.clock.now();
        let used = self
            .store
            .minutes_used_since(subject, self.calendar.day_start(now))
            .await?;
        let limit = policy
            .as_ref()
            .map(ControlPolicy::effective_limit)
            .unwrap_or(DEFAULT_SCREEN_TIME_LIMIT);

        let facts = Facts {
            app_blocked: blocked,
            minutes_used: used,
            limit,
            now: self.calendar.hhmm_at(now),
            policy: policy.as_ref(),
        };
        debug!(?facts, "Evaluating control rules");
        let reason = first_match(&facts);

        if let Some(reason) = reason {
            info!("Denied {} for user {}: {}", app_package, subject, reason.as_str());
            if action == OPEN_ACTION {
                let alert = ScreenTimeAlert {
                    id: new_record_id(),
                    user_id: subject.to_string(),
                    alert_type: "restriction".to_string(),
                    message: reason.alert_message(app_package),
                    is_read: false,
                    created_at: now,
                };
                self.store
                    .insert_screen_time_alert(&alert)
                    .await
                    .map_err(|e| {
                        error!("Failed to insert screen time alert: {}", e);
                        Error::from(e)
                    })?;
            }
        }

        Ok(ControlDecision {
            allowed: reason.is_none(),
            reason,
            screen_time: ScreenTimeSummary::new(used, limit),
        })
    }
}
