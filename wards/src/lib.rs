//! Parental control gating for app-open intents

pub mod policy;
pub mod schedule;

pub use policy::{
    first_match, ControlDecision, ControlPolicyEvaluator, Facts, ReasonCode, ScreenTimeSummary,
    OPEN_ACTION, RULES,
};
pub use schedule::{parse_hhmm, parse_timezone, LocalCalendar, TimeWindow, WindowKind};
