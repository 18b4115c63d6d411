use chrono::{DateTime, LocalResult, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Time of day as `hour * 100 + minute`, e.g. 22:30 is `2230`.
pub type Hhmm = u32;

/// How a window treats `start > end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// `start <= now <= end`; a reversed range never matches.
    Linear,
    /// `now >= start || now <= end`; a reversed range wraps past midnight.
    Wrapping,
}

/// Inclusive daily window in HHMM form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Hhmm,
    pub end: Hhmm,
    pub kind: WindowKind,
}

impl TimeWindow {
    /// School hours never span midnight.
    pub fn school(start: Option<&str>, end: Option<&str>) -> Self {
        Self {
            start: parse_hhmm(start),
            end: parse_hhmm(end),
            kind: WindowKind::Linear,
        }
    }

    /// Bedtime usually does, e.g. 22:00 to 06:00.
    pub fn bedtime(start: Option<&str>, end: Option<&str>) -> Self {
        Self {
            start: parse_hhmm(start),
            end: parse_hhmm(end),
            kind: WindowKind::Wrapping,
        }
    }

    pub fn contains(&self, now: Hhmm) -> bool {
        match self.kind {
            WindowKind::Linear => now >= self.start && now <= self.end,
            WindowKind::Wrapping => now >= self.start || now <= self.end,
        }
    }
}

/// Parse a stored time-of-day string into HHMM.
///
/// Missing or empty input means `"0"`. The first `:` is dropped and the
/// leading digits are read, so `"08:00"` and `"08:00:00"` both give `800`.
/// Input without leading digits yields `0`.
pub fn parse_hhmm(raw: Option<&str>) -> Hhmm {
    let raw = match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => "0",
    };
    let joined = raw.replacen(':', "", 1);
    let digits: String = joined.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// HHMM for a wall-clock time.
pub fn hhmm_of<T: Timelike>(time: &T) -> Hhmm {
    time.hour() * 100 + time.minute()
}

#[derive(Debug, Clone)]
pub enum ScheduleError {
    InvalidTimezone(String),
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::InvalidTimezone(tz) => write!(f, "Invalid timezone: {}", tz),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Parse an IANA timezone name such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Local wall clock in one timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    tz: Tz,
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self { tz: Tz::UTC }
    }
}

impl LocalCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Local time of day at `now`.
    pub fn hhmm_at(&self, now: DateTime<Utc>) -> Hhmm {
        hhmm_of(&now.with_timezone(&self.tz))
    }

    /// Instant the local calendar day containing `now` began.
    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.with_timezone(&self.tz).date_naive();
        let midnight = date.and_time(NaiveTime::MIN);
        match self.tz.from_local_datetime(&midnight) {
            LocalResult::Single(start) => start.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            // Midnight skipped by a DST jump: the day starts at the first valid minute.
            LocalResult::None => (1..=180)
                .find_map(|m| {
                    self.tz
                        .from_local_datetime(&(midnight + chrono::Duration::minutes(m)))
                        .earliest()
                })
                .map(|start| start.with_timezone(&Utc))
                .unwrap_or(now),
        }
    }
}
