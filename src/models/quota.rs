use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// The subject a quota or usage record accounts against: a user or one of
/// their API keys, tagged so the two id spaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    User,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: Uuid,
}

impl Scope {
    pub fn user(id: Uuid) -> Self {
        Self { kind: ScopeKind::User, id }
    }

    pub fn api_key(id: Uuid) -> Self {
        Self { kind: ScopeKind::ApiKey, id }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScopeKind::User => write!(f, "user:{}", self.id),
            ScopeKind::ApiKey => write!(f, "api_key:{}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    Requests,
    Tokens,
    Cost,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Requests => "requests",
            QuotaType::Tokens => "tokens",
            QuotaType::Cost => "cost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Minute,
    Hour,
    Day,
    Month,
    /// Hard running cap, never resets.
    None,
}

/// The half-open interval `[start, end)` a periodic quota accounts against.
/// `QuotaPeriod::None` maps to the unbounded window `(None, None)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Window {
    pub const UNBOUNDED: Window = Window { start: None, end: None };

    /// Stable cache-key fragment for this window.
    pub fn period_key(&self) -> String {
        match self.start {
            Some(start) => start.timestamp().to_string(),
            None => "none".to_string(),
        }
    }
}

impl QuotaPeriod {
    /// Minimal aligned window containing `now`. Windows are computed in UTC
    /// so that every gateway replica derives identical keys.
    pub fn window_at(&self, now: DateTime<Utc>) -> Window {
        let start = match self {
            QuotaPeriod::Minute => now.with_second(0).and_then(|t| t.with_nanosecond(0)),
            QuotaPeriod::Hour => now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0)),
            QuotaPeriod::Day => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single(),
            QuotaPeriod::Month => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single(),
            QuotaPeriod::None => return Window::UNBOUNDED,
        };
        let start = match start {
            Some(start) => start,
            None => return Window::UNBOUNDED,
        };
        let end = match self {
            QuotaPeriod::Minute => start + Duration::minutes(1),
            QuotaPeriod::Hour => start + Duration::hours(1),
            QuotaPeriod::Day => start + Duration::days(1),
            QuotaPeriod::Month => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() {
                    Some(end) => end,
                    None => return Window::UNBOUNDED,
                }
            }
            QuotaPeriod::None => unreachable!(),
        };
        Window { start: Some(start), end: Some(end) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Quota {
    pub id: Uuid,
    pub scope_kind: ScopeKind,
    pub scope_id: Uuid,
    pub quota_type: QuotaType,
    pub period: QuotaPeriod,
    pub limit_value: Decimal,
    pub status: QuotaStatus,
    pub created_at: DateTime<Utc>,
}

impl Quota {
    pub fn scope(&self) -> Scope {
        Scope { kind: self.scope_kind, id: self.scope_id }
    }

    pub fn is_active(&self) -> bool {
        self.status == QuotaStatus::Active
    }
}

/// One accounting row per `(scope, quota, window)`. For periodic quotas the
/// window columns are set; for running caps they are null.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaUsage {
    pub id: Uuid,
    pub scope_kind: ScopeKind,
    pub scope_id: Uuid,
    pub quota_id: Uuid,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub used_value: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn minute_window_truncates() {
        let w = QuotaPeriod::Minute.window_at(at(2024, 3, 15, 10, 42, 37));
        assert_eq!(w.start, Some(at(2024, 3, 15, 10, 42, 0)));
        assert_eq!(w.end, Some(at(2024, 3, 15, 10, 43, 0)));
    }

    #[test]
    fn hour_window_truncates() {
        let w = QuotaPeriod::Hour.window_at(at(2024, 3, 15, 10, 42, 37));
        assert_eq!(w.start, Some(at(2024, 3, 15, 10, 0, 0)));
        assert_eq!(w.end, Some(at(2024, 3, 15, 11, 0, 0)));
    }

    #[test]
    fn day_window_is_midnight_to_midnight() {
        let w = QuotaPeriod::Day.window_at(at(2024, 3, 15, 23, 59, 59));
        assert_eq!(w.start, Some(at(2024, 3, 15, 0, 0, 0)));
        assert_eq!(w.end, Some(at(2024, 3, 16, 0, 0, 0)));
    }

    #[test]
    fn month_window_handles_december_rollover() {
        let w = QuotaPeriod::Month.window_at(at(2024, 12, 31, 12, 0, 0));
        assert_eq!(w.start, Some(at(2024, 12, 1, 0, 0, 0)));
        assert_eq!(w.end, Some(at(2025, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn none_period_is_unbounded() {
        let w = QuotaPeriod::None.window_at(Utc::now());
        assert_eq!(w, Window::UNBOUNDED);
        assert_eq!(w.period_key(), "none");
    }

    #[test]
    fn window_contains_now() {
        let now = at(2024, 6, 1, 0, 0, 0);
        for period in [
            QuotaPeriod::Minute,
            QuotaPeriod::Hour,
            QuotaPeriod::Day,
            QuotaPeriod::Month,
        ] {
            let w = period.window_at(now);
            assert!(w.start.unwrap() <= now, "{period:?}");
            assert!(now < w.end.unwrap(), "{period:?}");
        }
    }

    #[test]
    fn scope_display_is_tagged() {
        let id = Uuid::nil();
        assert_eq!(Scope::user(id).to_string(), format!("user:{id}"));
        assert_eq!(Scope::api_key(id).to_string(), format!("api_key:{id}"));
    }
}
