//! Relative time intervals used for age-based pruning.

use crate::errors::IntervalError;
use chrono::{DateTime, Months, TimeDelta, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unit of an [`Interval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    /// Seconds
    Seconds,
    /// Minutes
    Minutes,
    /// Hours
    Hours,
    /// Days
    Days,
    /// Calendar months
    Months,
    /// Calendar years
    Years,
}

impl IntervalUnit {
    fn name(self, amount: u64) -> &'static str {
        let plural = self.plural();
        if amount == 1 {
            plural.strip_suffix('s').unwrap_or(plural)
        } else {
            plural
        }
    }

    fn plural(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Months => "months",
            Self::Years => "years",
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = s.to_ascii_lowercase();
        let unit = unit.strip_suffix('s').unwrap_or(&unit);
        match unit {
            "second" => Ok(Self::Seconds),
            "minute" => Ok(Self::Minutes),
            "hour" => Ok(Self::Hours),
            "day" => Ok(Self::Days),
            "month" => Ok(Self::Months),
            "year" => Ok(Self::Years),
            _ => Err(IntervalError::UnknownUnit(s.to_owned())),
        }
    }
}

/// A relative interval reaching into the past, such as "1 day" or "3 months".
///
/// Intervals parse from the same modifier syntax SQLite's date functions
/// accept (`"-1 day"`, `"3 months"`, `"12 hours"`). A leading `-` is optional.
/// A leading `+` is rejected, since in SQLite it would move the cutoff into
/// the future and match every job.
///
/// Month and year intervals are calendar-aware, so `Interval::months(1)`
/// taken from March 31st lands on the last day of February.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    amount: u64,
    unit: IntervalUnit,
}

impl Interval {
    /// Create an interval of `amount` units.
    pub const fn new(amount: u64, unit: IntervalUnit) -> Self {
        Self { amount, unit }
    }

    /// An interval of whole seconds.
    pub const fn seconds(amount: u64) -> Self {
        Self::new(amount, IntervalUnit::Seconds)
    }

    /// An interval of whole minutes.
    pub const fn minutes(amount: u64) -> Self {
        Self::new(amount, IntervalUnit::Minutes)
    }

    /// An interval of whole hours.
    pub const fn hours(amount: u64) -> Self {
        Self::new(amount, IntervalUnit::Hours)
    }

    /// An interval of whole days.
    pub const fn days(amount: u64) -> Self {
        Self::new(amount, IntervalUnit::Days)
    }

    /// An interval of calendar months.
    pub const fn months(amount: u64) -> Self {
        Self::new(amount, IntervalUnit::Months)
    }

    /// An interval of calendar years.
    pub const fn years(amount: u64) -> Self {
        Self::new(amount, IntervalUnit::Years)
    }

    /// Number of units in this interval.
    pub const fn amount(&self) -> u64 {
        self.amount
    }

    /// Unit of this interval.
    pub const fn unit(&self) -> IntervalUnit {
        self.unit
    }

    /// The instant that lies this interval before `now`.
    ///
    /// Returns `None` if the result is outside the range chrono can represent.
    pub fn before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let amount = i64::try_from(self.amount).ok()?;
        match self.unit {
            IntervalUnit::Seconds => now.checked_sub_signed(TimeDelta::try_seconds(amount)?),
            IntervalUnit::Minutes => now.checked_sub_signed(TimeDelta::try_minutes(amount)?),
            IntervalUnit::Hours => now.checked_sub_signed(TimeDelta::try_hours(amount)?),
            IntervalUnit::Days => now.checked_sub_signed(TimeDelta::try_days(amount)?),
            IntervalUnit::Months => {
                let months = u32::try_from(self.amount).ok()?;
                now.checked_sub_months(Months::new(months))
            }
            IntervalUnit::Years => {
                let months = u32::try_from(self.amount.checked_mul(12)?).ok()?;
                now.checked_sub_months(Months::new(months))
            }
        }
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::seconds(duration.as_secs())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{} {}", self.amount, self.unit.name(self.amount))
    }
}

impl FromStr for Interval {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IntervalError::Empty);
        }

        if s.starts_with('+') {
            return Err(IntervalError::FutureOffset(s.to_owned()));
        }

        let unsigned = s.strip_prefix('-').unwrap_or(s).trim_start();
        let split = unsigned
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(unsigned.len());
        let (amount, unit) = unsigned.split_at(split);

        let amount = amount
            .parse::<u64>()
            .map_err(|_| IntervalError::InvalidAmount(amount.to_owned()))?;

        let unit = unit.trim();
        if unit.is_empty() {
            return Err(IntervalError::UnknownUnit(String::new()));
        }

        Ok(Self::new(amount, unit.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_sqlite_style_modifiers() {
        assert_eq!("-1 day".parse::<Interval>(), Ok(Interval::days(1)));
        assert_eq!("3 months".parse::<Interval>(), Ok(Interval::months(3)));
        assert_eq!("12 HOURS".parse::<Interval>(), Ok(Interval::hours(12)));
        assert_eq!("  30 second ".parse::<Interval>(), Ok(Interval::seconds(30)));
        assert_eq!("-2 years".parse::<Interval>(), Ok(Interval::years(2)));
        assert_eq!("5minutes".parse::<Interval>(), Ok(Interval::minutes(5)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!("".parse::<Interval>(), Err(IntervalError::Empty));
        assert_eq!(
            "day".parse::<Interval>(),
            Err(IntervalError::InvalidAmount(String::new()))
        );
        assert_eq!(
            "1.5 days".parse::<Interval>(),
            Err(IntervalError::UnknownUnit(".5 days".into()))
        );
        assert_eq!(
            "4 fortnights".parse::<Interval>(),
            Err(IntervalError::UnknownUnit("fortnights".into()))
        );
        assert_eq!(
            "7".parse::<Interval>(),
            Err(IntervalError::UnknownUnit(String::new()))
        );
    }

    #[test]
    fn rejects_offsets_into_the_future() {
        assert_eq!(
            "+1 day".parse::<Interval>(),
            Err(IntervalError::FutureOffset("+1 day".into()))
        );
        assert_eq!(
            " +3 months".parse::<Interval>(),
            Err(IntervalError::FutureOffset("+3 months".into()))
        );
        assert_eq!("- 1 day".parse::<Interval>(), Ok(Interval::days(1)));
    }

    #[test]
    fn display_uses_modifier_syntax() {
        assert_eq!(Interval::days(1).to_string(), "-1 day");
        assert_eq!(Interval::days(2).to_string(), "-2 days");
        assert_eq!(Interval::seconds(0).to_string(), "-0 seconds");
        assert_eq!(
            Interval::years(1).to_string().parse::<Interval>(),
            Ok(Interval::years(1))
        );
        assert_eq!(
            Interval::months(3).to_string().parse::<Interval>(),
            Ok(Interval::months(3))
        );
    }

    #[test]
    fn before_subtracts_fixed_units() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(
            Interval::days(1).before(now),
            Some(Utc.with_ymd_and_hms(2024, 6, 14, 12, 0, 0).unwrap())
        );
        assert_eq!(
            Interval::minutes(90).before(now),
            Some(Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn before_is_calendar_aware_for_months() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        assert_eq!(
            Interval::months(1).before(now),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap())
        );
        assert_eq!(
            Interval::years(1).before(now),
            Some(Utc.with_ymd_and_hms(2023, 3, 31, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn before_returns_none_on_overflow() {
        let now = Utc::now();
        assert_eq!(Interval::seconds(u64::MAX).before(now), None);
        assert_eq!(Interval::years(1_000_000_000).before(now), None);
    }

    #[test]
    fn converts_from_std_duration() {
        assert_eq!(
            Interval::from(Duration::from_millis(2_500)),
            Interval::seconds(2)
        );
    }
}
