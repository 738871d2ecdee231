use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// How many upcoming firings are inspected when looking for the shortest gap.
pub const INTERVAL_SAMPLES: usize = 64;

/// Timezone a cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Utc,
    /// The host's local zone, including its DST rules.
    Local,
    /// IANA zone such as `Europe/Berlin`.
    Named(Tz),
    Fixed(FixedOffset),
}

impl FromStr for ScheduleZone {
    type Err = String;

    /// Accepts `UTC`, `Z`, `local`, an IANA name, or an offset like `+05:30`,
    /// `-0800`, `+02`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(ScheduleZone::Utc);
        }
        if s.eq_ignore_ascii_case("local") {
            return Ok(ScheduleZone::Local);
        }

        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => {
                return s
                    .parse::<Tz>()
                    .map(ScheduleZone::Named)
                    .map_err(|_| format!("unknown timezone '{s}' (expected UTC, local, an IANA name or +HH:MM)"))
            }
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if !matches!(digits.len(), 2 | 4) || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("malformed offset '{s}'"));
        }
        let hours: i32 = digits[..2].parse().map_err(|_| format!("malformed offset '{s}'"))?;
        let minutes: i32 = if digits.len() == 4 {
            digits[2..].parse().map_err(|_| format!("malformed offset '{s}'"))?
        } else {
            0
        };
        if minutes >= 60 {
            return Err(format!("malformed offset '{s}'"));
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(ScheduleZone::Fixed)
            .ok_or_else(|| format!("offset '{s}' out of range"))
    }
}

impl fmt::Display for ScheduleZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleZone::Utc => f.write_str("UTC"),
            ScheduleZone::Local => f.write_str("local"),
            ScheduleZone::Named(tz) => f.write_str(tz.name()),
            ScheduleZone::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

/// Whether a firing observed at `now` may still run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringCheck {
    OnTime,
    /// Observed later than the skew tolerance allows. Not replayed.
    Missed { late_by: Duration },
}

/// Classify a firing that was due at `scheduled` and observed at `now`.
pub fn check_firing(scheduled: DateTime<Utc>, now: DateTime<Utc>, tolerance: Duration) -> FiringCheck {
    let late_by = now - scheduled;
    if late_by > tolerance {
        FiringCheck::Missed { late_by }
    } else {
        FiringCheck::OnTime
    }
}

/// Cron schedule bound to a timezone.
///
/// Every query is answered from the instant passed in, never from internal
/// state, so wall-clock corrections are picked up on the next call.
#[derive(Debug, Clone)]
pub struct TriggerClock {
    expression: String,
    schedule: Schedule,
    zone: ScheduleZone,
}

impl TriggerClock {
    /// Parse a 5-field (minute first) or 6/7-field (seconds first) expression.
    /// `?` is accepted as a synonym for `*`; numeric weekdays use crontab
    /// numbering (0 or 7 = Sunday).
    pub fn new(expression: &str, zone: ScheduleZone) -> Result<Self> {
        let normalized = normalize(expression)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            zone,
        })
    }

    /// Like [`TriggerClock::new`], with the timezone given as text.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let zone = timezone
            .parse::<ScheduleZone>()
            .map_err(|reason| SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                reason,
            })?;
        Self::new(expression, zone)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// First firing strictly after `after`. `None` only for expressions with
    /// no future firing (e.g. a past year).
    pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.upcoming(after).next()
    }

    /// True when `now` is exactly a firing instant.
    pub fn is_firing_instant(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_time(now - Duration::milliseconds(1)) == Some(now)
    }

    /// Shortest gap between consecutive firings among the next
    /// [`INTERVAL_SAMPLES`] after `from`.
    pub fn min_interval(&self, from: DateTime<Utc>) -> Option<Duration> {
        let firings: Vec<_> = self.upcoming(from).take(INTERVAL_SAMPLES + 1).collect();
        firings.windows(2).map(|w| w[1] - w[0]).min()
    }

    fn upcoming(&self, after: DateTime<Utc>) -> Box<dyn Iterator<Item = DateTime<Utc>> + '_> {
        match self.zone {
            ScheduleZone::Utc => Box::new(self.schedule.after(&after)),
            ScheduleZone::Local => in_zone(&self.schedule, after.with_timezone(&Local)),
            ScheduleZone::Named(tz) => in_zone(&self.schedule, after.with_timezone(&tz)),
            ScheduleZone::Fixed(offset) => in_zone(&self.schedule, after.with_timezone(&offset)),
        }
    }
}

fn in_zone<'a, Z>(schedule: &'a Schedule, after: DateTime<Z>) -> Box<dyn Iterator<Item = DateTime<Utc>> + 'a>
where
    Z: TimeZone + 'a,
{
    Box::new(schedule.after(&after).map(|t| t.with_timezone(&Utc)))
}

/// Bring an expression into the form `cron::Schedule` parses: seconds field
/// present, `?` as `*`, and day-of-week numbers renumbered from crontab
/// (0 or 7 = Sunday, 1 = Monday) to `cron`'s (1 = Sunday, 2 = Monday).
fn normalize(expression: &str) -> Result<String> {
    let mut fields: Vec<String> = expression
        .split_whitespace()
        .map(|f| if f == "?" { "*".to_string() } else { f.to_string() })
        .collect();

    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => {
            return Err(SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                reason: format!("expected 5, 6 or 7 fields, got {n}"),
            })
        }
    }

    fields[5] = renumber_weekdays(&fields[5]).map_err(|reason| SchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        reason,
    })?;
    Ok(fields.join(" "))
}

fn renumber_weekdays(field: &str) -> std::result::Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let with_step = |base: String| match step {
            Some(step) => format!("{base}/{step}"),
            None => base,
        };

        if !base.chars().all(|c| c.is_ascii_digit() || c == '-') || base.is_empty() {
            // `*`, names like MON-FRI
            items.push(item.to_string());
            continue;
        }

        match base.split_once('-') {
            None => items.push(with_step(weekday(base)?.to_string())),
            Some((from, to)) => {
                let (from, to) = (weekday(from)?, weekday(to)?);
                if from <= to {
                    items.push(with_step(format!("{from}-{to}")));
                } else if step.is_none() && to == 1 {
                    // a range ending on Sunday (e.g. 5-7) wraps past Saturday
                    items.push(if from == 7 { "7".to_string() } else { format!("{from}-7") });
                    items.push("1".to_string());
                } else {
                    return Err(format!("day-of-week range '{item}' runs backwards"));
                }
            }
        }
    }
    Ok(items.join(","))
}

fn weekday(n: &str) -> std::result::Result<u8, String> {
    match n.parse::<u8>() {
        Ok(0) | Ok(7) => Ok(1),
        Ok(n @ 1..=6) => Ok(n + 1),
        _ => Err(format!("day-of-week '{n}' is not in 0-7")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn quarter_hour_expression_with_question_mark() {
        let trigger = TriggerClock::parse("0 0/15 * * * ?", "UTC").unwrap();
        assert_eq!(trigger.next_fire_time(at(12, 7, 0)), Some(at(12, 15, 0)));
        // strictly after
        assert_eq!(trigger.next_fire_time(at(12, 15, 0)), Some(at(12, 30, 0)));
        assert_eq!(trigger.next_fire_time(at(12, 59, 59)), Some(at(13, 0, 0)));
    }

    #[test]
    fn five_field_expression_fires_on_the_minute() {
        let trigger = TriggerClock::parse("*/15 * * * *", "UTC").unwrap();
        assert_eq!(trigger.next_fire_time(at(12, 7, 30)), Some(at(12, 15, 0)));
    }

    #[test]
    fn numeric_weekdays_follow_crontab_numbering() {
        // Saturday 2026-03-14
        let saturday = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();
        let monday_9 = Utc.with_ymd_and_hms(2026, 3, 16, 9, 0, 0).unwrap();
        let sunday_9 = Utc.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap();

        let weekdays = TriggerClock::parse("0 9 * * 1-5", "UTC").unwrap();
        assert_eq!(weekdays.next_fire_time(saturday), Some(monday_9));

        for sunday in ["0 9 * * 0", "0 9 * * 7", "0 0 9 ? * 0"] {
            let trigger = TriggerClock::parse(sunday, "UTC").unwrap();
            assert_eq!(trigger.next_fire_time(saturday), Some(sunday_9), "{sunday}");
        }

        let weekend = TriggerClock::parse("0 9 * * 6-7", "UTC").unwrap();
        assert_eq!(weekend.next_fire_time(saturday), Some(sunday_9));

        let names = TriggerClock::parse("0 9 * * MON-FRI", "UTC").unwrap();
        assert_eq!(names.next_fire_time(saturday), Some(monday_9));
    }

    #[test]
    fn weekday_renumbering() {
        assert_eq!(renumber_weekdays("1-5").unwrap(), "2-6");
        assert_eq!(renumber_weekdays("0,3").unwrap(), "1,4");
        assert_eq!(renumber_weekdays("5-7").unwrap(), "6-7,1");
        assert_eq!(renumber_weekdays("6-7").unwrap(), "7,1");
        assert_eq!(renumber_weekdays("1-5/2").unwrap(), "2-6/2");
        assert_eq!(renumber_weekdays("*/2").unwrap(), "*/2");
        assert_eq!(renumber_weekdays("SAT,SUN").unwrap(), "SAT,SUN");
        assert!(renumber_weekdays("8").is_err());
        assert!(renumber_weekdays("5-2").is_err());
    }

    #[test]
    fn next_fire_time_is_monotonic() {
        let trigger = TriggerClock::parse("0 0/15 * * * ?", "UTC").unwrap();
        let mut previous = None;
        for minute in 0..60 {
            let next = trigger.next_fire_time(at(12, minute, 0));
            assert!(next > Some(at(12, minute, 0)));
            assert!(previous <= next);
            previous = next;
        }
    }

    #[test]
    fn fixed_offset_shifts_firings() {
        let trigger = TriggerClock::parse("0 0 9 * * *", "+02:00").unwrap();
        assert_eq!(trigger.next_fire_time(at(5, 0, 0)), Some(at(7, 0, 0)));
        assert_eq!(trigger.zone().to_string(), "+02:00");
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        let trigger = TriggerClock::parse("0 0 9 * * *", "Europe/Berlin").unwrap();
        assert_eq!(trigger.zone().to_string(), "Europe/Berlin");
        // CET in March before the switch, CEST in July
        assert_eq!(trigger.next_fire_time(at(5, 0, 0)), Some(at(8, 0, 0)));
        let july = Utc.with_ymd_and_hms(2026, 7, 10, 5, 0, 0).unwrap();
        assert_eq!(
            trigger.next_fire_time(july),
            Some(Utc.with_ymd_and_hms(2026, 7, 10, 7, 0, 0).unwrap())
        );
    }

    #[test]
    fn firing_instant_detection() {
        let trigger = TriggerClock::parse("0 0/15 * * * ?", "UTC").unwrap();
        assert!(trigger.is_firing_instant(at(12, 45, 0)));
        assert!(!trigger.is_firing_instant(at(12, 45, 1)));
    }

    #[test]
    fn min_interval_of_irregular_schedule() {
        let every_quarter = TriggerClock::parse("0 0/15 * * * ?", "UTC").unwrap();
        assert_eq!(every_quarter.min_interval(at(0, 0, 0)), Some(Duration::minutes(15)));

        let uneven = TriggerClock::parse("0 0,10,40 * * * *", "UTC").unwrap();
        assert_eq!(uneven.min_interval(at(0, 0, 0)), Some(Duration::minutes(10)));
    }

    #[test]
    fn rejects_bad_expressions_and_zones() {
        assert!(matches!(
            TriggerClock::parse("every quarter hour", "UTC"),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
        assert!(TriggerClock::parse("0 61 * * * *", "UTC").is_err());
        assert!(TriggerClock::parse("0 0/15 * * * ?", "Mars/Olympus").is_err());
        assert!(TriggerClock::parse("0 0 9 * * 8", "UTC").is_err());
        assert!("+5".parse::<ScheduleZone>().is_err());
        assert!("+05:75".parse::<ScheduleZone>().is_err());
    }

    #[test]
    fn zone_parsing() {
        assert_eq!("utc".parse::<ScheduleZone>().unwrap(), ScheduleZone::Utc);
        assert_eq!("Local".parse::<ScheduleZone>().unwrap(), ScheduleZone::Local);
        assert_eq!(
            "-0800".parse::<ScheduleZone>().unwrap(),
            ScheduleZone::Fixed(FixedOffset::west_opt(8 * 3600).unwrap())
        );
        assert_eq!(
            "America/New_York".parse::<ScheduleZone>().unwrap(),
            ScheduleZone::Named(chrono_tz::America::New_York)
        );
    }

    #[test]
    fn late_observation_beyond_tolerance_is_missed() {
        let tolerance = Duration::seconds(30);
        assert_eq!(check_firing(at(12, 15, 0), at(12, 15, 20), tolerance), FiringCheck::OnTime);
        assert_eq!(check_firing(at(12, 15, 0), at(12, 15, 30), tolerance), FiringCheck::OnTime);
        assert_eq!(
            check_firing(at(12, 15, 0), at(12, 47, 0), tolerance),
            FiringCheck::Missed {
                late_by: Duration::minutes(32)
            }
        );
    }
}
