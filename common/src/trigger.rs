// Trigger policies and next fire time calculation
//
// A trigger decides when a job fires next. Recurring triggers (cron, interval) always
// answer with a time strictly after `now`; one-shot triggers (one-time, immediate) are
// removed by the scheduler after their single firing.

use crate::errors::TriggerError;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trigger defines when a job should fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        expression: String,
        timezone: Tz,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
    },
    Interval {
        interval_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
    },
    OneTime {
        run_at: DateTime<Utc>,
    },
    Immediate,
}

impl Trigger {
    /// Recurring trigger firing every `interval_seconds`, anchored at the time it is first evaluated
    pub fn interval(interval_seconds: u64) -> Self {
        Trigger::Interval {
            interval_seconds,
            start_date: None,
        }
    }

    /// Cron trigger evaluated in `timezone`; the expression is validated up front
    pub fn cron(expression: &str, timezone: Tz) -> Result<Self, TriggerError> {
        parse_cron_expression(expression)?;
        Ok(Trigger::Cron {
            expression: expression.to_string(),
            timezone,
            end_date: None,
        })
    }

    pub fn immediate() -> Self {
        Trigger::Immediate
    }

    /// One-shot triggers are removed from the job table after they fire
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::OneTime { .. } | Trigger::Immediate)
    }

    /// Reject configurations that could never produce a sane fire time
    pub fn validate(&self) -> Result<(), TriggerError> {
        match self {
            Trigger::Cron { expression, .. } => parse_cron_expression(expression).map(|_| ()),
            Trigger::Interval {
                interval_seconds: 0,
                ..
            } => Err(TriggerError::InvalidConfiguration(
                "interval_seconds must be greater than 0".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Compute the next fire time.
    ///
    /// `previous_fire_time` is the slot the job last fired for, if any. Returns `None`
    /// once the trigger is exhausted (a fired one-time trigger, a cron past its end date).
    pub fn next_fire_time(
        &self,
        previous_fire_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::Cron {
                expression,
                timezone,
                end_date,
            } => cron_next_fire_time(expression, *timezone, *end_date, previous_fire_time, now),

            Trigger::Interval {
                interval_seconds,
                start_date,
            } => interval_next_fire_time(*interval_seconds, *start_date, previous_fire_time, now),

            Trigger::OneTime { run_at } => match previous_fire_time {
                Some(_) => Ok(None),
                None => Ok(Some(*run_at)),
            },

            Trigger::Immediate => Ok(Some(now)),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Cron {
                expression,
                timezone,
                ..
            } => write!(f, "cron[{}, {}]", expression, timezone),
            Trigger::Interval {
                interval_seconds, ..
            } => write!(f, "interval[{}]", format_interval(*interval_seconds)),
            Trigger::OneTime { run_at } => write!(f, "date[{}]", run_at.to_rfc3339()),
            Trigger::Immediate => write!(f, "immediate"),
        }
    }
}

/// Parse and validate a cron expression (seconds precision)
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, TriggerError> {
    CronSchedule::from_str(expression).map_err(|e| TriggerError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn cron_next_fire_time(
    expression: &str,
    timezone: Tz,
    end_date: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    let schedule = parse_cron_expression(expression)?;

    // Never hand back a slot at or before the one that already fired
    let reference = match previous_fire_time {
        Some(previous) if previous > now => previous,
        _ => now,
    };

    // `after` is exclusive, so the result is strictly later than the reference
    let next = match schedule.after(&reference.with_timezone(&timezone)).next() {
        Some(next) => next.with_timezone(&Utc),
        None => return Ok(None),
    };

    if let Some(end) = end_date {
        if next > end {
            return Ok(None);
        }
    }

    Ok(Some(next))
}

/// Interval slots live on a grid anchored at the previous fire time (or the start date);
/// missed slots are coalesced into the first slot strictly after `now`.
fn interval_next_fire_time(
    interval_seconds: u64,
    start_date: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    if interval_seconds == 0 {
        return Err(TriggerError::InvalidConfiguration(
            "interval_seconds must be greater than 0".to_string(),
        ));
    }
    let interval = i64::try_from(interval_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            TriggerError::CalculationFailed(format!("interval {}s is too large", interval_seconds))
        })?;

    let anchor = match (previous_fire_time, start_date) {
        (Some(previous), _) if previous > now => return Ok(Some(previous + interval)),
        (Some(previous), _) => previous,
        (None, Some(start)) if start > now => return Ok(Some(start)),
        (None, Some(start)) => start,
        (None, None) => now,
    };

    let elapsed_ms = (now - anchor).num_milliseconds();
    let interval_ms = interval.num_milliseconds();
    let steps = elapsed_ms / interval_ms + 1;

    let offset = i32::try_from(steps)
        .ok()
        .and_then(|steps| interval.checked_mul(steps))
        .ok_or_else(|| {
            TriggerError::CalculationFailed(format!(
                "{} missed slots of {}s cannot be represented",
                steps, interval_seconds
            ))
        })?;

    anchor
        .checked_add_signed(offset)
        .map(Some)
        .ok_or_else(|| TriggerError::CalculationFailed("fire time out of range".to_string()))
}

fn format_interval(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    match days {
        0 => format!("{}:{:02}:{:02}", hours, minutes, seconds),
        1 => format!("1 day, {}:{:02}:{:02}", hours, minutes, seconds),
        _ => format!("{} days, {}:{:02}:{:02}", days, hours, minutes, seconds),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 0 12 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
        assert!(Trigger::cron("invalid", chrono_tz::UTC).is_err());
    }

    #[test]
    fn test_interval_first_fire_is_one_interval_out() {
        let trigger = Trigger::interval(60);
        let next = trigger.next_fire_time(None, at(0)).unwrap();
        assert_eq!(next, Some(at(60)));
    }

    #[test]
    fn test_interval_follows_previous_fire_time() {
        let trigger = Trigger::interval(60);
        let next = trigger.next_fire_time(Some(at(60)), at(61)).unwrap();
        assert_eq!(next, Some(at(120)));
    }

    #[test]
    fn test_interval_coalesces_missed_slots() {
        let trigger = Trigger::interval(10);
        // Five slots were missed while the process was down
        let next = trigger.next_fire_time(Some(at(0)), at(55)).unwrap();
        assert_eq!(next, Some(at(60)));
    }

    #[test]
    fn test_interval_never_returns_now_on_slot_boundary() {
        let trigger = Trigger::interval(10);
        let next = trigger.next_fire_time(Some(at(0)), at(10)).unwrap();
        assert_eq!(next, Some(at(20)));
    }

    #[test]
    fn test_interval_future_start_date() {
        let trigger = Trigger::Interval {
            interval_seconds: 30,
            start_date: Some(at(100)),
        };
        assert_eq!(trigger.next_fire_time(None, at(0)).unwrap(), Some(at(100)));
        assert_eq!(trigger.next_fire_time(None, at(101)).unwrap(), Some(at(130)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let trigger = Trigger::interval(0);
        assert!(trigger.validate().is_err());
        assert!(trigger.next_fire_time(None, at(0)).is_err());
    }

    #[test]
    fn test_cron_fires_strictly_after_now() {
        let trigger = Trigger::cron("0 * * * * * *", chrono_tz::UTC).unwrap();
        let now = at(0);
        let next = trigger.next_fire_time(None, now).unwrap().unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::seconds(60));

        // A previous fire time in the future is never repeated
        let again = trigger.next_fire_time(Some(next), now).unwrap().unwrap();
        assert!(again > next);
    }

    #[test]
    fn test_cron_with_end_date_in_past() {
        let trigger = Trigger::Cron {
            expression: "0 0 12 * * * *".to_string(),
            timezone: chrono_tz::Asia::Ho_Chi_Minh,
            end_date: Some(at(0) - Duration::days(1)),
        };
        assert_eq!(trigger.next_fire_time(None, at(0)).unwrap(), None);
    }

    #[test]
    fn test_one_time_fires_once() {
        let trigger = Trigger::OneTime { run_at: at(30) };
        assert_eq!(trigger.next_fire_time(None, at(0)).unwrap(), Some(at(30)));
        assert_eq!(trigger.next_fire_time(Some(at(30)), at(31)).unwrap(), None);
        assert!(trigger.is_one_shot());
    }

    #[test]
    fn test_immediate_fires_now() {
        let trigger = Trigger::immediate();
        assert_eq!(trigger.next_fire_time(None, at(5)).unwrap(), Some(at(5)));
        assert!(trigger.is_one_shot());
        assert!(!Trigger::interval(1).is_one_shot());
    }

    #[test]
    fn test_display() {
        assert_eq!(Trigger::interval(1).to_string(), "interval[0:00:01]");
        assert_eq!(Trigger::interval(3_723).to_string(), "interval[1:02:03]");
        assert_eq!(Trigger::interval(90_000).to_string(), "interval[1 day, 1:00:00]");
        assert_eq!(Trigger::immediate().to_string(), "immediate");
        let cron = Trigger::cron("0 30 4 * * * *", chrono_tz::UTC).unwrap();
        assert_eq!(cron.to_string(), "cron[0 30 4 * * * *, UTC]");
    }

    #[test]
    fn test_serde_tagging() {
        let json = serde_json::to_value(Trigger::interval(5)).unwrap();
        assert_eq!(json["type"], "interval");
        assert_eq!(json["interval_seconds"], 5);

        let parsed: Trigger = serde_json::from_str(r#"{"type":"immediate"}"#).unwrap();
        assert_eq!(parsed, Trigger::Immediate);
    }
}
