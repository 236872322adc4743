//! Cron trigger evaluation
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and 6-field expressions with a leading
//! seconds field. 5-field expressions are normalised by firing at second 0,
//! and their day-of-week field follows Unix numbering (`0` and `7` are
//! Sunday, `1` is Monday).
//!
//! "Now" always comes from a [`Clock`] so trigger decisions can be tested
//! against fixed instants.

use crate::error::{MapflowError, Result};
use crate::models::Map;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::debug;

/// Injectable time source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a settable instant
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// 5-field expressions get second 0 and Unix weekday numbers (0-7, Sunday
/// is 0 and 7). 6-field expressions are passed through and use the `cron`
/// crate's numbering (1-7, Sunday is 1).
fn normalize_cron_expr(expression: &str) -> String {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }

    fields[4] = unix_day_of_week(&fields[4]);
    format!("0 {}", fields.join(" "))
}

/// Rewrite numeric day-of-week items as day names, which both numberings
/// agree on. Items that are not plain numbers, ranges or steps are left for
/// the `cron` parser to accept or reject.
fn unix_day_of_week(field: &str) -> String {
    if field == "*" {
        return field.to_string();
    }

    let mut days: Vec<&str> = Vec::new();
    for item in field.split(',') {
        match weekday_numbers(item) {
            Some(numbers) => {
                for n in numbers {
                    let day = WEEKDAYS[(n % 7) as usize];
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
            }
            None => return field.to_string(),
        }
    }

    days.join(",")
}

fn weekday_numbers(item: &str) -> Option<Vec<u32>> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, step.parse::<u32>().ok().filter(|&s| s > 0)?),
        None => (item, 1),
    };

    let (first, last) = if base == "*" {
        (0, 6)
    } else if let Some((first, last)) = base.split_once('-') {
        (first.parse().ok()?, last.parse().ok()?)
    } else {
        let first: u32 = base.parse().ok()?;
        if item.contains('/') {
            (first, 6)
        } else {
            (first, first)
        }
    };

    if last > 7 || first > last {
        return None;
    }
    Some((first..=last).step_by(step as usize).collect())
}

/// Parse a 5- or 6-field cron expression
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expr(expression);
    Schedule::from_str(&normalized).map_err(|e| MapflowError::ScheduleParse {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Validate cron expression format without computing any fire time
///
/// ```
/// use mapflow::schedule::validate_cron_expression;
///
/// assert!(validate_cron_expression("0 10 * * *").is_ok());
/// assert!(validate_cron_expression("invalid").is_err());
/// ```
pub fn validate_cron_expression(expression: &str) -> Result<()> {
    parse_schedule(expression)?;
    debug!("Cron expression '{}' is valid", expression);
    Ok(())
}

/// First fire time strictly after `after`, if the schedule has one
pub fn next_fire_after(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_schedule(expression)?;
    Ok(schedule.after(&after).next())
}

/// Whether `map` is due at `now`.
///
/// The next fire time is computed strictly after the map's last run, or after
/// its start date when it never ran. A malformed expression is returned as
/// [`MapflowError::ScheduleParse`].
pub fn should_trigger(map: &Map, now: DateTime<Utc>) -> Result<bool> {
    let base = map.last_run.unwrap_or(map.start_date);
    match next_fire_after(&map.schedule, base)? {
        Some(next) => {
            debug!(
                "Map '{}' next fire at {} (now: {}, base: {})",
                map.name, next, now, base
            );
            Ok(now >= next)
        }
        None => Ok(false),
    }
}
