//! Five-field cron expressions: minute hour day-of-month month day-of-week.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use croner::Cron;
use croner::parser::{CronParser, Seconds, Year};

use crate::core::error::{AgentvisorError, Result};

/// How far back `latest_at_or_before` searches for a matching minute.
const SEARCH_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct CronSchedule {
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AgentvisorError::invalid_schedule(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }
        for field in &fields {
            validate_field(expr, field)?;
        }

        // a field starting with `*` counts as unrestricted, so day-of-month
        // and day-of-week are ORed only when both are explicit
        let and_days = fields[2].starts_with('*') || fields[4].starts_with('*');
        let cron = CronParser::builder()
            .seconds(Seconds::Disallowed)
            .year(Year::Disallowed)
            .dom_and_dow(and_days)
            .build()
            .parse(expr)
            .map_err(|err| AgentvisorError::invalid_schedule(expr, err.to_string()))?;
        Ok(Self { cron })
    }

    /// Whether the minute containing `at` matches.
    pub fn matches<Z: TimeZone>(&self, at: &DateTime<Z>) -> bool {
        let Some(minute) = at.with_second(0).and_then(|at| at.with_nanosecond(0)) else {
            return false;
        };
        self.cron.is_time_matching(&minute).unwrap_or(false)
    }

    /// Latest matching minute at or before `now`, evaluated in `tz`, looking
    /// back at most 24 hours.
    pub fn latest_at_or_before(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let now = now.with_timezone(&tz);
        self.cron
            .iter_from(now - Duration::hours(SEARCH_WINDOW_HOURS), croner::Direction::Forward)
            .take_while(|candidate| *candidate <= now)
            .last()
            .map(|candidate| candidate.with_timezone(&Utc))
    }
}

/// Rejects what the parser would accept beyond plain five-field cron: empty
/// list items and the `L`, `W`, `#` and `?` extensions.
fn validate_field(expr: &str, field: &str) -> Result<()> {
    for item in field.split(',') {
        if item.is_empty() {
            return Err(AgentvisorError::invalid_schedule(
                expr,
                format!("empty list item in '{field}'"),
            ));
        }
        let plain = item.split(['-', '/']).all(|token| {
            token == "*"
                || (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
                || (token.len() == 3 && token.bytes().all(|b| b.is_ascii_alphabetic()))
        });
        if !plain {
            return Err(AgentvisorError::invalid_schedule(
                expr,
                format!("unsupported item '{item}'"),
            ));
        }
    }
    Ok(())
}
