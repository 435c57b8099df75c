use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use super::cron::CronSchedule;
use crate::core::error::{AgentvisorError, Result};
use crate::core::profile::{TriggerConfig, TriggerKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Hourly { minute: u32 },
    Daily { hour: u32, minute: u32 },
    Cron(CronSchedule),
}

impl Schedule {
    /// `None` for kinds that are not driven by the clock.
    pub fn for_trigger(trigger: &TriggerConfig) -> Result<Option<Self>> {
        let expr = trigger.schedule_expr.as_deref().map(str::trim).unwrap_or("");
        let schedule = match trigger.kind {
            TriggerKind::Hourly => Schedule::hourly(expr)?,
            TriggerKind::Daily => Schedule::daily(expr)?,
            TriggerKind::Cron => Schedule::Cron(CronSchedule::parse(expr)?),
            TriggerKind::FileEvent | TriggerKind::Webhook => return Ok(None),
        };
        Ok(Some(schedule))
    }

    /// `"MM"`, defaulting to `00`.
    pub fn hourly(expr: &str) -> Result<Self> {
        if expr.is_empty() {
            return Ok(Schedule::Hourly { minute: 0 });
        }
        let minute = expr
            .parse::<u32>()
            .ok()
            .filter(|m| *m < 60)
            .ok_or_else(|| AgentvisorError::invalid_schedule(expr, "expected a minute 00-59"))?;
        Ok(Schedule::Hourly { minute })
    }

    /// `"HH:MM"`, defaulting to `00:00`.
    pub fn daily(expr: &str) -> Result<Self> {
        if expr.is_empty() {
            return Ok(Schedule::Daily { hour: 0, minute: 0 });
        }
        let time = NaiveTime::parse_from_str(expr, "%H:%M")
            .map_err(|_| AgentvisorError::invalid_schedule(expr, "expected HH:MM"))?;
        Ok(Schedule::Daily {
            hour: time.hour(),
            minute: time.minute(),
        })
    }

    /// Latest scheduled instant at or before `now`.
    pub fn latest_due(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Hourly { minute } => {
                let local = now.with_timezone(&tz).naive_local();
                let top = local.date().and_hms_opt(local.hour(), 0, 0)?;
                (0..3)
                    .map(|back| top - Duration::hours(back) + Duration::minutes(*minute as i64))
                    .map(|naive| resolve_local(tz, naive))
                    .find(|due| *due <= now)
            }
            Schedule::Daily { hour, minute } => {
                let today = now.with_timezone(&tz).date_naive();
                (0..3)
                    .filter_map(|back| {
                        (today - Duration::days(back)).and_hms_opt(*hour, *minute, 0)
                    })
                    .map(|naive| resolve_local(tz, naive))
                    .find(|due| *due <= now)
            }
            Schedule::Cron(cron) => cron.latest_at_or_before(now, tz),
        }
    }
}

/// Map a local wall-clock time to UTC. Ambiguous times take the earlier
/// instant; times inside a DST gap move to the first valid instant after it.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut probe = naive;
    for _ in 0..=(24 * 60) {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(at) => return at.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => probe += Duration::minutes(1),
        }
    }
    Utc.from_utc_datetime(&naive)
}

/// `now` with seconds and sub-seconds dropped.
pub fn truncate_to_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}
