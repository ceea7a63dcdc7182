//! Cron source.
//!
//! Emits one message per schedule fire, the body being the fire time
//! formatted with the configured strftime layout.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::sidecar::source::{Process, Source};
use dataflow_core::connector::CronSource as CronSourceSpec;
use dataflow_core::meta::Meta;

/// A connected cron source.
pub struct CronSource {
    name: String,
    stop: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronSource {
    /// Create a new instance, starting the timer loop.
    pub fn new(name: &str, urn: &str, spec: &CronSourceSpec, process: Process) -> Result<Self> {
        let schedule = Schedule::parse(&spec.schedule).with_context(|| format!("invalid cron schedule {:?}", spec.schedule))?;
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(run_timer(name.to_string(), urn.to_string(), schedule, spec.layout.clone(), process, stop.clone()));
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl Source for CronSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<()> {
        self.stop.notify_waiters();
        if let Some(handle) = self.handle.lock().await.take() {
            let _res = handle.await;
        }
        Ok(())
    }
}

async fn run_timer(name: String, urn: String, schedule: Schedule, layout: String, process: Process, stop: Arc<Notify>) {
    loop {
        let now = Utc::now();
        let next = match schedule.next_after(now) {
            Some(next) => next,
            None => {
                tracing::error!(source = %name, "schedule has no future fire time");
                return;
            }
        };
        let delay = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = stop.notified() => return,
        }
        let body = next.format(&layout).to_string();
        let meta = Meta::new(urn.clone(), next.timestamp().to_string(), next);
        if let Err(err) = (process)(meta, body.into_bytes()).await {
            tracing::error!(error = ?err, source = %name, "failed to process message");
        }
    }
}

/// A five-field cron schedule: minute, hour, day-of-month, month, day-of-week.
///
/// Supports `*`, single values, ranges, `/` steps and `,` lists. Day-of-month
/// and day-of-week combine the standard way: when both are restricted, a time
/// matches if either does.
#[derive(Clone, Debug)]
pub struct Schedule {
    minutes: [bool; 60],
    hours: [bool; 24],
    days_of_month: [bool; 32],
    months: [bool; 13],
    days_of_week: [bool; 7],
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Schedule {
    /// Parse a five-field schedule.
    pub fn parse(input: &str) -> Result<Self> {
        let fields: Vec<_> = input.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("expected 5 fields, got {}", fields.len());
        }
        let mut minutes = [false; 60];
        let mut hours = [false; 24];
        let mut days_of_month = [false; 32];
        let mut months = [false; 13];
        let mut days_of_week = [false; 7];
        parse_field(fields[0], 0, 59, &mut minutes).context("invalid minute field")?;
        parse_field(fields[1], 0, 23, &mut hours).context("invalid hour field")?;
        parse_field(fields[2], 1, 31, &mut days_of_month).context("invalid day-of-month field")?;
        parse_field(fields[3], 1, 12, &mut months).context("invalid month field")?;
        parse_field(fields[4], 0, 6, &mut days_of_week).context("invalid day-of-week field")?;
        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// The next fire time strictly after the given instant, if any within a year.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + ChronoDuration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);
        // Minute resolution; a year of minutes bounds the search.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(t) {
                return Some(t);
            }
            t = t + ChronoDuration::minutes(1);
        }
        None
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        if !self.minutes[t.minute() as usize] || !self.hours[t.hour() as usize] || !self.months[t.month() as usize] {
            return false;
        }
        let dom = self.days_of_month[t.day() as usize];
        let dow = self.days_of_week[t.weekday().num_days_from_sunday() as usize];
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// Parse one schedule field into the given set.
fn parse_field(input: &str, min: u32, max: u32, set: &mut [bool]) -> Result<()> {
    for part in input.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().context("invalid step")?),
            None => (part, 1),
        };
        if step == 0 {
            bail!("step must be positive");
        }
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            (start.parse().context("invalid range start")?, end.parse().context("invalid range end")?)
        } else {
            let val: u32 = range.parse().context("invalid value")?;
            // A bare value with a step (`5/15`) extends to the field max.
            if part.contains('/') {
                (val, max)
            } else {
                (val, val)
            }
        };
        if start < min || end > max || start > end {
            bail!("value out of range {}-{}", min, max);
        }
        let mut val = start;
        while val <= end {
            set[val as usize] = true;
            val += step;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.ymd(y, mo, d).and_hms(h, mi, 0)
    }

    #[test]
    fn every_minute_fires_next_minute() -> Result<()> {
        let schedule = Schedule::parse("* * * * *")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 12, 0)), Some(at(2021, 9, 1, 12, 1)));
        Ok(())
    }

    #[test]
    fn fixed_minute_of_hour() -> Result<()> {
        let schedule = Schedule::parse("30 * * * *")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 12, 0)), Some(at(2021, 9, 1, 12, 30)));
        assert_eq!(schedule.next_after(at(2021, 9, 1, 12, 30)), Some(at(2021, 9, 1, 13, 30)));
        Ok(())
    }

    #[test]
    fn step_field() -> Result<()> {
        let schedule = Schedule::parse("*/15 * * * *")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 12, 1)), Some(at(2021, 9, 1, 12, 15)));
        Ok(())
    }

    #[test]
    fn daily_at_midnight() -> Result<()> {
        let schedule = Schedule::parse("0 0 * * *")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 12, 0)), Some(at(2021, 9, 2, 0, 0)));
        Ok(())
    }

    #[test]
    fn day_of_week_only() -> Result<()> {
        // 2021-09-01 is a Wednesday; next Sunday is 09-05.
        let schedule = Schedule::parse("0 0 * * 0")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 0, 0)), Some(at(2021, 9, 5, 0, 0)));
        Ok(())
    }

    #[test]
    fn dom_and_dow_match_either() -> Result<()> {
        // Day 3 (Friday) or Sunday: the earlier of the two wins.
        let schedule = Schedule::parse("0 0 3 * 0")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 0, 0)), Some(at(2021, 9, 3, 0, 0)));
        Ok(())
    }

    #[test]
    fn ranges_and_lists() -> Result<()> {
        let schedule = Schedule::parse("0 9-17 * * 1-5")?;
        // Saturday 2021-09-04 skips to Monday 2021-09-06 09:00.
        assert_eq!(schedule.next_after(at(2021, 9, 4, 0, 0)), Some(at(2021, 9, 6, 9, 0)));
        let schedule = Schedule::parse("0,30 * * * *")?;
        assert_eq!(schedule.next_after(at(2021, 9, 1, 12, 40)), Some(at(2021, 9, 1, 13, 0)));
        Ok(())
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(Schedule::parse("* * * *").is_err(), "four fields must be rejected");
        assert!(Schedule::parse("60 * * * *").is_err(), "out-of-range minute must be rejected");
        assert!(Schedule::parse("* * 0 * *").is_err(), "day-of-month zero must be rejected");
        assert!(Schedule::parse("*/0 * * * *").is_err(), "zero step must be rejected");
        assert!(Schedule::parse("5-1 * * * *").is_err(), "inverted range must be rejected");
    }
}
