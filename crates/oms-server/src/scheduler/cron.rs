//! Cron schedules and the engine that fires them
//!
//! Accepted specs:
//!
//! - five fields, `min hour dom mon dow`
//! - six fields with leading seconds, `sec min hour dom mon dow`
//! - descriptors: `@yearly`, `@annually`, `@monthly`, `@weekly`,
//!   `@daily`, `@midnight`, `@hourly`
//! - `@every <duration>` with a Go-style duration such as `1h30m`
//!
//! Day-of-week numbers run 0-6 from Sunday, with 7 also meaning Sunday.
//! Schedules are evaluated in the server's local time zone.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures::future::BoxFuture;
use oms_core::config::serde_utils::go_duration;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// Wall clock the engine schedules against
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from tokio's clock, so paused test time moves it
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    base: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            base: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.base.elapsed()).unwrap_or_default();
        self.wall + elapsed
    }
}

/// A parsed schedule
#[derive(Debug, Clone)]
pub enum CronSchedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl CronSchedule {
    pub fn parse(spec: &str) -> Result<Self, ServerError> {
        let invalid = |reason: String| ServerError::CronSpecInvalid {
            spec: spec.to_string(),
            reason,
        };
        let spec_trimmed = spec.trim();

        if let Some(every) = spec_trimmed.strip_prefix("@every") {
            let interval = go_duration::parse(every).map_err(invalid)?;
            if interval.is_zero() {
                return Err(invalid("interval must be positive".to_string()));
            }
            return Ok(Self::Every(interval));
        }

        let expr = normalize(spec_trimmed).map_err(invalid)?;
        let schedule = cron::Schedule::from_str(&expr).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                Some(after + step)
            }
            Self::Cron(schedule) => schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Rewrite a spec into the seconds-first, 1-7 weekday form the parser takes
fn normalize(spec: &str) -> Result<String, String> {
    let descriptor = match spec {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * 1"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    };
    if let Some(expr) = descriptor {
        return Ok(expr.to_string());
    }
    if spec.starts_with('@') {
        return Err(format!("unknown descriptor {spec:?}"));
    }

    let mut fields: Vec<String> = spec.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(format!("expected 5 or 6 fields, found {n}")),
    }
    fields[5] = weekday_field(&fields[5])?;
    Ok(fields.join(" "))
}

/// Shift numeric weekdays from 0-6 (Sunday first) to 1-7
fn weekday_field(field: &str) -> Result<String, String> {
    let shift = |day: &str| -> Result<String, String> {
        match day.parse::<u8>() {
            Ok(n @ 0..=6) => Ok((n + 1).to_string()),
            Ok(7) => Ok("1".to_string()),
            Ok(n) => Err(format!("day of week out of range: {n}")),
            Err(_) => Ok(day.to_string()),
        }
    };

    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let mut shifted = match range.split_once('-') {
            Some((lo, "7")) => {
                // a range ending on Sunday wraps around to day 1
                let lo = shift(lo)?;
                parts.push("1".to_string());
                format!("{lo}-7")
            }
            Some((lo, hi)) => format!("{}-{}", shift(lo)?, shift(hi)?),
            None => shift(range)?,
        };
        if let Some(step) = step {
            shifted = format!("{shifted}/{step}");
        }
        parts.push(shifted);
    }
    Ok(parts.join(","))
}

type CronJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Named entries, each firing on its own timer task
pub struct CronEngine {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl CronEngine {
    pub fn new(clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Register `job` under `name`, replacing any entry with that name.
    ///
    /// Each firing runs on its own task, so a slow run never delays the
    /// next one.
    pub fn add<F, Fut>(&self, name: &str, schedule: CronSchedule, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: CronJob = Arc::new(move || Box::pin(job()));
        let token = self.cancel.child_token();
        if let Some(old) = self.entries.lock().insert(name.to_string(), token.clone()) {
            old.cancel();
        }

        let clock = Arc::clone(&self.clock);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut last = clock.now();
            loop {
                let Some(next) = schedule.next_after(last) else {
                    tracing::debug!(entry = %name, "schedule has no further firings");
                    break;
                };
                let wait = (next - clock.now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = token.cancelled() => break,
                }
                tracing::trace!(entry = %name, at = %next, "cron fire");
                tokio::spawn(job());
                last = next.max(clock.now());
            }
        });
    }

    pub fn remove(&self, name: &str) -> bool {
        match self.entries.lock().remove(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stop(&self) {
        for (_, token) in self.entries.lock().drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("*/1 * * * *").unwrap(), "0 */1 * * * *");
        assert_eq!(normalize("30 0 12 * * 1-5").unwrap(), "30 0 12 * * 2-6");
        assert_eq!(normalize("0 9 * * 0,6").unwrap(), "0 0 9 * * 1,7");
        assert_eq!(normalize("0 9 * * 5-7").unwrap(), "0 0 9 * * 1,6-7");
        assert_eq!(normalize("0 9 * * MON-FRI").unwrap(), "0 0 9 * * MON-FRI");
        assert_eq!(normalize("@midnight").unwrap(), "0 0 0 * * *");
        assert!(normalize("* * *").is_err());
        assert!(normalize("@sometimes").is_err());
        assert!(normalize("0 9 * * 8").is_err());
    }

    #[test]
    fn test_parse_accepts_and_rejects() {
        for ok in ["*/1 * * * *", "0 */5 * * * *", "@hourly", "@every 1h30m", "15 3 * * 0"] {
            assert!(CronSchedule::parse(ok).is_ok(), "{ok}");
        }
        for bad in ["", "61 * * * *", "* * * *", "@every", "@every 0s", "@every soon"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert!(matches!(err, ServerError::CronSpecInvalid { .. }), "{bad}");
        }
    }

    #[test]
    fn test_next_after() {
        let at: DateTime<Utc> = "2026-01-01T10:00:30Z".parse().unwrap();
        let minute = CronSchedule::parse("*/1 * * * *").unwrap();
        let next = minute.next_after(at).unwrap();
        assert_eq!(next, "2026-01-01T10:01:00Z".parse::<DateTime<Utc>>().unwrap());

        let every = CronSchedule::parse("@every 90s").unwrap();
        assert_eq!(every.next_after(at).unwrap(), at + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_fires_on_schedule() {
        let start: DateTime<Utc> = "2026-01-01T10:00:30Z".parse().unwrap();
        let engine = CronEngine::new(Arc::new(TokioClock::starting_at(start)), CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        engine.add("minutely", CronSchedule::parse("*/1 * * * *").unwrap(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // 10:01, 10:02 and 10:03
        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        assert!(engine.remove("minutely"));
        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!engine.contains("minutely"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_an_entry_cancels_the_old_one() {
        let engine = CronEngine::new(Arc::new(TokioClock::starting_at(Utc::now())), CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = Arc::clone(&fired);
            engine.add("job-1", CronSchedule::parse("@every 10s").unwrap(), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(engine.names(), vec!["job-1".to_string()]);
    }
}
