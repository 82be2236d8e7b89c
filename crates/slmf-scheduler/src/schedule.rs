// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schedule parsing and next-fire computation.
//!
//! Three forms: `cron:<classic 5-field expression>`, `interval:<seconds>`
//! and `at:<iso8601 utc>`. Cron expressions are parsed once at creation
//! into a precomputed calculator; the stored string stays the source of
//! truth.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;
use thiserror::Error;

/// Schedule string problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Missing or unknown `cron:`/`interval:`/`at:` prefix.
    #[error("unknown schedule form: {0}")]
    UnknownForm(String),
    /// The cron expression failed to parse.
    #[error("invalid cron expression: {0}")]
    BadCron(String),
    /// Interval seconds missing, unparseable, or zero.
    #[error("invalid interval: {0}")]
    BadInterval(String),
    /// The timestamp was not valid ISO-8601.
    #[error("invalid timestamp: {0}")]
    BadTimestamp(String),
}

enum Kind {
    Cron(Box<cron::Schedule>),
    Interval(u64),
    At(DateTime<Utc>),
}

/// A parsed schedule. Keeps the original string for persistence.
pub struct Schedule {
    raw: String,
    kind: Kind,
}

impl Schedule {
    /// Parse a schedule string.
    ///
    /// # Errors
    ///
    /// A [`ScheduleError`] naming the malformed part.
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let kind = if let Some(expr) = raw.strip_prefix("cron:") {
            // Classic 5-field form; the parser wants a seconds column.
            let with_seconds = format!("0 {expr}");
            let schedule = cron::Schedule::from_str(&with_seconds)
                .map_err(|e| ScheduleError::BadCron(format!("{expr}: {e}")))?;
            Kind::Cron(Box::new(schedule))
        } else if let Some(secs) = raw.strip_prefix("interval:") {
            let seconds: u64 = secs
                .parse()
                .map_err(|_| ScheduleError::BadInterval(secs.to_owned()))?;
            if seconds == 0 {
                return Err(ScheduleError::BadInterval(secs.to_owned()));
            }
            Kind::Interval(seconds)
        } else if let Some(ts) = raw.strip_prefix("at:") {
            let when = DateTime::parse_from_rfc3339(ts)
                .map_err(|_| ScheduleError::BadTimestamp(ts.to_owned()))?
                .with_timezone(&Utc);
            Kind::At(when)
        } else {
            return Err(ScheduleError::UnknownForm(raw.to_owned()));
        };
        Ok(Self { raw: raw.to_owned(), kind })
    }

    /// The original schedule string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First fire time strictly after `t`.
    ///
    /// `None` means the schedule is exhausted: a one-shot whose time has
    /// passed, or a cron expression with no future match.
    #[must_use]
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(schedule) => schedule.after(&t).next(),
            Kind::Interval(seconds) => Some(t + ChronoDuration::seconds(*seconds as i64)),
            Kind::At(when) => (*when > t).then_some(*when),
        }
    }

    /// One-shot schedules are terminal after a successful run.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, Kind::At(_))
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Schedule").field(&self.raw).finish()
    }
}
