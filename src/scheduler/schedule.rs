// dbbackup/src/scheduler/schedule.rs
use chrono::{DateTime, Days, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::errors::{AppError, Result};

static NUMERIC_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}$").expect("valid regex"));

/// A daily fire time at a fixed minute and hour in a time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    minute: u32,
    hour: u32,
    timezone: Tz,
    ignores_calendar_fields: bool,
}

impl Schedule {
    /// Parses a five-field cron expression. Minute and hour must be plain
    /// numbers; the day-of-month, month and day-of-week fields are accepted
    /// but have no effect.
    pub fn parse(expression: &str, timezone: Tz) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AppError::config(format!(
                "CRON must have five fields (minute hour day-of-month month day-of-week), got {}: '{}'",
                fields.len(),
                expression
            )));
        }

        let minute = numeric_field("minute", fields[0], 59)?;
        let hour = numeric_field("hour", fields[1], 23)?;
        let ignores_calendar_fields = fields[2..].iter().any(|f| *f != "*");

        Ok(Self {
            minute,
            hour,
            timezone,
            ignores_calendar_fields,
        })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// True when the expression restricted days or months, which this
    /// schedule does not honor.
    pub fn ignores_calendar_fields(&self) -> bool {
        self.ignores_calendar_fields
    }

    /// The first fire time strictly after `after`.
    ///
    /// A fire time that falls into a DST gap is skipped for that day; one that
    /// occurs twice on a DST fold fires at the earlier instant only.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&self.timezone);
        let mut date = local_after.date_naive();
        // A gap never spans more than a day, so a few candidate days suffice.
        for _ in 0..4 {
            let naive = date.and_hms_opt(self.hour, self.minute, 0)?;
            if let Some(candidate) = self.timezone.from_local_datetime(&naive).earliest() {
                if candidate > local_after {
                    return Some(candidate.with_timezone(&Utc));
                }
            }
            date = date.checked_add_days(Days::new(1))?;
        }
        None
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daily at {:02}:{:02} {}", self.hour(), self.minute(), self.timezone)
    }
}

fn numeric_field(field: &str, raw: &str, max: u32) -> Result<u32> {
    let value = if NUMERIC_FIELD.is_match(raw) {
        raw.parse::<u32>().ok().filter(|v| *v <= max)
    } else {
        None
    };
    value.ok_or_else(|| {
        AppError::config(format!(
            "CRON {} field must be a number between 0 and {} (got '{}')",
            field, max, raw
        ))
    })
}
