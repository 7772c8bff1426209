//! Cron-like schedules of the `time` destination option
//!
//! `time <minute> <hour> <day of month> <month> <day of week>`, each field being `*`, a number,
//! a range `a-b`, a step `*/n` or `a-b/n`, or a comma separated list of those. Days of the
//! week count from 0 (Sunday) to 6; 7 is accepted as Sunday too.

use chrono::{Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSchedule {
    minutes: u64,
    hours: u32,
    month_days: u32,
    months: u16,
    week_days: u8,
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step in '{}'", part))?;
                if step == 0 {
                    return Err(format!("zero step in '{}'", part));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| format!("invalid number in '{}'", part))?;
            let b: u32 = b.parse().map_err(|_| format!("invalid number in '{}'", part))?;
            (a, b)
        } else {
            let value: u32 = range
                .parse()
                .map_err(|_| format!("invalid number in '{}'", part))?;
            (value, value)
        };
        if start < min || end > max || start > end {
            return Err(format!("'{}' is outside {}-{}", part, min, max));
        }
        let mut value = start;
        while value <= end {
            mask |= 1 << value;
            value += step;
        }
    }
    Ok(mask)
}

impl TimeSchedule {
    /// Parses the five fields following the `time` keyword.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        let [minute, hour, month_day, month, week_day] = fields.as_slice() else {
            return Err(format!("expected 5 fields, found {}", fields.len()));
        };
        let mut week_days = parse_field(week_day, 0, 7)? as u8;
        if week_days & (1 << 7) != 0 {
            week_days = (week_days | 1) & 0x7f;
        }
        Ok(Self {
            minutes: parse_field(minute, 0, 59)?,
            hours: parse_field(hour, 0, 23)? as u32,
            month_days: parse_field(month_day, 1, 31)? as u32,
            months: parse_field(month, 1, 12)? as u16,
            week_days,
        })
    }

    fn day_matches<T: Datelike>(&self, date: &T) -> bool {
        self.month_days & (1 << date.day()) != 0
            && self.months & (1 << date.month()) != 0
            && self.week_days & (1 << date.weekday().num_days_from_sunday()) != 0
    }

    /// Whether the minute containing `time` is part of the schedule.
    pub fn matches<Tz: TimeZone>(&self, time: &chrono::DateTime<Tz>) -> bool {
        self.day_matches(time)
            && self.hours & (1 << time.hour()) != 0
            && self.minutes & (1 << time.minute()) != 0
    }

    /// First scheduled minute strictly after `time`, searching at most one leap year ahead.
    pub fn next_after(
        &self,
        time: &chrono::DateTime<chrono::Local>,
    ) -> Option<chrono::DateTime<chrono::Local>> {
        let start = time.naive_local().with_second(0)?.with_nanosecond(0)?
            + chrono::Duration::minutes(1);
        let mut day = start.date();
        for _ in 0..=366 {
            if self.day_matches(&day) {
                for hour in 0..24u32 {
                    if self.hours & (1 << hour) == 0 {
                        continue;
                    }
                    for minute in 0..60u32 {
                        if self.minutes & (1 << minute) == 0 {
                            continue;
                        }
                        let candidate = day.and_hms_opt(hour, minute, 0)?;
                        if candidate < start {
                            continue;
                        }
                        // skips minutes that do not exist locally, e.g. during a DST jump
                        if let Some(local) = chrono::Local.from_local_datetime(&candidate).earliest()
                        {
                            return Some(local);
                        }
                    }
                }
            }
            day = day.succ_opt()?;
        }
        None
    }
}
