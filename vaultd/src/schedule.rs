//! Schedule-due evaluation (half of component C3).
//!
//! A [`Schedule`] answers one question: given "now", the last successful backup (if any) and
//! when the config was created, has a scheduled instant passed without a success since? Interval
//! schedules (HOURLY) compare elapsed time directly; wall-clock schedules (DAILY/WEEKLY/MONTHLY)
//! and CRON schedules instead look for the most recent scheduled instant at or before "now" and
//! check whether a success covers it. All instants are UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

#[derive(Debug, Clone)]
pub enum Schedule {
    Hourly,
    Daily {
        time: NaiveTime,
    },
    Weekly {
        weekday: Weekday,
        time: NaiveTime,
    },
    Monthly {
        day: u32,
        time: NaiveTime,
    },
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn is_due(
        &self,
        now: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> bool {
        match self {
            Schedule::Hourly => match last_success {
                None => true,
                Some(t) => now - t >= Duration::hours(1),
            },
            Schedule::Daily { time } => {
                due_since(most_recent_daily(now, *time), last_success, created_at)
            }
            Schedule::Weekly { weekday, time } => due_since(
                most_recent_weekly(now, *weekday, *time),
                last_success,
                created_at,
            ),
            Schedule::Monthly { day, time } => due_since(
                most_recent_monthly(now, *day, *time),
                last_success,
                created_at,
            ),
            Schedule::Cron(expr) => {
                let after = last_success.unwrap_or(created_at);
                match expr.after(&after).next() {
                    Some(next) => next <= now,
                    None => false,
                }
            }
        }
    }
}

/// A wall-clock schedule is due once its most recent occurrence has both happened (is at or
/// before `now`) and happened after the config existed, and no success has landed since.
fn due_since(
    occurrence: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
) -> bool {
    let Some(occurrence) = occurrence else {
        return false;
    };
    if occurrence < created_at {
        return false;
    }
    match last_success {
        None => true,
        Some(t) => t < occurrence,
    }
}

fn combine(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn most_recent_daily(now: DateTime<Utc>, time: NaiveTime) -> Option<DateTime<Utc>> {
    let today = combine(now.date_naive(), time);
    Some(if today <= now {
        today
    } else {
        today - Duration::days(1)
    })
}

fn most_recent_weekly(now: DateTime<Utc>, weekday: Weekday, time: NaiveTime) -> Option<DateTime<Utc>> {
    let mut date = now.date_naive();
    while date.weekday() != weekday {
        date -= Duration::days(1);
    }
    let mut occurrence = combine(date, time);
    if occurrence > now {
        occurrence -= Duration::days(7);
    }
    Some(occurrence)
}

fn most_recent_monthly(now: DateTime<Utc>, day: u32, time: NaiveTime) -> Option<DateTime<Utc>> {
    let mut year = now.year();
    let mut month = now.month();
    loop {
        if let Some(date) = clamped_date(year, month, day) {
            let occurrence = combine(date, time);
            if occurrence <= now {
                return Some(occurrence);
            }
        }
        if month == 1 {
            year -= 1;
            month = 12;
        } else {
            month -= 1;
        }
    }
}

/// Builds a date for `year`/`month`, clamping `day` to the last day of the month when the month
/// is shorter (e.g. day=31 in April becomes April 30th).
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let last_day = last_day_of_month(year, month);
    NaiveDate::from_ymd_opt(year, month, day.min(last_day))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
        .day()
}
