//! Calendar arithmetic for task due times.
//!
//! Everything here is pure: callers pass in `now` so the rules can be tested
//! against fixed instants.

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime};

use backman_types::Frequency;

/// Next due time recorded on a task after a run.
///
/// * daily: the next occurrence of `at` strictly after `now`.
/// * weekly: the next Monday at `at` strictly after `now`.
/// * monthly: the 1st of the next calendar month at `at`.
pub fn next_run(now: NaiveDateTime, at: NaiveTime, frequency: Frequency) -> NaiveDateTime {
    match frequency {
        Frequency::Daily => next_daily(now, at),
        Frequency::Weekly => next_weekly(now, at),
        Frequency::Monthly => first_of_next_month(now.date()).and_time(at),
    }
}

/// Next instant a scheduler trigger fires: the earliest time strictly after
/// `now` matching the rule (every day, every Monday, or the 1st of a month).
///
/// Differs from [`next_run`] only for monthly tasks, where the 1st of the
/// current month still counts when it lies ahead of `now`.
pub fn next_fire(now: NaiveDateTime, at: NaiveTime, frequency: Frequency) -> NaiveDateTime {
    match frequency {
        Frequency::Daily => next_daily(now, at),
        Frequency::Weekly => next_weekly(now, at),
        Frequency::Monthly => {
            let this_month = first_of_month(now.date()).and_time(at);
            if this_month > now {
                this_month
            } else {
                first_of_next_month(now.date()).and_time(at)
            }
        }
    }
}

fn next_daily(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let candidate = now.date().and_time(at);
    if candidate > now {
        candidate
    } else {
        add_days(candidate, 1)
    }
}

fn next_weekly(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let days_until_monday = (7 - now.weekday().num_days_from_monday()) % 7;
    let candidate = add_days(now.date().and_time(at), u64::from(days_until_monday));
    if candidate > now {
        candidate
    } else {
        add_days(candidate, 7)
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    first_of_month(date)
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX)
}

fn add_days(at: NaiveDateTime, days: u64) -> NaiveDateTime {
    at.checked_add_days(Days::new(days))
        .unwrap_or(NaiveDateTime::MAX)
}
