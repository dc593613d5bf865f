use chrono::{NaiveTime, Timelike};

use crate::alarm::model::ValidationError;

/// Expands `start..=end` into trigger times spaced `interval_minutes` apart.
///
/// Arithmetic is on minutes since midnight and never wraps past 24:00.
/// `start == end` yields exactly `[start]`; `start > end` is an error rather
/// than an empty schedule.
pub fn compute_trigger_times(
    start: NaiveTime,
    end: NaiveTime,
    interval_minutes: u32,
) -> Result<Vec<NaiveTime>, ValidationError> {
    if interval_minutes == 0 {
        return Err(ValidationError::IntervalTooShort(interval_minutes));
    }

    let start_minutes = minutes_since_midnight(start);
    let end_minutes = minutes_since_midnight(end);
    if start_minutes > end_minutes {
        return Err(ValidationError::EndNotAfterStart { start, end });
    }

    let capacity = ((end_minutes - start_minutes) / interval_minutes + 1) as usize;
    let mut times = Vec::with_capacity(capacity);
    let mut current = Some(start_minutes);
    while let Some(minutes) = current
        && minutes <= end_minutes
    {
        if let Some(time) = time_from_minutes(minutes) {
            times.push(time);
        }
        current = minutes.checked_add(interval_minutes);
    }
    Ok(times)
}

pub fn minutes_since_midnight(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

fn time_from_minutes(minutes: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
}
