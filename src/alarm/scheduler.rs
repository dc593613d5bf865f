use std::collections::HashMap;

use chrono::{DateTime, Days, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;

use crate::alarm::fire::FireEvent;
use crate::alarm::model::{AlarmConfig, AlarmId, ValidationError};
use crate::platform::{ExactAlarmPlatform, PlatformError, RequestKey};

/// Index range probed when an alarm's registration count was never recorded.
pub const LEGACY_CANCEL_CEILING: usize = 100;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("alarm {0} is disabled and cannot be scheduled")]
    Disabled(AlarmId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("exact alarm permission is not granted; alarm {0} was not scheduled")]
    PermissionDenied(AlarmId),
    #[error("triggers {first} and {second} of alarm {alarm_id} share request key {key}")]
    KeyCollision {
        alarm_id: AlarmId,
        first: usize,
        second: usize,
        key: RequestKey,
    },
    #[error("trigger {index} of alarm {alarm_id} is not in its current time set of {count}")]
    IndexOutOfRange {
        alarm_id: AlarmId,
        index: usize,
        count: usize,
    },
    #[error("no upcoming local instant for {} on alarm {alarm_id}", .time.format("%H:%M"))]
    NoUpcomingInstant { alarm_id: AlarmId, time: NaiveTime },
    #[error("failed to register trigger {index} of alarm {alarm_id}: {source}")]
    Platform {
        alarm_id: AlarmId,
        index: usize,
        #[source]
        source: PlatformError,
    },
}

impl SchedulerError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            SchedulerError::PermissionDenied(_)
                | SchedulerError::Platform {
                    source: PlatformError::PermissionDenied,
                    ..
                }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedTrigger {
    pub index: usize,
    pub time: NaiveTime,
    pub key: RequestKey,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub alarm_id: AlarmId,
    pub triggers: Vec<ArmedTrigger>,
}

impl ScheduleReport {
    pub fn armed_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.triggers.iter().map(|trigger| trigger.fire_at).min()
    }
}

/// Turns alarm configs into exact OS registrations and takes them back out.
#[derive(Debug, Clone)]
pub struct AlarmScheduler<P> {
    platform: P,
}

impl<P: ExactAlarmPlatform> AlarmScheduler<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn schedule(&self, config: &AlarmConfig) -> Result<ScheduleReport, SchedulerError> {
        self.schedule_at(config, &Local::now())
    }

    /// Register one exact alarm per trigger time. Either every trigger is
    /// registered or none is: a failed registration cancels the ones made
    /// earlier in the same call.
    pub fn schedule_at<Tz>(
        &self,
        config: &AlarmConfig,
        now: &DateTime<Tz>,
    ) -> Result<ScheduleReport, SchedulerError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        if !config.enabled {
            return Err(SchedulerError::Disabled(config.id.clone()));
        }
        config.validate()?;
        let times = config.trigger_times()?;

        let mut seen_keys = HashMap::with_capacity(times.len());
        let mut planned = Vec::with_capacity(times.len());
        for (index, time) in times.into_iter().enumerate() {
            let key = request_key(&config.id, index);
            if let Some(first) = seen_keys.insert(key, index) {
                return Err(SchedulerError::KeyCollision {
                    alarm_id: config.id.clone(),
                    first,
                    second: index,
                    key,
                });
            }
            let fire_at = next_fire_instant(time, now).ok_or_else(|| {
                SchedulerError::NoUpcomingInstant {
                    alarm_id: config.id.clone(),
                    time,
                }
            })?;
            planned.push(ArmedTrigger {
                index,
                time,
                key,
                fire_at: fire_at.with_timezone(&Utc),
            });
        }

        if !self.platform.can_schedule_exact() {
            tracing::warn!(alarm_id = %config.id, "exact alarm permission missing");
            return Err(SchedulerError::PermissionDenied(config.id.clone()));
        }

        for (position, trigger) in planned.iter().enumerate() {
            let event = FireEvent {
                alarm_id: config.id.clone(),
                index: trigger.index,
            };
            if let Err(source) = self
                .platform
                .register_exact(trigger.fire_at, trigger.key, event)
            {
                for registered in &planned[..position] {
                    self.platform.cancel(registered.key);
                }
                tracing::error!(
                    alarm_id = %config.id,
                    index = trigger.index,
                    error = %source,
                    "registration failed, rolled back"
                );
                return Err(SchedulerError::Platform {
                    alarm_id: config.id.clone(),
                    index: trigger.index,
                    source,
                });
            }
        }

        let report = ScheduleReport {
            alarm_id: config.id.clone(),
            triggers: planned,
        };
        tracing::info!(
            alarm_id = %config.id,
            armed = report.armed_count(),
            next_fire = ?report.next_fire(),
            "alarm scheduled"
        );
        Ok(report)
    }

    /// Cancel indices `0..armed_count` of `alarm_id`. Returns how many keys
    /// were cancelled; unknown keys are no-ops on the platform side.
    pub fn cancel(&self, alarm_id: &AlarmId, armed_count: usize) -> usize {
        for index in 0..armed_count {
            self.platform.cancel(request_key(alarm_id, index));
        }
        tracing::debug!(alarm_id = %alarm_id, cancelled = armed_count, "alarm cancelled");
        armed_count
    }

    /// Cancel for records whose registration count is unknown.
    pub fn cancel_probe(&self, alarm_id: &AlarmId) -> usize {
        self.cancel(alarm_id, LEGACY_CANCEL_CEILING)
    }

    /// Re-register one trigger for its next day after it fired. Delivery may
    /// run slightly ahead of the registered minute, so the search starts one
    /// minute past `now`.
    pub fn rearm_at<Tz>(
        &self,
        config: &AlarmConfig,
        index: usize,
        now: &DateTime<Tz>,
    ) -> Result<ArmedTrigger, SchedulerError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        if !config.enabled {
            return Err(SchedulerError::Disabled(config.id.clone()));
        }
        let times = config.trigger_times()?;
        let Some(time) = times.get(index).copied() else {
            return Err(SchedulerError::IndexOutOfRange {
                alarm_id: config.id.clone(),
                index,
                count: times.len(),
            });
        };
        if !self.platform.can_schedule_exact() {
            return Err(SchedulerError::PermissionDenied(config.id.clone()));
        }

        let probe = now.clone() + chrono::Duration::minutes(1);
        let fire_at = next_fire_instant(time, &probe)
            .ok_or_else(|| SchedulerError::NoUpcomingInstant {
                alarm_id: config.id.clone(),
                time,
            })?
            .with_timezone(&Utc);
        let key = request_key(&config.id, index);
        self.platform
            .register_exact(
                fire_at,
                key,
                FireEvent {
                    alarm_id: config.id.clone(),
                    index,
                },
            )
            .map_err(|source| SchedulerError::Platform {
                alarm_id: config.id.clone(),
                index,
                source,
            })?;
        tracing::debug!(alarm_id = %config.id, index, %fire_at, "trigger re-armed");
        Ok(ArmedTrigger {
            index,
            time,
            key,
            fire_at,
        })
    }
}

/// 31-multiplier rolling hash over the UTF-16 units of `"{alarm_id}_{index}"`.
/// Stable across processes, so cancellation can rebuild keys without storing
/// them.
pub fn request_key(alarm_id: &AlarmId, index: usize) -> RequestKey {
    format!("{alarm_id}_{index}")
        .encode_utf16()
        .fold(0_i32, |hash, unit| {
            hash.wrapping_mul(31).wrapping_add(i32::from(unit))
        })
}

/// First instant strictly after `now` whose local wall-clock time is `time`.
/// Days where `time` does not exist (spring-forward gap) are skipped.
pub fn next_fire_instant<Tz>(time: NaiveTime, now: &DateTime<Tz>) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let timezone = now.timezone();
    for day_offset in 0_u64..3 {
        let date = now.date_naive().checked_add_days(Days::new(day_offset))?;
        let candidate = match resolve_local_datetime(&timezone, date.and_time(time)) {
            Some(value) => value,
            None => continue,
        };
        if candidate > *now {
            return Some(candidate);
        }
    }
    None
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::{FixedOffset, NaiveDate};
    use chrono_tz::America::New_York;

    use super::*;
    use crate::alarm::model::time_of_day;
    use crate::platform::AlarmTable;

    fn fixed_now(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(9 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, 4, 10, hour, minute, 0)
            .single()
            .expect("valid")
    }

    fn morning_config() -> AlarmConfig {
        AlarmConfig::new(time_of_day(6, 0), time_of_day(7, 0), 20)
            .with_id(AlarmId::new("morning"))
    }

    fn scheduler() -> (Arc<AlarmTable>, AlarmScheduler<Arc<AlarmTable>>) {
        let table = Arc::new(AlarmTable::new());
        (Arc::clone(&table), AlarmScheduler::new(table))
    }

    #[test]
    fn request_key_matches_rolling_string_hash() {
        assert_eq!(request_key(&AlarmId::new("a"), 0), 96_210);
        assert_eq!(
            request_key(&AlarmId::new("morning"), 3),
            request_key(&AlarmId::new("morning"), 3)
        );
        assert_ne!(
            request_key(&AlarmId::new("morning"), 0),
            request_key(&AlarmId::new("morning"), 1)
        );
    }

    #[test]
    fn future_time_today_stays_today() {
        let now = fixed_now(5, 0);
        let next = next_fire_instant(time_of_day(6, 0), &now).expect("next");
        assert_eq!(next, fixed_now(6, 0));
    }

    #[test]
    fn elapsed_or_current_time_rolls_to_next_day() {
        let now = fixed_now(6, 0);
        let next = next_fire_instant(time_of_day(6, 0), &now).expect("next");
        assert_eq!(next, fixed_now(6, 0) + chrono::Duration::days(1));

        let next = next_fire_instant(time_of_day(5, 59), &now).expect("next");
        assert_eq!(
            next.date_naive(),
            NaiveDate::from_ymd_opt(2026, 4, 11).expect("date")
        );
    }

    #[test]
    fn spring_forward_gap_moves_to_next_day() {
        let now = New_York
            .with_ymd_and_hms(2026, 3, 8, 0, 30, 0)
            .single()
            .expect("valid");
        let next = next_fire_instant(time_of_day(2, 30), &now).expect("next");
        assert_eq!(
            next.date_naive(),
            NaiveDate::from_ymd_opt(2026, 3, 9).expect("date")
        );
    }

    #[test]
    fn fall_back_uses_first_ambiguous_instant() {
        let now = New_York
            .with_ymd_and_hms(2026, 11, 1, 0, 0, 0)
            .single()
            .expect("valid");
        let expected = match New_York.from_local_datetime(&NaiveDateTime::new(
            NaiveDate::from_ymd_opt(2026, 11, 1).expect("date"),
            time_of_day(1, 30),
        )) {
            LocalResult::Ambiguous(first, _second) => first,
            _ => panic!("expected ambiguous local time"),
        };
        let next = next_fire_instant(time_of_day(1, 30), &now).expect("next");
        assert_eq!(next, expected);
    }

    #[test]
    fn schedule_registers_one_entry_per_trigger_time() {
        let (table, scheduler) = scheduler();
        let report = scheduler
            .schedule_at(&morning_config(), &fixed_now(6, 30))
            .expect("schedule");

        assert_eq!(report.armed_count(), 4);
        assert_eq!(table.len(), 4);
        let keys = report.triggers.iter().map(|t| t.key).collect::<HashSet<_>>();
        assert_eq!(keys.len(), 4);

        // 06:00 and 06:20 already passed at 06:30.
        let first = table.get(report.triggers[0].key).expect("registered");
        assert_eq!(first.at, (fixed_now(6, 0) + chrono::Duration::days(1)).with_timezone(&Utc));
        let third = table.get(report.triggers[2].key).expect("registered");
        assert_eq!(third.at, fixed_now(6, 40).with_timezone(&Utc));
        assert_eq!(third.event.index, 2);
        assert_eq!(third.event.alarm_id.as_str(), "morning");
    }

    #[test]
    fn schedule_cancel_schedule_leaves_same_registrations() {
        let (table, scheduler) = scheduler();
        let now = fixed_now(5, 0);
        let config = morning_config();

        scheduler.schedule_at(&config, &now).expect("schedule");
        let once = table.registrations();

        scheduler.cancel(&config.id, 4);
        assert!(table.is_empty());
        scheduler.schedule_at(&config, &now).expect("schedule again");
        assert_eq!(table.registrations(), once);
    }

    #[test]
    fn disabled_config_is_an_error() {
        let (table, scheduler) = scheduler();
        let config = AlarmConfig {
            enabled: false,
            ..morning_config()
        };
        let err = scheduler
            .schedule_at(&config, &fixed_now(5, 0))
            .expect_err("disabled");
        assert!(matches!(err, SchedulerError::Disabled(_)));
        assert!(table.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_registration() {
        let (table, scheduler) = scheduler();
        let config = AlarmConfig {
            interval_minutes: 0,
            ..morning_config()
        };
        let err = scheduler
            .schedule_at(&config, &fixed_now(5, 0))
            .expect_err("invalid");
        assert!(matches!(
            err,
            SchedulerError::Validation(ValidationError::IntervalTooShort(0))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn missing_permission_fails_without_registering() {
        let (table, scheduler) = scheduler();
        table.set_exact_permission(false);
        let err = scheduler
            .schedule_at(&morning_config(), &fixed_now(5, 0))
            .expect_err("permission");
        assert!(err.is_permission_denied());
        assert!(table.is_empty());
    }

    #[test]
    fn failed_registration_rolls_back_earlier_ones() {
        let table = Arc::new(AlarmTable::with_capacity_limit(2));
        let scheduler = AlarmScheduler::new(Arc::clone(&table));
        let err = scheduler
            .schedule_at(&morning_config(), &fixed_now(5, 0))
            .expect_err("table full");
        assert!(matches!(
            err,
            SchedulerError::Platform {
                index: 2,
                source: PlatformError::TableFull { capacity: 2 },
                ..
            }
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn cancel_only_touches_own_alarm() {
        let (table, scheduler) = scheduler();
        let now = fixed_now(5, 0);
        let other = AlarmConfig::new(time_of_day(8, 0), time_of_day(9, 0), 30)
            .with_id(AlarmId::new("other"));
        scheduler.schedule_at(&morning_config(), &now).expect("schedule");
        scheduler.schedule_at(&other, &now).expect("schedule");
        assert_eq!(table.len(), 7);

        scheduler.cancel(&AlarmId::new("morning"), 4);
        let remaining = table.registrations();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|r| r.event.alarm_id.as_str() == "other"));
    }

    #[test]
    fn probe_cancel_removes_shrunk_time_sets() {
        let (table, scheduler) = scheduler();
        let now = fixed_now(5, 0);
        let dense = AlarmConfig::new(time_of_day(6, 0), time_of_day(7, 0), 5)
            .with_id(AlarmId::new("dense"));
        scheduler.schedule_at(&dense, &now).expect("schedule");
        assert_eq!(table.len(), 13);

        scheduler.cancel_probe(&dense.id);
        assert!(table.is_empty());
    }

    #[test]
    fn rearm_registers_next_day_for_fired_index() {
        let (table, scheduler) = scheduler();
        let config = morning_config();
        let fired_at = fixed_now(6, 20);
        let trigger = scheduler.rearm_at(&config, 1, &fired_at).expect("rearm");

        assert_eq!(trigger.time, time_of_day(6, 20));
        assert_eq!(
            trigger.fire_at,
            (fixed_now(6, 20) + chrono::Duration::days(1)).with_timezone(&Utc)
        );
        assert_eq!(table.get(request_key(&config.id, 1)).expect("entry").event.index, 1);
    }

    #[test]
    fn rearm_tolerates_slightly_early_delivery() {
        let (_table, scheduler) = scheduler();
        let early = fixed_now(6, 20) - chrono::Duration::seconds(2);
        let trigger = scheduler
            .rearm_at(&morning_config(), 1, &early)
            .expect("rearm");
        assert_eq!(
            trigger.fire_at,
            (fixed_now(6, 20) + chrono::Duration::days(1)).with_timezone(&Utc)
        );
    }

    #[test]
    fn rearm_rejects_index_outside_current_time_set() {
        let (table, scheduler) = scheduler();
        let err = scheduler
            .rearm_at(&morning_config(), 9, &fixed_now(6, 0))
            .expect_err("stale index");
        assert!(matches!(
            err,
            SchedulerError::IndexOutOfRange {
                index: 9,
                count: 4,
                ..
            }
        ));
        assert!(table.is_empty());
    }
}
