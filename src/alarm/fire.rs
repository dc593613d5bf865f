use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::model::{AlarmConfig, AlarmId};
use crate::alarm::scheduler::AlarmScheduler;
use crate::effects::{AlarmEffects, Ringer};
use crate::platform::{AlarmTable, ExactAlarmPlatform, Registration};
use crate::store::{AlarmStore, StoreError};

/// Delay before a delivery that failed on the store is tried again.
pub const DELIVERY_RETRY_SECS: i64 = 5;

/// Payload carried by every OS registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FireEvent {
    pub alarm_id: AlarmId,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Deleted after the registration was made.
    NotFound,
    Disabled,
    /// The config was edited and its time set no longer has this index.
    StaleIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Effected {
        config: AlarmConfig,
        rearmed_at: Option<DateTime<Utc>>,
    },
    Suppressed(SuppressReason),
}

impl FireOutcome {
    pub fn is_effected(&self) -> bool {
        matches!(self, FireOutcome::Effected { .. })
    }
}

/// One registration popped from the table and what handling it produced.
#[derive(Debug)]
pub struct Delivery {
    pub event: FireEvent,
    pub result: Result<FireOutcome, StoreError>,
    /// Set when the event was put back for a later attempt.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Entry point for delivered alarms. Holds no state from the session that
/// registered the alarm: the config is looked up again on every event.
pub struct FireHandler<S, P, E> {
    store: S,
    scheduler: AlarmScheduler<P>,
    ringer: Ringer<E>,
}

impl<S, P, E> FireHandler<S, P, E>
where
    S: AlarmStore,
    P: ExactAlarmPlatform,
    E: AlarmEffects,
{
    pub fn new(store: S, scheduler: AlarmScheduler<P>, ringer: Ringer<E>) -> Self {
        Self {
            store,
            scheduler,
            ringer,
        }
    }

    pub fn ringer(&self) -> &Ringer<E> {
        &self.ringer
    }

    pub fn on_fire(&mut self, event: &FireEvent) -> Result<FireOutcome, StoreError> {
        self.on_fire_at(event, &Local::now())
    }

    pub fn on_fire_at<Tz>(
        &mut self,
        event: &FireEvent,
        now: &DateTime<Tz>,
    ) -> Result<FireOutcome, StoreError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        let Some(config) = self.store.get(&event.alarm_id)? else {
            tracing::info!(alarm_id = %event.alarm_id, index = event.index, "suppressed: alarm deleted");
            return Ok(FireOutcome::Suppressed(SuppressReason::NotFound));
        };
        if !config.enabled {
            tracing::info!(alarm_id = %event.alarm_id, index = event.index, "suppressed: alarm disabled");
            return Ok(FireOutcome::Suppressed(SuppressReason::Disabled));
        }
        let in_time_set = config
            .trigger_times()
            .map(|times| event.index < times.len())
            .unwrap_or(false);
        if !in_time_set {
            tracing::info!(alarm_id = %event.alarm_id, index = event.index, "suppressed: stale trigger");
            return Ok(FireOutcome::Suppressed(SuppressReason::StaleIndex));
        }

        self.ringer.ring(&config);

        let rearmed_at = match self.scheduler.rearm_at(&config, event.index, now) {
            Ok(trigger) => Some(trigger.fire_at),
            Err(err) => {
                tracing::warn!(alarm_id = %config.id, index = event.index, error = %err, "re-arm failed");
                None
            }
        };
        tracing::info!(alarm_id = %config.id, index = event.index, ?rearmed_at, "alarm fired");
        Ok(FireOutcome::Effected { config, rearmed_at })
    }

    /// Pop every registration due at `now` and handle it. An event whose
    /// handling fails on the store goes back into the table unless its key
    /// was registered again in the meantime.
    pub fn deliver_due<Tz>(&mut self, table: &AlarmTable, now: &DateTime<Tz>) -> Vec<Delivery>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        let now_utc = now.with_timezone(&Utc);
        table
            .take_due(now_utc)
            .into_iter()
            .map(|registration| {
                let result = self.on_fire_at(&registration.event, now);
                let retry_at = match &result {
                    Err(err) if table.get(registration.key).is_none() => {
                        retry_later(table, &registration, now_utc, err)
                    }
                    _ => None,
                };
                Delivery {
                    event: registration.event,
                    result,
                    retry_at,
                }
            })
            .collect()
    }

    /// Stop-single-alarm signal: ends the ring for `alarm_id` without
    /// touching its future registrations.
    pub fn stop(&mut self, alarm_id: &AlarmId) -> bool {
        self.ringer.stop(alarm_id)
    }
}

fn retry_later(
    table: &AlarmTable,
    registration: &Registration,
    now: DateTime<Utc>,
    err: &StoreError,
) -> Option<DateTime<Utc>> {
    let alarm_id = &registration.event.alarm_id;
    let at = now + chrono::Duration::seconds(DELIVERY_RETRY_SECS);
    match table.register_exact(at, registration.key, registration.event.clone()) {
        Ok(()) => {
            tracing::warn!(%alarm_id, error = %err, %at, "delivery failed, retrying");
            Some(at)
        }
        Err(register_err) => {
            tracing::error!(
                %alarm_id,
                error = %err,
                retry_error = %register_err,
                "delivery failed, trigger dropped"
            );
            None
        }
    }
}
