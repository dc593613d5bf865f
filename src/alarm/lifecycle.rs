use thiserror::Error;

use crate::alarm::model::{AlarmConfig, AlarmDraft, AlarmId, ValidationError};
use crate::alarm::scheduler::{AlarmScheduler, ScheduleReport, SchedulerError};
use crate::platform::ExactAlarmPlatform;
use crate::store::{AlarmStore, StoreError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("alarm {0} not found")]
    NotFound(AlarmId),
    #[error("alarm {0} already exists")]
    AlreadyExists(AlarmId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Schedule(#[from] SchedulerError),
}

impl LifecycleError {
    /// Short message for the user. Validation and permission problems are
    /// spelled out; storage and registration failures stay generic.
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::Validation(err)
            | LifecycleError::Schedule(SchedulerError::Validation(err)) => err.to_string(),
            LifecycleError::Schedule(err) if err.is_permission_denied() => {
                "Exact alarm permission is required to schedule alarms".to_string()
            }
            LifecycleError::NotFound(_) | LifecycleError::AlreadyExists(_) => self.to_string(),
            LifecycleError::Store(_) | LifecycleError::Schedule(_) => {
                "Could not update alarms, please try again".to_string()
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub armed: Vec<(AlarmId, usize)>,
    pub disarmed: Vec<AlarmId>,
    pub failed: Vec<(AlarmId, LifecycleError)>,
}

/// Keeps OS registrations in step with the store. Every mutation persists
/// first and then cancels and re-registers; there is no incremental diff.
pub struct LifecycleCoordinator<S, P> {
    store: S,
    scheduler: AlarmScheduler<P>,
}

impl<S, P> LifecycleCoordinator<S, P>
where
    S: AlarmStore,
    P: ExactAlarmPlatform,
{
    pub fn new(store: S, scheduler: AlarmScheduler<P>) -> Self {
        Self { store, scheduler }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn scheduler(&self) -> &AlarmScheduler<P> {
        &self.scheduler
    }

    pub fn list(&self) -> Result<Vec<AlarmConfig>, LifecycleError> {
        Ok(self.store.get_all()?)
    }

    pub fn create(&self, config: AlarmConfig) -> Result<AlarmConfig, LifecycleError> {
        let config = if config.id.is_empty() {
            config.with_id(AlarmId::generate())
        } else {
            config
        };
        config.validate()?;
        if self.store.get(&config.id)?.is_some() {
            return Err(LifecycleError::AlreadyExists(config.id));
        }

        self.store.put(config.clone())?;
        tracing::info!(alarm_id = %config.id, enabled = config.enabled, "alarm created");
        if config.enabled {
            self.arm(&config)?;
        }
        Ok(config)
    }

    pub fn update(&self, config: AlarmConfig) -> Result<AlarmConfig, LifecycleError> {
        if self.store.get(&config.id)?.is_none() {
            return Err(LifecycleError::NotFound(config.id));
        }
        config.validate()?;

        self.store.put(config.clone())?;
        self.disarm(&config.id)?;
        tracing::info!(alarm_id = %config.id, enabled = config.enabled, "alarm updated");
        if config.enabled {
            self.arm(&config)?;
        }
        Ok(config)
    }

    pub fn edit(&self, id: &AlarmId, draft: &AlarmDraft) -> Result<AlarmConfig, LifecycleError> {
        let current = self
            .store
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        self.update(current.with_changes(draft))
    }

    pub fn toggle(&self, id: &AlarmId) -> Result<AlarmConfig, LifecycleError> {
        let current = self
            .store
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        self.set_enabled(id, !current.enabled)
    }

    pub fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<AlarmConfig, LifecycleError> {
        if !self.store.set_enabled(id, enabled)? {
            return Err(LifecycleError::NotFound(id.clone()));
        }
        let config = self
            .store
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;

        self.disarm(id)?;
        tracing::info!(alarm_id = %id, enabled, "alarm toggled");
        if enabled {
            self.arm(&config)?;
        }
        Ok(config)
    }

    pub fn delete(&self, id: &AlarmId) -> Result<(), LifecycleError> {
        if self.store.get(id)?.is_none() {
            return Err(LifecycleError::NotFound(id.clone()));
        }
        self.disarm(id)?;
        self.store.delete(id)?;
        tracing::info!(alarm_id = %id, "alarm deleted");
        Ok(())
    }

    /// Cancel every registration and disable every config. Configs are kept
    /// so they can be re-enabled later. Returns how many were enabled.
    pub fn stop_all(&self) -> Result<usize, LifecycleError> {
        let mut disabled = 0;
        for config in self.store.get_all()? {
            self.disarm(&config.id)?;
            if config.enabled {
                self.store.set_enabled(&config.id, false)?;
                disabled += 1;
            }
        }
        tracing::info!(disabled, "all alarms stopped");
        Ok(disabled)
    }

    /// Rebuild registrations after a process or device restart. One failing
    /// alarm does not keep the others from being armed.
    pub fn restore_all(&self) -> Result<RestoreReport, LifecycleError> {
        let mut report = RestoreReport::default();
        for config in self.store.get_all()? {
            let result = self.disarm(&config.id).and_then(|()| {
                if config.enabled {
                    self.arm(&config).map(|armed| Some(armed.armed_count()))
                } else {
                    Ok(None)
                }
            });
            match result {
                Ok(Some(count)) => report.armed.push((config.id, count)),
                Ok(None) => report.disarmed.push(config.id),
                Err(err) => {
                    tracing::warn!(alarm_id = %config.id, error = %err, "restore failed");
                    report.failed.push((config.id, err));
                }
            }
        }
        tracing::info!(
            armed = report.armed.len(),
            disarmed = report.disarmed.len(),
            failed = report.failed.len(),
            "alarms restored"
        );
        Ok(report)
    }

    /// The count is written before registering so a crash in between leaves
    /// a count that still covers every registration.
    fn arm(&self, config: &AlarmConfig) -> Result<ScheduleReport, LifecycleError> {
        let count = config.trigger_times()?.len();
        self.store.set_armed_count(&config.id, count)?;
        match self.scheduler.schedule(config) {
            Ok(report) => Ok(report),
            Err(err) => {
                self.store.set_armed_count(&config.id, 0)?;
                Err(err.into())
            }
        }
    }

    fn disarm(&self, id: &AlarmId) -> Result<(), LifecycleError> {
        match self.store.armed_count(id)? {
            Some(0) => {}
            Some(count) => {
                self.scheduler.cancel(id, count);
            }
            None => {
                self.scheduler.cancel_probe(id);
            }
        }
        self.store.set_armed_count(id, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::alarm::fire::{FireEvent, FireHandler, FireOutcome, SuppressReason};
    use crate::alarm::model::{AlarmRecord, time_of_day};
    use crate::alarm::scheduler::request_key;
    use crate::effects::Ringer;
    use crate::effects::fake::RecordingEffects;
    use crate::platform::AlarmTable;
    use crate::store::MemoryAlarmStore;

    type Coordinator = LifecycleCoordinator<Arc<MemoryAlarmStore>, Arc<AlarmTable>>;

    fn setup() -> (Arc<MemoryAlarmStore>, Arc<AlarmTable>, Coordinator) {
        let store = Arc::new(MemoryAlarmStore::new());
        let table = Arc::new(AlarmTable::new());
        let coordinator =
            LifecycleCoordinator::new(Arc::clone(&store), AlarmScheduler::new(Arc::clone(&table)));
        (store, table, coordinator)
    }

    fn fire_handler(
        store: &Arc<MemoryAlarmStore>,
        table: &Arc<AlarmTable>,
    ) -> FireHandler<Arc<MemoryAlarmStore>, Arc<AlarmTable>, RecordingEffects> {
        FireHandler::new(
            Arc::clone(store),
            AlarmScheduler::new(Arc::clone(table)),
            Ringer::new(RecordingEffects::default()),
        )
    }

    fn morning() -> AlarmConfig {
        AlarmConfig::new(time_of_day(6, 0), time_of_day(7, 0), 20)
    }

    fn keys_of(table: &AlarmTable) -> HashSet<i32> {
        table.registrations().iter().map(|r| r.key).collect()
    }

    #[test]
    fn create_assigns_id_persists_and_arms() {
        let (store, table, coordinator) = setup();
        let created = coordinator
            .create(morning().with_id(AlarmId::new("")))
            .expect("create");

        assert!(!created.id.is_empty());
        assert_eq!(store.get(&created.id).expect("get"), Some(created.clone()));
        assert_eq!(store.armed_count(&created.id).expect("count"), Some(4));
        assert_eq!(table.len(), 4);
        assert_eq!(keys_of(&table).len(), 4);
        let indices = table
            .registrations()
            .iter()
            .map(|r| r.event.index)
            .collect::<HashSet<_>>();
        assert_eq!(indices, HashSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn create_keeps_caller_id_and_rejects_duplicates() {
        let (_store, _table, coordinator) = setup();
        let config = morning().with_id(AlarmId::new("fixed"));
        coordinator.create(config.clone()).expect("create");
        let err = coordinator.create(config).expect_err("duplicate");
        assert!(matches!(err, LifecycleError::AlreadyExists(_)));
    }

    #[test]
    fn create_disabled_persists_without_arming() {
        let (store, table, coordinator) = setup();
        let created = coordinator
            .create(AlarmConfig {
                enabled: false,
                ..morning()
            })
            .expect("create");
        assert!(store.get(&created.id).expect("get").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn create_rejects_invalid_config_before_persisting() {
        let (store, table, coordinator) = setup();
        let err = coordinator
            .create(AlarmConfig::new(time_of_day(9, 0), time_of_day(8, 0), 30))
            .expect_err("reversed range");
        assert!(matches!(
            err,
            LifecycleError::Validation(ValidationError::EndNotAfterStart { .. })
        ));
        assert!(store.get_all().expect("all").is_empty());
        assert!(table.is_empty());
        assert!(err.user_message().contains("must be after start time"));
    }

    #[test]
    fn update_replaces_registrations_when_time_set_shrinks() {
        let (store, table, coordinator) = setup();
        let created = coordinator
            .create(AlarmConfig::new(time_of_day(6, 0), time_of_day(7, 0), 5))
            .expect("create");
        assert_eq!(table.len(), 13);

        let updated = coordinator
            .update(AlarmConfig {
                interval_minutes: 30,
                ..created.clone()
            })
            .expect("update");
        assert_eq!(table.len(), 3);
        assert_eq!(store.armed_count(&updated.id).expect("count"), Some(3));
        assert!(table.get(request_key(&created.id, 12)).is_none());
    }

    #[test]
    fn update_unknown_alarm_is_not_found() {
        let (_store, _table, coordinator) = setup();
        let err = coordinator
            .update(morning().with_id(AlarmId::new("ghost")))
            .expect_err("missing");
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[test]
    fn edit_applies_draft_to_stored_config() {
        let (_store, table, coordinator) = setup();
        let created = coordinator.create(morning()).expect("create");
        let edited = coordinator
            .edit(
                &created.id,
                &AlarmDraft {
                    end_time: Some(time_of_day(6, 40)),
                    ..AlarmDraft::default()
                },
            )
            .expect("edit");
        assert_eq!(edited.id, created.id);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn toggle_off_cancels_and_toggle_on_rearms() {
        let (store, table, coordinator) = setup();
        let created = coordinator.create(morning()).expect("create");
        let before = keys_of(&table);

        let off = coordinator.toggle(&created.id).expect("toggle off");
        assert!(!off.enabled);
        assert!(table.is_empty());
        assert_eq!(store.armed_count(&created.id).expect("count"), Some(0));

        let on = coordinator.toggle(&created.id).expect("toggle on");
        assert!(on.enabled);
        assert_eq!(keys_of(&table), before);
    }

    #[test]
    fn toggle_off_then_stale_fire_is_suppressed() {
        let (store, table, coordinator) = setup();
        let created = coordinator.create(morning()).expect("create");
        let stale = table.registrations()[0].event.clone();

        coordinator.toggle(&created.id).expect("toggle off");
        let mut handler = fire_handler(&store, &table);
        let outcome = handler.on_fire(&stale).expect("fire");
        assert_eq!(outcome, FireOutcome::Suppressed(SuppressReason::Disabled));
    }

    #[test]
    fn delete_cancels_and_later_fire_is_suppressed() {
        let (store, table, coordinator) = setup();
        let created = coordinator.create(morning()).expect("create");
        let stale = FireEvent {
            alarm_id: created.id.clone(),
            index: 2,
        };

        coordinator.delete(&created.id).expect("delete");
        assert!(table.is_empty());
        assert!(store.get(&created.id).expect("get").is_none());

        let mut handler = fire_handler(&store, &table);
        assert_eq!(
            handler.on_fire(&stale).expect("fire"),
            FireOutcome::Suppressed(SuppressReason::NotFound)
        );
        assert!(matches!(
            coordinator.delete(&created.id),
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[test]
    fn stop_all_disables_and_keeps_configs() {
        let (store, table, coordinator) = setup();
        coordinator.create(morning()).expect("create");
        coordinator
            .create(AlarmConfig::new(time_of_day(20, 0), time_of_day(21, 0), 30))
            .expect("create");
        coordinator
            .create(AlarmConfig {
                enabled: false,
                ..morning()
            })
            .expect("create");

        assert_eq!(coordinator.stop_all().expect("stop all"), 2);
        assert!(table.is_empty());
        let configs = store.get_all().expect("all");
        assert_eq!(configs.len(), 3);
        assert!(configs.iter().all(|config| !config.enabled));
    }

    #[test]
    fn restore_rebuilds_registrations_from_store() {
        let store = Arc::new(MemoryAlarmStore::with_records(vec![
            AlarmRecord {
                config: morning().with_id(AlarmId::new("legacy")),
                armed_count: None,
            },
            AlarmRecord::new(AlarmConfig {
                enabled: false,
                ..morning().with_id(AlarmId::new("off"))
            }),
        ]));
        let table = Arc::new(AlarmTable::new());
        let coordinator =
            LifecycleCoordinator::new(Arc::clone(&store), AlarmScheduler::new(Arc::clone(&table)));

        let report = coordinator.restore_all().expect("restore");
        assert_eq!(report.armed, vec![(AlarmId::new("legacy"), 4)]);
        assert_eq!(report.disarmed, vec![AlarmId::new("off")]);
        assert!(report.failed.is_empty());
        assert_eq!(table.len(), 4);
        assert_eq!(store.armed_count(&AlarmId::new("legacy")).expect("count"), Some(4));
    }

    #[test]
    fn permission_denied_keeps_config_unarmed() {
        let (store, table, coordinator) = setup();
        table.set_exact_permission(false);
        let config = morning().with_id(AlarmId::new("p"));
        let err = coordinator.create(config.clone()).expect_err("permission");

        assert!(matches!(err, LifecycleError::Schedule(ref e) if e.is_permission_denied()));
        assert_eq!(
            err.user_message(),
            "Exact alarm permission is required to schedule alarms"
        );
        assert_eq!(store.get(&config.id).expect("get"), Some(config.clone()));
        assert_eq!(store.armed_count(&config.id).expect("count"), Some(0));
        assert!(table.is_empty());

        table.set_exact_permission(true);
        coordinator.set_enabled(&config.id, true).expect("re-enable");
        assert_eq!(table.len(), 4);
    }

    struct FlakyStore {
        inner: MemoryAlarmStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            Ok(())
        }
    }

    impl AlarmStore for FlakyStore {
        fn get(&self, id: &AlarmId) -> Result<Option<AlarmConfig>, StoreError> {
            self.inner.get(id)
        }

        fn get_all(&self) -> Result<Vec<AlarmConfig>, StoreError> {
            self.inner.get_all()
        }

        fn put(&self, config: AlarmConfig) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put(config)
        }

        fn delete(&self, id: &AlarmId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.delete(id)
        }

        fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.set_enabled(id, enabled)
        }

        fn armed_count(&self, id: &AlarmId) -> Result<Option<usize>, StoreError> {
            self.inner.armed_count(id)
        }

        fn set_armed_count(&self, id: &AlarmId, count: usize) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.set_armed_count(id, count)
        }
    }

    #[test]
    fn store_failure_propagates_without_registering() {
        let store = Arc::new(FlakyStore {
            inner: MemoryAlarmStore::new(),
            fail_writes: AtomicBool::new(true),
        });
        let table = Arc::new(AlarmTable::new());
        let coordinator =
            LifecycleCoordinator::new(Arc::clone(&store), AlarmScheduler::new(Arc::clone(&table)));

        let err = coordinator.create(morning()).expect_err("store down");
        assert!(matches!(err, LifecycleError::Store(_)));
        assert_eq!(err.user_message(), "Could not update alarms, please try again");
        assert!(table.is_empty());
    }
}
