//! Exact one-shot alarm registration, the part of the host OS the scheduler
//! talks to.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::alarm::fire::FireEvent;

/// Deterministic key of one OS registration, derived from `(alarm id, index)`.
pub type RequestKey = i32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("exact alarm permission not granted")]
    PermissionDenied,
    #[error("alarm table is full ({capacity} registrations)")]
    TableFull { capacity: usize },
}

/// Host alarm service. Registering an existing key replaces it; cancelling
/// an unknown key is a silent no-op.
pub trait ExactAlarmPlatform {
    fn can_schedule_exact(&self) -> bool;

    /// Register a wake-capable exact alarm that delivers `event` at `at`.
    fn register_exact(
        &self,
        at: DateTime<Utc>,
        key: RequestKey,
        event: FireEvent,
    ) -> Result<(), PlatformError>;

    fn cancel(&self, key: RequestKey);
}

impl<P: ExactAlarmPlatform + ?Sized> ExactAlarmPlatform for Arc<P> {
    fn can_schedule_exact(&self) -> bool {
        (**self).can_schedule_exact()
    }

    fn register_exact(
        &self,
        at: DateTime<Utc>,
        key: RequestKey,
        event: FireEvent,
    ) -> Result<(), PlatformError> {
        (**self).register_exact(at, key, event)
    }

    fn cancel(&self, key: RequestKey) {
        (**self).cancel(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub key: RequestKey,
    pub at: DateTime<Utc>,
    pub event: FireEvent,
}

#[derive(Debug)]
struct TableState {
    exact_permission: bool,
    capacity: Option<usize>,
    entries: BTreeMap<RequestKey, Registration>,
    displaced: usize,
}

/// In-process alarm table. Backs the `run` loop and the tests; due entries
/// are popped with [`AlarmTable::take_due`] and delivered once.
#[derive(Debug)]
pub struct AlarmTable {
    state: Mutex<TableState>,
}

impl Default for AlarmTable {
    fn default() -> Self {
        Self {
            state: Mutex::new(TableState {
                exact_permission: true,
                capacity: None,
                entries: BTreeMap::new(),
                displaced: 0,
            }),
        }
    }
}

impl AlarmTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: usize) -> Self {
        let table = Self::default();
        table.lock().capacity = Some(capacity);
        table
    }

    pub fn set_exact_permission(&self, granted: bool) {
        self.lock().exact_permission = granted;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn get(&self, key: RequestKey) -> Option<Registration> {
        self.lock().entries.get(&key).cloned()
    }

    /// All live registrations ordered by fire instant, then key.
    pub fn registrations(&self) -> Vec<Registration> {
        let mut entries = self.lock().entries.values().cloned().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.key.cmp(&b.key)));
        entries
    }

    /// How many registrations were overwritten by a different alarm's
    /// registration under the same key.
    pub fn displaced_count(&self) -> usize {
        self.lock().displaced
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().entries.values().map(|entry| entry.at).min()
    }

    /// Remove and return every registration due at or before `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Registration> {
        let mut state = self.lock();
        let due_keys = state
            .entries
            .values()
            .filter(|entry| entry.at <= now)
            .map(|entry| entry.key)
            .collect::<Vec<_>>();
        let mut due = due_keys
            .into_iter()
            .filter_map(|key| state.entries.remove(&key))
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.key.cmp(&b.key)));
        due
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExactAlarmPlatform for AlarmTable {
    fn can_schedule_exact(&self) -> bool {
        self.lock().exact_permission
    }

    fn register_exact(
        &self,
        at: DateTime<Utc>,
        key: RequestKey,
        event: FireEvent,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if !state.exact_permission {
            return Err(PlatformError::PermissionDenied);
        }
        if let Some(capacity) = state.capacity
            && !state.entries.contains_key(&key)
            && state.entries.len() >= capacity
        {
            return Err(PlatformError::TableFull { capacity });
        }
        let owner = event.alarm_id.clone();
        if let Some(previous) = state.entries.insert(key, Registration { key, at, event })
            && previous.event.alarm_id != owner
        {
            tracing::warn!(
                key,
                displaced = %previous.event.alarm_id,
                by = %owner,
                "request key shared by two alarms"
            );
            state.displaced += 1;
        }
        Ok(())
    }

    fn cancel(&self, key: RequestKey) {
        self.lock().entries.remove(&key);
    }
}
