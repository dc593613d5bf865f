//! Durable alarm records keyed by [`AlarmId`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::alarm::model::{AlarmConfig, AlarmId, AlarmRecord, load_alarm_file, save_alarm_file};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0:#}")]
    File(anyhow::Error),
    #[error("alarm store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam. Reads must observe every completed write.
pub trait AlarmStore {
    fn get(&self, id: &AlarmId) -> Result<Option<AlarmConfig>, StoreError>;
    fn get_all(&self) -> Result<Vec<AlarmConfig>, StoreError>;
    /// Insert or replace by id; an existing record keeps its armed count.
    fn put(&self, config: AlarmConfig) -> Result<(), StoreError>;
    /// Returns false when no record had that id.
    fn delete(&self, id: &AlarmId) -> Result<bool, StoreError>;
    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<bool, StoreError>;
    /// `Ok(None)` when the record is missing or its count was never recorded.
    fn armed_count(&self, id: &AlarmId) -> Result<Option<usize>, StoreError>;
    fn set_armed_count(&self, id: &AlarmId, count: usize) -> Result<bool, StoreError>;
}

impl<S: AlarmStore + ?Sized> AlarmStore for Arc<S> {
    fn get(&self, id: &AlarmId) -> Result<Option<AlarmConfig>, StoreError> {
        (**self).get(id)
    }

    fn get_all(&self) -> Result<Vec<AlarmConfig>, StoreError> {
        (**self).get_all()
    }

    fn put(&self, config: AlarmConfig) -> Result<(), StoreError> {
        (**self).put(config)
    }

    fn delete(&self, id: &AlarmId) -> Result<bool, StoreError> {
        (**self).delete(id)
    }

    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<bool, StoreError> {
        (**self).set_enabled(id, enabled)
    }

    fn armed_count(&self, id: &AlarmId) -> Result<Option<usize>, StoreError> {
        (**self).armed_count(id)
    }

    fn set_armed_count(&self, id: &AlarmId, count: usize) -> Result<bool, StoreError> {
        (**self).set_armed_count(id, count)
    }
}

fn upsert(records: &mut Vec<AlarmRecord>, config: AlarmConfig) {
    match records
        .iter_mut()
        .find(|record| record.config.id == config.id)
    {
        Some(existing) => existing.config = config,
        None => records.push(AlarmRecord::new(config)),
    }
}

fn find_mut<'a>(records: &'a mut [AlarmRecord], id: &AlarmId) -> Option<&'a mut AlarmRecord> {
    records.iter_mut().find(|record| record.config.id == *id)
}

#[derive(Debug, Default)]
pub struct MemoryAlarmStore {
    records: Mutex<Vec<AlarmRecord>>,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<AlarmRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn records(&self) -> Vec<AlarmRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AlarmRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn get(&self, id: &AlarmId) -> Result<Option<AlarmConfig>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .find(|record| record.config.id == *id)
            .map(|record| record.config.clone()))
    }

    fn get_all(&self) -> Result<Vec<AlarmConfig>, StoreError> {
        Ok(self.lock().iter().map(|record| record.config.clone()).collect())
    }

    fn put(&self, config: AlarmConfig) -> Result<(), StoreError> {
        upsert(&mut self.lock(), config);
        Ok(())
    }

    fn delete(&self, id: &AlarmId) -> Result<bool, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|record| record.config.id != *id);
        Ok(records.len() != before)
    }

    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<bool, StoreError> {
        Ok(match find_mut(&mut self.lock(), id) {
            Some(record) => {
                record.config.enabled = enabled;
                true
            }
            None => false,
        })
    }

    fn armed_count(&self, id: &AlarmId) -> Result<Option<usize>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .find(|record| record.config.id == *id)
            .and_then(|record| record.armed_count))
    }

    fn set_armed_count(&self, id: &AlarmId, count: usize) -> Result<bool, StoreError> {
        Ok(match find_mut(&mut self.lock(), id) {
            Some(record) => {
                record.armed_count = Some(count);
                true
            }
            None => false,
        })
    }
}

/// JSON-file store. Every call re-reads the file so a process that only
/// handles fire events sees edits made elsewhere; writes replace the file.
#[derive(Debug)]
pub struct JsonFileAlarmStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileAlarmStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        self.load()
    }

    fn load(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        load_alarm_file(&self.path).map_err(StoreError::File)
    }

    fn modify<T>(
        &self,
        change: impl FnOnce(&mut Vec<AlarmRecord>) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut records = self.load()?;
        let result = change(&mut records);
        save_alarm_file(&self.path, &records).map_err(StoreError::File)?;
        Ok(result)
    }
}

impl AlarmStore for JsonFileAlarmStore {
    fn get(&self, id: &AlarmId) -> Result<Option<AlarmConfig>, StoreError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|record| record.config.id == *id)
            .map(|record| record.config))
    }

    fn get_all(&self) -> Result<Vec<AlarmConfig>, StoreError> {
        Ok(self.load()?.into_iter().map(|record| record.config).collect())
    }

    fn put(&self, config: AlarmConfig) -> Result<(), StoreError> {
        self.modify(|records| upsert(records, config))
    }

    fn delete(&self, id: &AlarmId) -> Result<bool, StoreError> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|record| record.config.id != *id);
            records.len() != before
        })
    }

    fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<bool, StoreError> {
        self.modify(|records| match find_mut(records, id) {
            Some(record) => {
                record.config.enabled = enabled;
                true
            }
            None => false,
        })
    }

    fn armed_count(&self, id: &AlarmId) -> Result<Option<usize>, StoreError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|record| record.config.id == *id)
            .and_then(|record| record.armed_count))
    }

    fn set_armed_count(&self, id: &AlarmId, count: usize) -> Result<bool, StoreError> {
        self.modify(|records| match find_mut(records, id) {
            Some(record) => {
                record.armed_count = Some(count);
                true
            }
            None => false,
        })
    }
}
