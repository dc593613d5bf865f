use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::alarm::time_set::compute_trigger_times;

pub const ALARM_FILE_VERSION: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 24 * 60;

const DEFAULT_START: NaiveTime = match NaiveTime::from_hms_opt(6, 30, 0) {
    Some(time) => time,
    None => panic!("default start time out of range"),
};
const DEFAULT_END: NaiveTime = match NaiveTime::from_hms_opt(22, 0, 0) {
    Some(time) => time,
    None => panic!("default end time out of range"),
};

/// Opaque identifier of one interval alarm. Never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(String);

impl AlarmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("interval must be at least 1 minute, got {0}")]
    IntervalTooShort(u32),
    #[error("interval must be at most 1440 minutes, got {0}")]
    IntervalTooLong(u32),
    #[error(
        "end time {} must be after start time {}",
        .end.format("%H:%M"),
        .start.format("%H:%M")
    )]
    EndNotAfterStart { start: NaiveTime, end: NaiveTime },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmConfig {
    pub id: AlarmId,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub interval_minutes: u32,
    pub enabled: bool,
    pub vibration_enabled: bool,
    /// Empty means the system default alarm sound.
    pub alarm_sound_uri: String,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            id: AlarmId::generate(),
            start_time: DEFAULT_START,
            end_time: DEFAULT_END,
            interval_minutes: 60,
            enabled: true,
            vibration_enabled: true,
            alarm_sound_uri: String::new(),
        }
    }
}

impl AlarmConfig {
    pub fn new(start_time: NaiveTime, end_time: NaiveTime, interval_minutes: u32) -> Self {
        Self {
            start_time: truncate_to_minute(start_time),
            end_time: truncate_to_minute(end_time),
            interval_minutes,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: AlarmId) -> Self {
        self.id = id;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_minutes == 0 {
            return Err(ValidationError::IntervalTooShort(self.interval_minutes));
        }
        if self.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(ValidationError::IntervalTooLong(self.interval_minutes));
        }
        if truncate_to_minute(self.start_time) >= truncate_to_minute(self.end_time) {
            return Err(ValidationError::EndNotAfterStart {
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    pub fn trigger_times(&self) -> Result<Vec<NaiveTime>, ValidationError> {
        compute_trigger_times(self.start_time, self.end_time, self.interval_minutes)
    }

    /// Copy-with-changes; the id is carried over untouched.
    pub fn with_changes(&self, draft: &AlarmDraft) -> Self {
        Self {
            id: self.id.clone(),
            start_time: draft
                .start_time
                .map(truncate_to_minute)
                .unwrap_or(self.start_time),
            end_time: draft
                .end_time
                .map(truncate_to_minute)
                .unwrap_or(self.end_time),
            interval_minutes: draft.interval_minutes.unwrap_or(self.interval_minutes),
            enabled: draft.enabled.unwrap_or(self.enabled),
            vibration_enabled: draft.vibration_enabled.unwrap_or(self.vibration_enabled),
            alarm_sound_uri: draft
                .alarm_sound_uri
                .clone()
                .unwrap_or_else(|| self.alarm_sound_uri.clone()),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} - {} ({} min interval)",
            self.start_time.format("%H:%M"),
            self.end_time.format("%H:%M"),
            self.interval_minutes
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmDraft {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub interval_minutes: Option<u32>,
    pub enabled: Option<bool>,
    pub vibration_enabled: Option<bool>,
    pub alarm_sound_uri: Option<String>,
}

impl AlarmDraft {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One persisted alarm plus the number of OS registrations its last
/// schedule produced. `None` means the count was never recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRecord {
    pub config: AlarmConfig,
    pub armed_count: Option<usize>,
}

impl AlarmRecord {
    pub fn new(config: AlarmConfig) -> Self {
        Self {
            config,
            armed_count: Some(0),
        }
    }
}

#[cfg(test)]
pub(crate) fn time_of_day(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time of day")
}

pub fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

pub fn parse_time_of_day(input: &str) -> Result<NaiveTime> {
    let trimmed = input.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map(truncate_to_minute)
        .with_context(|| format!("invalid time of day '{input}', expected HH:MM"))
}

pub fn load_alarm_file(path: &Path) -> Result<Vec<AlarmRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read alarm file {}", path.display()))?;
    parse_alarm_file_text(&content)
}

pub fn parse_alarm_file_text(content: &str) -> Result<Vec<AlarmRecord>> {
    let raw = serde_json::from_str::<AlarmFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != ALARM_FILE_VERSION {
        bail!(
            "unsupported alarm file version {}; expected version {ALARM_FILE_VERSION}",
            raw.version
        );
    }

    let mut ids = HashSet::new();
    let mut records = Vec::with_capacity(raw.alarms.len());
    for alarm in raw.alarms {
        if alarm.id.trim().is_empty() {
            bail!("alarm entries must have a non-empty id");
        }
        if !ids.insert(alarm.id.clone()) {
            bail!("duplicate alarm id found: {}", alarm.id);
        }

        let config = AlarmConfig {
            id: AlarmId::new(alarm.id.clone()),
            start_time: parse_time_of_day(&alarm.start_time)?,
            end_time: parse_time_of_day(&alarm.end_time)?,
            interval_minutes: alarm.interval_minutes,
            enabled: alarm.enabled,
            vibration_enabled: alarm.vibration_enabled,
            alarm_sound_uri: alarm.alarm_sound_uri,
        };
        config
            .validate()
            .with_context(|| format!("alarm '{}' is invalid", alarm.id))?;

        records.push(AlarmRecord {
            config,
            armed_count: alarm.armed_count,
        });
    }

    Ok(records)
}

pub fn render_alarm_file(records: &[AlarmRecord]) -> Result<String> {
    let payload = AlarmFile {
        version: ALARM_FILE_VERSION,
        alarms: records
            .iter()
            .map(|record| AlarmEntry {
                id: record.config.id.to_string(),
                start_time: record.config.start_time.format("%H:%M").to_string(),
                end_time: record.config.end_time.format("%H:%M").to_string(),
                interval_minutes: record.config.interval_minutes,
                enabled: record.config.enabled,
                vibration_enabled: record.config.vibration_enabled,
                alarm_sound_uri: record.config.alarm_sound_uri.clone(),
                armed_count: record.armed_count,
            })
            .collect(),
    };
    let text = serde_json::to_string_pretty(&payload)?;
    Ok(format!("{text}\n"))
}

pub fn save_alarm_file(path: &Path, records: &[AlarmRecord]) -> Result<()> {
    let text = render_alarm_file(records)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create directory {}", parent.display()))?;
    }
    fs::write(path, text)
        .with_context(|| format!("unable to write alarm file {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct AlarmFile {
    version: u32,
    #[serde(default)]
    alarms: Vec<AlarmEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AlarmEntry {
    id: String,
    start_time: String,
    end_time: String,
    interval_minutes: u32,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    vibration_enabled: bool,
    #[serde(default)]
    alarm_sound_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    armed_count: Option<usize>,
}

fn default_true() -> bool {
    true
}
