//! User-visible side effects of a firing alarm: notification, looping sound
//! and vibration.

use thiserror::Error;

use crate::alarm::model::{AlarmConfig, AlarmId};

pub const ALARM_TITLE: &str = "Alarm";
pub const STOP_ACTION: &str = "Stop";
/// Off/on pairs in milliseconds, repeated until stopped.
pub const VIBRATION_PATTERN_MS: [u64; 6] = [0, 1000, 500, 1000, 500, 1000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundSource {
    SystemDefault,
    Uri(String),
}

impl SoundSource {
    pub fn from_uri(uri: &str) -> Self {
        if uri.trim().is_empty() {
            SoundSource::SystemDefault
        } else {
            SoundSource::Uri(uri.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmNotification {
    pub alarm_id: AlarmId,
    pub title: String,
    pub body: String,
    pub actions: Vec<String>,
}

impl AlarmNotification {
    pub fn for_config(config: &AlarmConfig) -> Self {
        Self {
            alarm_id: config.id.clone(),
            title: ALARM_TITLE.to_string(),
            body: config.describe(),
            actions: vec![STOP_ACTION.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("sound unavailable: {0}")]
    SoundUnavailable(String),
}

/// Device-side effects. Implementations wrap the notification service,
/// the media player and the vibrator.
pub trait AlarmEffects {
    fn present(&mut self, notification: &AlarmNotification);
    fn dismiss(&mut self, alarm_id: &AlarmId);
    fn play_looping_sound(&mut self, source: &SoundSource) -> Result<(), EffectError>;
    fn stop_sound(&mut self);
    fn vibrate(&mut self, pattern: &[u64]);
    fn stop_vibration(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveRing {
    alarm_id: AlarmId,
    vibrating: bool,
}

/// Owns the one alarm that may be ringing. Starting a new ring stops and
/// releases the previous one first.
#[derive(Debug)]
pub struct Ringer<E> {
    effects: E,
    active: Option<ActiveRing>,
}

impl<E: AlarmEffects> Ringer<E> {
    pub fn new(effects: E) -> Self {
        Self {
            effects,
            active: None,
        }
    }

    pub fn effects(&self) -> &E {
        &self.effects
    }

    pub fn active_alarm(&self) -> Option<&AlarmId> {
        self.active.as_ref().map(|ring| &ring.alarm_id)
    }

    pub fn ring(&mut self, config: &AlarmConfig) {
        if let Some(previous) = self.active.take() {
            self.release(previous);
        }

        self.effects
            .present(&AlarmNotification::for_config(config));

        let source = SoundSource::from_uri(&config.alarm_sound_uri);
        if let Err(err) = self.effects.play_looping_sound(&source) {
            tracing::warn!(alarm_id = %config.id, error = %err, "alarm sound failed");
            if source != SoundSource::SystemDefault
                && let Err(err) = self.effects.play_looping_sound(&SoundSource::SystemDefault)
            {
                tracing::warn!(alarm_id = %config.id, error = %err, "default sound failed");
            }
        }

        if config.vibration_enabled {
            self.effects.vibrate(&VIBRATION_PATTERN_MS);
        }

        self.active = Some(ActiveRing {
            alarm_id: config.id.clone(),
            vibrating: config.vibration_enabled,
        });
    }

    /// Stop the ringing alarm if it is `alarm_id`. Future registrations are
    /// untouched. Returns false when that alarm is not ringing.
    pub fn stop(&mut self, alarm_id: &AlarmId) -> bool {
        match self.active.take() {
            Some(active) if active.alarm_id == *alarm_id => {
                self.release(active);
                true
            }
            other => {
                self.active = other;
                false
            }
        }
    }

    fn release(&mut self, ring: ActiveRing) {
        self.effects.stop_sound();
        if ring.vibrating {
            self.effects.stop_vibration();
        }
        self.effects.dismiss(&ring.alarm_id);
        tracing::debug!(alarm_id = %ring.alarm_id, "ring released");
    }
}

/// Effects that only log; used by the CLI where no device is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEffects;

impl AlarmEffects for LogEffects {
    fn present(&mut self, notification: &AlarmNotification) {
        tracing::info!(
            alarm_id = %notification.alarm_id,
            title = %notification.title,
            body = %notification.body,
            "notification shown"
        );
    }

    fn dismiss(&mut self, alarm_id: &AlarmId) {
        tracing::info!(alarm_id = %alarm_id, "notification dismissed");
    }

    fn play_looping_sound(&mut self, source: &SoundSource) -> Result<(), EffectError> {
        tracing::info!(source = ?source, "sound started");
        Ok(())
    }

    fn stop_sound(&mut self) {
        tracing::info!("sound stopped");
    }

    fn vibrate(&mut self, pattern: &[u64]) {
        tracing::info!(pattern = ?pattern, "vibration started");
    }

    fn stop_vibration(&mut self) {
        tracing::info!("vibration stopped");
    }
}
