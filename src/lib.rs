//! Interval alarms: one logical alarm expands into a series of exact
//! wall-clock triggers between a start and an end time.

pub mod alarm;
pub mod effects;
pub mod platform;
pub mod store;
