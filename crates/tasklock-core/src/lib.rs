//! `tasklock-core`: configuration and shared error types for the tasklock
//! workspace.
//!
//! The lease protocol lives in `tasklock-lease`, the trigger clock and task
//! runner in `tasklock-scheduler`. This crate only knows how to load and
//! sanity-check the configuration both of them consume.

pub mod config;
pub mod duration;
pub mod error;

pub use config::{InstanceConfig, SchedulerConfig, StoreConfig, TaskConfig, TasklockConfig};
pub use error::{CoreError, Result};
