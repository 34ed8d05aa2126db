//! Charcoal: asynchronous unit conversion and formatting for measurement
//! displays.
//!
//! Measurements are converted into each user's preferred unit and precision
//! on a background worker pool. Results are delivered per display element,
//! and a result that has been superseded is never delivered.

pub mod binding;
pub mod config;
pub mod error;
pub mod job;
pub mod measurement;
pub mod precision;
pub mod scheduler;
pub mod storage;
pub mod units;

pub use binding::{BoundElement, DisplayBinding, DisplayUpdate, Resolution};
pub use config::Config;
pub use error::CharcoalError;
pub use job::{ConversionJob, ElementId};
pub use measurement::Measurement;
pub use scheduler::{ConversionScheduler, Delivery, SchedulerConfig, SchedulerStats, SubmitOutcome};
pub use storage::{PreferenceChange, PreferenceStore};
pub use units::{Converter, UnitModel};
