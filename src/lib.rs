//! Patch job controller.
//!
//! A [`JobController`] takes one job from target selection through a frozen
//! set of [`JobOptions`] to a background run of a [`PatchEngine`], collecting
//! the engine's output in a [`LogSink`] and emptying the temporary-artifact
//! directory once the job ends.

pub mod config;
pub mod engine;
pub mod error;
pub mod log_sink;
pub mod orchestrator;
pub mod state_machine;

pub use config::PatchConfig;
pub use engine::{CancelSignal, CommandEngine, PatchEngine};
pub use error::{EngineError, PatchError};
pub use log_sink::{LogEntry, LogSink, PatchLogger, Severity};
pub use orchestrator::{JobController, clear_dir};
pub use state_machine::{
    Intent, JobOptions, JobReport, JobSettings, JobState, SigBypassLevel, TargetApp,
    build_options,
};
