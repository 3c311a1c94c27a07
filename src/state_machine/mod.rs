mod job;
mod state;

pub use job::{
    JobOptions, JobOutcome, JobReport, JobSettings, SigBypassLevel, TargetApp, build_options,
};
pub use state::{Intent, JobState, StateMachine};
