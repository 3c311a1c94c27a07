use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{JobOutcome, TargetApp};
use crate::error::PatchError;

/// The five states of a patch job.
///
/// Each job flows through: SELECTING → CONFIGURING → PATCHING → FINISHED | ERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Selecting,
    Configuring,
    Patching,
    Finished,
    Error,
}

impl JobState {
    /// `Finished` and `Error` have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Error)
    }

    /// Whether staged settings may still be edited.
    pub fn accepts_settings(self) -> bool {
        matches!(self, JobState::Selecting | JobState::Configuring)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Selecting => write!(f, "SELECTING"),
            JobState::Configuring => write!(f, "CONFIGURING"),
            JobState::Patching => write!(f, "PATCHING"),
            JobState::Finished => write!(f, "FINISHED"),
            JobState::Error => write!(f, "ERROR"),
        }
    }
}

/// User intents accepted by the job controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Bind (or re-bind) the application to patch.
    ConfigureTarget(TargetApp),
    /// Freeze the staged settings into job options.
    Submit,
    /// Start the engine in the background.
    Launch,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::ConfigureTarget(_) => "configure target",
            Intent::Submit => "submit",
            Intent::Launch => "launch",
        }
    }
}

/// Pure transition table for a patch job.
pub struct StateMachine;

impl StateMachine {
    /// Compute the state an intent leads to, or reject it.
    ///
    /// - `ConfigureTarget` is accepted from `Selecting` and, for re-selection,
    ///   from `Configuring`.
    /// - `Submit` is accepted only from `Configuring`.
    /// - `Launch` is accepted only from `Patching` and leaves the state as is;
    ///   the controller enforces that it happens once.
    pub fn on_intent(state: JobState, intent: &Intent) -> Result<JobState, PatchError> {
        match (state, intent) {
            (JobState::Selecting | JobState::Configuring, Intent::ConfigureTarget(_)) => {
                Ok(JobState::Configuring)
            }
            (JobState::Configuring, Intent::Submit) => Ok(JobState::Patching),
            (JobState::Patching, Intent::Launch) => Ok(JobState::Patching),
            (state, intent) => Err(PatchError::InvalidTransition {
                state,
                intent: intent.name(),
            }),
        }
    }

    /// Map the engine outcome to a terminal state. Only valid while patching.
    pub fn on_outcome(state: JobState, outcome: &JobOutcome) -> Result<JobState, PatchError> {
        match (state, outcome) {
            (JobState::Patching, JobOutcome::Success) => Ok(JobState::Finished),
            (JobState::Patching, JobOutcome::Failure(_)) => Ok(JobState::Error),
            (state, _) => Err(PatchError::InvalidTransition {
                state,
                intent: "complete",
            }),
        }
    }
}
