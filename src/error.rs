use std::error::Error as StdError;
use std::fmt::Write as _;

use thiserror::Error;

use crate::state_machine::JobState;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot {intent} while {state}")]
    InvalidTransition { state: JobState, intent: &'static str },

    #[error("Job settings are frozen while {0}")]
    SettingsFrozen(JobState),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Signature bypass level {0} is out of range (0..=2)")]
    SigBypassLevel(u8),

    #[error("No Tokio runtime available to launch the patch job")]
    NoRuntime,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure raised by a patch engine.
///
/// The controller never inspects anything beyond [`EngineError::to_string`]
/// and [`EngineError::diagnostic`]; both end up in the job log.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
    trace: Option<String>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
            source: None,
        }
    }

    /// Attach an engine-provided diagnostic trace (stderr tail, stack dump, ...).
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// Full diagnostic text for postmortem: the engine trace when present,
    /// otherwise the message followed by its source chain.
    pub fn diagnostic(&self) -> String {
        if let Some(trace) = &self.trace {
            return trace.clone();
        }
        let mut out = format!("EngineError: {}", self.message);
        let mut cause = StdError::source(self);
        while let Some(err) = cause {
            let _ = write!(out, "\n  caused by: {err}");
            cause = err.source();
        }
        out
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = PatchError::InvalidTransition {
            state: JobState::Patching,
            intent: "submit",
        };
        assert_eq!(err.to_string(), "Cannot submit while PATCHING");
    }

    #[test]
    fn diagnostic_prefers_engine_trace() {
        let err = EngineError::new("boom").with_trace("at step 3\nat step 2");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.diagnostic(), "at step 3\nat step 2");
    }

    #[test]
    fn diagnostic_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "base.apk missing");
        let err = EngineError::new("cannot open input").with_source(io);
        let diag = err.diagnostic();
        assert!(diag.starts_with("EngineError: cannot open input"));
        assert!(diag.contains("caused by: base.apk missing"));
    }

    #[test]
    fn io_error_converts() {
        let err: EngineError = std::io::Error::other("disk full").into();
        assert_eq!(err.message(), "disk full");
        assert!(err.trace().is_none());
    }
}
