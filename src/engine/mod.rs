//! Contract between the job controller and the patch engine.

mod command;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use command::CommandEngine;

use crate::error::EngineError;
use crate::log_sink::PatchLogger;
use crate::state_machine::JobOptions;

/// Performs the actual package transformation.
///
/// `patch` is synchronous; the controller runs it on Tokio's blocking pool.
/// Everything the engine wants the user to see goes through `log`.
pub trait PatchEngine: Send + Sync + 'static {
    /// Returns the name of this engine implementation.
    fn name(&self) -> &str;

    /// Patch the artifacts described by `options`.
    ///
    /// Long-running engines should poll `cancel` and bail out once it is set;
    /// ignoring it is allowed, the controller still cleans up afterwards.
    fn patch(
        &self,
        log: &dyn PatchLogger,
        options: &JobOptions,
        cancel: &CancelSignal,
    ) -> Result<(), EngineError>;
}

/// Cancellation request shared between a controller and its running engine.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
