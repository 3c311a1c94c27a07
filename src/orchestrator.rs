use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{CancelSignal, PatchEngine};
use crate::error::PatchError;
use crate::log_sink::{LogSink, PatchLogger, Severity};
use crate::state_machine::{
    Intent, JobOptions, JobOutcome, JobReport, JobSettings, JobState, StateMachine, TargetApp,
    build_options,
};

/// Drives one patch job from target selection to its terminal state.
///
/// All transitions go through a single mutex, so `dispatch` can be called
/// from any thread while the engine is still writing to the log.
pub struct JobController {
    id: Uuid,
    core: Arc<Mutex<JobCore>>,
    state_tx: Arc<watch::Sender<JobState>>,
    log: LogSink,
    engine: Arc<dyn PatchEngine>,
    tmp_dir: PathBuf,
    cancel: CancelSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Mutable job data guarded by the controller's sequence point.
struct JobCore {
    state: JobState,
    history: Vec<JobState>,
    target: Option<TargetApp>,
    defaults: JobSettings,
    settings: JobSettings,
    options: Option<Arc<JobOptions>>,
    launched: bool,
    created_at: DateTime<Utc>,
    launched_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl JobCore {
    /// Move to `next`, recording history and notifying watchers.
    fn enter(&mut self, next: JobState, state_tx: &watch::Sender<JobState>) {
        if next == self.state {
            return;
        }
        self.history.push(self.state);
        self.state = next;
        state_tx.send_replace(next);
    }
}

impl JobController {
    /// Create a controller in `Selecting`.
    ///
    /// `tmp_dir` is emptied once the job finishes, whatever the outcome.
    pub fn new(engine: Arc<dyn PatchEngine>, tmp_dir: impl Into<PathBuf>, log: LogSink) -> Self {
        let (state_tx, _) = watch::channel(JobState::Selecting);
        Self {
            id: Uuid::new_v4(),
            core: Arc::new(Mutex::new(JobCore {
                state: JobState::Selecting,
                history: Vec::new(),
                target: None,
                defaults: JobSettings::default(),
                settings: JobSettings::default(),
                options: None,
                launched: false,
                created_at: Utc::now(),
                launched_at: None,
                completed_at: None,
                failure: None,
            })),
            state_tx: Arc::new(state_tx),
            log,
            engine,
            tmp_dir: tmp_dir.into(),
            cancel: CancelSignal::new(),
            task: Mutex::new(None),
        }
    }

    /// Replace the default settings; they are also staged immediately.
    pub fn with_defaults(self, defaults: JobSettings) -> Self {
        {
            let mut core = self.lock_core();
            core.settings = defaults.clone();
            core.defaults = defaults;
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.lock_core().state
    }

    /// Watch channel that yields every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn logs(&self) -> &LogSink {
        &self.log
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn target(&self) -> Option<TargetApp> {
        self.lock_core().target.clone()
    }

    pub fn settings(&self) -> JobSettings {
        self.lock_core().settings.clone()
    }

    /// Frozen options, available once submitted.
    pub fn options(&self) -> Option<Arc<JobOptions>> {
        self.lock_core().options.clone()
    }

    /// Edit staged settings. Rejected once the job has been submitted.
    pub fn update_settings<F>(&self, f: F) -> Result<(), PatchError>
    where
        F: FnOnce(&mut JobSettings),
    {
        let mut core = self.lock_core();
        if !core.state.accepts_settings() {
            return Err(PatchError::SettingsFrozen(core.state));
        }
        f(&mut core.settings);
        Ok(())
    }

    /// Single entry point for user intents.
    pub fn dispatch(&self, intent: Intent) -> Result<(), PatchError> {
        let core = self.lock_core();
        let next = StateMachine::on_intent(core.state, &intent)?;
        match intent {
            Intent::ConfigureTarget(app) => self.apply_target(core, app, next),
            Intent::Submit => self.apply_submit(core, next),
            Intent::Launch => self.apply_launch(core),
        }
    }

    /// Bind the application to patch. Re-selecting while configuring resets
    /// staged settings to the defaults.
    pub fn configure_target(&self, app: TargetApp) -> Result<(), PatchError> {
        self.dispatch(Intent::ConfigureTarget(app))
    }

    /// Freeze staged settings into [`JobOptions`] and move to `Patching`.
    pub fn submit(&self) -> Result<(), PatchError> {
        self.dispatch(Intent::Submit)
    }

    /// Start the engine on a background task and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn launch(&self) -> Result<(), PatchError> {
        self.dispatch(Intent::Launch)
    }

    fn apply_target(
        &self,
        mut core: MutexGuard<'_, JobCore>,
        app: TargetApp,
        next: JobState,
    ) -> Result<(), PatchError> {
        debug!(job_id = %self.id, package = app.package_name(), "configuring patch");
        if core.state == JobState::Configuring {
            core.settings = core.defaults.clone();
        }
        core.target = Some(app);
        core.enter(next, &self.state_tx);
        Ok(())
    }

    fn apply_submit(&self, mut core: MutexGuard<'_, JobCore>, next: JobState) -> Result<(), PatchError> {
        let target = core.target.clone().ok_or(PatchError::InvalidTransition {
            state: core.state,
            intent: "submit",
        })?;

        debug!(job_id = %self.id, "submit patch");
        if core.settings.use_external_runtime {
            core.settings.embedded_modules.clear();
        }
        core.options = Some(Arc::new(build_options(&target, &core.settings)));
        core.enter(next, &self.state_tx);
        Ok(())
    }

    fn apply_launch(&self, mut core: MutexGuard<'_, JobCore>) -> Result<(), PatchError> {
        if core.launched {
            return Err(PatchError::InvalidTransition {
                state: core.state,
                intent: "launch",
            });
        }
        let options = core.options.clone().ok_or(PatchError::InvalidTransition {
            state: core.state,
            intent: "launch",
        })?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PatchError::NoRuntime)?;

        core.launched = true;
        core.launched_at = Some(Utc::now());
        self.log.info("Launch patch");
        info!(job_id = %self.id, engine = self.engine.name(), "launching patch job");

        let run = JobRun {
            job_id: self.id,
            core: Arc::clone(&self.core),
            state_tx: Arc::clone(&self.state_tx),
            log: self.log.clone(),
            engine: Arc::clone(&self.engine),
            options,
            tmp_dir: self.tmp_dir.clone(),
            cancel: self.cancel.clone(),
        };
        let handle = runtime.spawn(run.execute());
        drop(core);

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Wait until the job reaches a terminal state and return it.
    ///
    /// Returns the current state right away if the job was never launched.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.subscribe_state();
        {
            let core = self.lock_core();
            if !core.launched && !core.state.is_terminal() {
                return core.state;
            }
        }
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Summary of the job so far.
    pub fn report(&self) -> JobReport {
        let core = self.lock_core();
        let mut transitions = core.history.clone();
        transitions.push(core.state);
        JobReport {
            job_id: self.id,
            package_name: core.target.as_ref().map(|t| t.package_name().to_string()),
            state: core.state,
            state_transitions: transitions,
            options: core.options.as_deref().cloned(),
            created_at: core.created_at,
            launched_at: core.launched_at,
            completed_at: core.completed_at,
            duration_ms: core
                .launched_at
                .zip(core.completed_at)
                .map(|(start, end)| (end - start).num_milliseconds()),
            log_entries: self.log.len(),
            error_entries: self.log.count(Severity::Error),
            failure: core.failure.clone(),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, JobCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobController {
    /// Ask a running engine to stop. The background task is left alone so
    /// that it still empties the temporary directory.
    fn drop(&mut self) {
        let running = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if running {
            debug!(job_id = %self.id, "controller dropped while patching; requesting cancellation");
            self.cancel.cancel();
        }
    }
}

/// Everything the background task needs, detached from the controller.
struct JobRun {
    job_id: Uuid,
    core: Arc<Mutex<JobCore>>,
    state_tx: Arc<watch::Sender<JobState>>,
    log: LogSink,
    engine: Arc<dyn PatchEngine>,
    options: Arc<JobOptions>,
    tmp_dir: PathBuf,
    cancel: CancelSignal,
}

impl JobRun {
    async fn execute(self) {
        let engine = Arc::clone(&self.engine);
        let log = self.log.clone();
        let options = Arc::clone(&self.options);
        let cancel = self.cancel.clone();
        let cleanup = TempDirCleanup::new(self.tmp_dir.clone());
        let joined = tokio::task::spawn_blocking(move || {
            // Dropped after the engine returns or unwinds, even if this task
            // is torn down while the engine is still running.
            let _cleanup = cleanup;
            engine.patch(&log, &options, &cancel)
        })
        .await;

        let outcome = match joined {
            Ok(Ok(())) => JobOutcome::Success,
            Ok(Err(err)) => {
                let message = err.to_string();
                self.log.error(&message);
                self.log.error(&err.diagnostic());
                JobOutcome::Failure(message)
            }
            Err(join_err) => {
                let (message, trace) = if join_err.is_panic() {
                    let message = panic_message(join_err.into_panic());
                    let trace = format!("{} engine panicked: {message}", self.engine.name());
                    (message, trace)
                } else {
                    let message = "patch engine task was cancelled".to_string();
                    let trace = format!("{} engine did not return: {join_err}", self.engine.name());
                    (message, trace)
                };
                self.log.error(&message);
                self.log.error(&trace);
                JobOutcome::Failure(message)
            }
        };

        self.finalize(outcome);
    }

    fn finalize(&self, outcome: JobOutcome) {
        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match StateMachine::on_outcome(core.state, &outcome) {
            Ok(next) => next,
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "dropping engine outcome");
                return;
            }
        };

        core.completed_at = Some(Utc::now());
        if let JobOutcome::Failure(message) = outcome {
            core.failure = Some(message);
        }
        core.enter(next, &self.state_tx);
        info!(job_id = %self.job_id, state = %next, "patch job finished");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "patch engine panicked".to_string()
    }
}

/// Empties the temporary-artifact directory when dropped.
///
/// Owned by the blocking engine call, so the directory is cleared once the
/// engine has stopped writing to it. An engine that never returns is never
/// cleaned up after.
struct TempDirCleanup {
    dir: PathBuf,
}

impl TempDirCleanup {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Drop for TempDirCleanup {
    fn drop(&mut self) {
        clear_dir(&self.dir);
    }
}

/// Delete every entry in `dir`, returning how many were removed.
///
/// Best effort: failures are logged and skipped, a missing directory is empty.
pub fn clear_dir(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot list temporary directory");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "failed to delete temporary file"),
        }
    }
    debug!(dir = %dir.display(), removed, "temporary directory cleared");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::log_sink::LogEntry;
    use std::time::Duration;

    enum Behavior {
        Succeed,
        Fail(&'static str),
        Panic,
        WaitForCancel,
    }

    /// Engine double that logs a few lines and drops a file into the tmp dir.
    struct MockEngine {
        tmp_dir: PathBuf,
        behavior: Behavior,
    }

    impl PatchEngine for MockEngine {
        fn name(&self) -> &str {
            "mock"
        }

        fn patch(
            &self,
            log: &dyn PatchLogger,
            options: &JobOptions,
            cancel: &CancelSignal,
        ) -> Result<(), EngineError> {
            log.debug("unpacking");
            log.info(&format!("patching {} artifact(s)", options.artifact_paths.len()));
            std::fs::write(self.tmp_dir.join("work.apk"), b"partial")?;
            std::fs::create_dir_all(self.tmp_dir.join("extracted"))?;
            std::fs::write(self.tmp_dir.join("extracted").join("classes.dex"), b"dex")?;
            match self.behavior {
                Behavior::Succeed => {
                    log.info("done");
                    Ok(())
                }
                Behavior::Fail(msg) => Err(EngineError::new(msg).with_trace("trace: step 2")),
                Behavior::Panic => panic!("engine exploded"),
                Behavior::WaitForCancel => {
                    for _ in 0..500 {
                        if cancel.is_cancelled() {
                            return Err(EngineError::new("patch cancelled"));
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(EngineError::new("never cancelled"))
                }
            }
        }
    }

    fn controller(dir: &tempfile::TempDir, behavior: Behavior, verbose: bool) -> JobController {
        let engine = Arc::new(MockEngine {
            tmp_dir: dir.path().to_path_buf(),
            behavior,
        });
        JobController::new(engine, dir.path(), LogSink::new(verbose))
    }

    fn target() -> TargetApp {
        TargetApp::new("Demo", "com.example.demo", PathBuf::from("base.pkg"), vec![])
    }

    fn aux() -> TargetApp {
        TargetApp::new(
            "Aux",
            "com.example.aux",
            PathBuf::from("aux.pkg"),
            vec![PathBuf::from("aux.split.pkg")],
        )
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn successful_job_finishes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, true);

        ctl.dispatch(Intent::ConfigureTarget(target())).unwrap();
        ctl.dispatch(Intent::Submit).unwrap();
        ctl.dispatch(Intent::Launch).unwrap();

        assert_eq!(ctl.wait().await, JobState::Finished);
        assert!(dir_is_empty(dir.path()));
        assert_eq!(
            ctl.logs().snapshot(),
            vec![
                LogEntry::new(Severity::Info, "Launch patch"),
                LogEntry::new(Severity::Debug, "unpacking"),
                LogEntry::new(Severity::Info, "patching 1 artifact(s)"),
                LogEntry::new(Severity::Info, "done"),
            ]
        );

        let report = ctl.report();
        assert_eq!(
            report.state_transitions,
            vec![
                JobState::Selecting,
                JobState::Configuring,
                JobState::Patching,
                JobState::Finished
            ]
        );
        assert_eq!(report.package_name.as_deref(), Some("com.example.demo"));
        assert!(report.completed_at.is_some());
        assert!(report.failure.is_none());
    }

    #[tokio::test]
    async fn failing_job_logs_message_and_trace() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Fail("boom"), false);

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();

        assert_eq!(ctl.wait().await, JobState::Error);
        assert!(dir_is_empty(dir.path()));

        let entries = ctl.logs().snapshot();
        let tail = &entries[entries.len() - 2..];
        assert_eq!(tail[0].severity, Severity::Error);
        assert!(tail[0].message.contains("boom"));
        assert_eq!(tail[1], LogEntry::new(Severity::Error, "trace: step 2"));
        // Debug entries were gated out.
        assert!(entries.iter().all(|e| e.severity != Severity::Debug));

        let report = ctl.report();
        assert_eq!(report.failure.as_deref(), Some("boom"));
        assert_eq!(report.error_entries, 2);
    }

    #[tokio::test]
    async fn panicking_engine_maps_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Panic, false);

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();

        assert_eq!(ctl.wait().await, JobState::Error);
        assert!(dir_is_empty(dir.path()));
        let entries = ctl.logs().snapshot();
        let tail = &entries[entries.len() - 2..];
        assert!(tail.iter().all(|e| e.severity == Severity::Error));
        assert_eq!(tail[0].message, "engine exploded");
    }

    #[tokio::test]
    async fn state_watchers_see_terminal_state_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);
        let mut rx = ctl.subscribe_state();

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();

        let state = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(state, JobState::Finished);
        // Terminal means every engine entry is already in the log.
        assert_eq!(ctl.logs().snapshot().last().unwrap().message, "done");
        assert!(ctl.launch().is_err());
        assert_eq!(ctl.state(), JobState::Finished);
    }

    #[tokio::test]
    async fn double_submit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        let err = ctl.submit().unwrap_err();
        assert!(matches!(
            err,
            PatchError::InvalidTransition {
                state: JobState::Patching,
                intent: "submit"
            }
        ));
        assert_eq!(ctl.state(), JobState::Patching);
        assert!(ctl.logs().is_empty());
    }

    #[tokio::test]
    async fn second_launch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();
        assert!(matches!(
            ctl.launch(),
            Err(PatchError::InvalidTransition { intent: "launch", .. })
        ));
        assert_eq!(ctl.wait().await, JobState::Finished);
        assert_eq!(ctl.logs().count(Severity::Info), 3);
    }

    #[test]
    fn intents_out_of_order_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        assert!(ctl.submit().is_err());
        assert!(ctl.launch().is_err());
        assert_eq!(ctl.state(), JobState::Selecting);

        ctl.configure_target(target()).unwrap();
        assert!(ctl.launch().is_err());
        assert_eq!(ctl.state(), JobState::Configuring);
    }

    #[test]
    fn launch_outside_runtime_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);
        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();

        assert!(matches!(ctl.launch(), Err(PatchError::NoRuntime)));
        assert!(ctl.logs().is_empty());
        assert!(ctl.report().launched_at.is_none());
    }

    #[test]
    fn settings_freeze_on_submit() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        ctl.update_settings(|s| s.debuggable = true).unwrap();
        ctl.configure_target(target()).unwrap();
        ctl.update_settings(|s| s.sign_v1 = true).unwrap();
        ctl.submit().unwrap();

        let err = ctl.update_settings(|s| s.debuggable = false).unwrap_err();
        assert!(matches!(err, PatchError::SettingsFrozen(JobState::Patching)));

        let options = ctl.options().unwrap();
        assert!(options.debuggable);
        assert!(options.sign_v1);
        assert!(matches!(
            ctl.configure_target(target()),
            Err(PatchError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reselecting_target_resets_staged_settings() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        ctl.configure_target(target()).unwrap();
        ctl.update_settings(|s| {
            s.debuggable = true;
            s.embedded_modules.push(aux());
        })
        .unwrap();
        ctl.configure_target(aux()).unwrap();

        assert_eq!(ctl.state(), JobState::Configuring);
        assert_eq!(ctl.target().unwrap().package_name(), "com.example.aux");
        assert_eq!(ctl.settings(), JobSettings::default());
    }

    #[test]
    fn external_runtime_clears_staged_modules_at_submit() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        ctl.configure_target(target()).unwrap();
        ctl.update_settings(|s| {
            s.use_external_runtime = true;
            s.embedded_modules.push(aux());
        })
        .unwrap();
        // Staged until submit, even with the flag already set.
        assert_eq!(ctl.settings().embedded_modules.len(), 1);

        ctl.submit().unwrap();
        assert!(ctl.settings().embedded_modules.is_empty());
        assert!(ctl.options().unwrap().embedded_modules.is_empty());
    }

    #[test]
    fn embedded_modules_are_frozen_into_options() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);

        ctl.configure_target(target()).unwrap();
        ctl.update_settings(|s| {
            s.use_external_runtime = false;
            s.embedded_modules.push(aux());
        })
        .unwrap();
        ctl.submit().unwrap();

        let options = ctl.options().unwrap();
        assert_eq!(options.artifact_paths, vec![PathBuf::from("base.pkg")]);
        assert_eq!(
            options.embedded_modules,
            vec![PathBuf::from("aux.pkg"), PathBuf::from("aux.split.pkg")]
        );
    }

    #[test]
    fn custom_defaults_are_staged() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = JobSettings {
            sign_v1: true,
            ..Default::default()
        };
        let ctl = controller(&dir, Behavior::Succeed, false).with_defaults(defaults.clone());
        assert_eq!(ctl.settings(), defaults);

        ctl.configure_target(target()).unwrap();
        ctl.update_settings(|s| s.sign_v1 = false).unwrap();
        ctl.configure_target(target()).unwrap();
        assert!(ctl.settings().sign_v1);
    }

    #[tokio::test]
    async fn wait_without_launch_returns_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::Succeed, false);
        ctl.configure_target(target()).unwrap();
        assert_eq!(ctl.wait().await, JobState::Configuring);
    }

    #[tokio::test]
    async fn dropped_controller_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir, Behavior::WaitForCancel, false);
        let log = ctl.logs().clone();
        let mut rx = ctl.subscribe_state();

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();

        // Let the engine create its files before abandoning the job.
        for _ in 0..200 {
            if dir.path().join("work.apk").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(ctl);

        let state = *tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, JobState::Error);
        assert!(dir_is_empty(dir.path()));
        assert!(log
            .snapshot()
            .iter()
            .any(|e| e.severity == Severity::Error && e.message == "patch cancelled"));
    }

    /// Leaves a file inside a read-only subdirectory so that cleanup cannot
    /// delete it (unless running as root).
    #[cfg(unix)]
    struct LockedDirEngine {
        tmp_dir: PathBuf,
        fail: bool,
    }

    #[cfg(unix)]
    impl PatchEngine for LockedDirEngine {
        fn name(&self) -> &str {
            "locked"
        }

        fn patch(
            &self,
            log: &dyn PatchLogger,
            _options: &JobOptions,
            _cancel: &CancelSignal,
        ) -> Result<(), EngineError> {
            use std::os::unix::fs::PermissionsExt;

            let locked = self.tmp_dir.join("locked");
            std::fs::create_dir_all(&locked)?;
            std::fs::write(locked.join("stuck.apk"), b"stuck")?;
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555))?;
            log.info("wrote locked artifact");
            if self.fail {
                Err(EngineError::new("sign failed").with_trace("trace: sign"))
            } else {
                Ok(())
            }
        }
    }

    #[cfg(unix)]
    fn unlock(dir: &Path) {
        use std::os::unix::fs::PermissionsExt;

        let locked = dir.join("locked");
        if locked.exists() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_cleanup_does_not_change_success() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(LockedDirEngine {
            tmp_dir: dir.path().to_path_buf(),
            fail: false,
        });
        let ctl = JobController::new(engine, dir.path(), LogSink::new(true));

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();

        assert_eq!(ctl.wait().await, JobState::Finished);
        assert_eq!(
            ctl.logs().snapshot(),
            vec![
                LogEntry::new(Severity::Info, "Launch patch"),
                LogEntry::new(Severity::Info, "wrote locked artifact"),
            ]
        );
        let report = ctl.report();
        assert!(report.failure.is_none());
        assert_eq!(report.error_entries, 0);
        unlock(dir.path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_cleanup_does_not_mask_engine_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(LockedDirEngine {
            tmp_dir: dir.path().to_path_buf(),
            fail: true,
        });
        let ctl = JobController::new(engine, dir.path(), LogSink::new(true));

        ctl.configure_target(target()).unwrap();
        ctl.submit().unwrap();
        ctl.launch().unwrap();

        assert_eq!(ctl.wait().await, JobState::Error);
        assert_eq!(
            ctl.logs().snapshot(),
            vec![
                LogEntry::new(Severity::Info, "Launch patch"),
                LogEntry::new(Severity::Info, "wrote locked artifact"),
                LogEntry::new(Severity::Error, "sign failed"),
                LogEntry::new(Severity::Error, "trace: sign"),
            ]
        );
        assert_eq!(ctl.report().failure.as_deref(), Some("sign failed"));
        unlock(dir.path());
    }

    #[test]
    fn clear_dir_handles_missing_and_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clear_dir(&dir.path().join("absent")), 0);

        std::fs::write(dir.path().join("a.apk"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.apk"), b"b").unwrap();
        assert_eq!(clear_dir(dir.path()), 2);
        assert!(dir_is_empty(dir.path()));
        assert!(dir.path().exists());
    }
}
