//! Patch engine backed by an external patcher executable.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use super::{CancelSignal, PatchEngine};
use crate::error::EngineError;
use crate::log_sink::PatchLogger;
use crate::state_machine::JobOptions;

/// Number of trailing stderr lines kept as the failure trace.
const TRACE_LINES: usize = 32;

/// Runs `program base_args... <options as arguments>` and streams its output
/// into the job log: stdout lines at Info, stderr lines at Debug.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    base_args: Vec<String>,
    output_dir: PathBuf,
    poll_interval: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args,
            output_dir: output_dir.into(),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Override how often the child is polled for exit and cancellation.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Arguments appended after `base_args` for the given options.
    pub fn arguments(&self, options: &JobOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        args.extend(options.artifact_paths.iter().map(|p| p.clone().into_os_string()));
        args.push("-o".into());
        args.push(self.output_dir.clone().into_os_string());
        if options.debuggable {
            args.push("-d".into());
        }
        args.push("-l".into());
        args.push(options.sig_bypass_level.get().to_string().into());
        if options.sign_v1 {
            args.push("--v1".into());
        }
        if options.sign_v2 {
            args.push("--v2".into());
        }
        if options.use_external_runtime {
            args.push("--manager".into());
        }
        if options.override_version_code {
            args.push("-r".into());
        }
        for module in &options.embedded_modules {
            args.push("-m".into());
            args.push(module.clone().into_os_string());
        }
        if options.verbose {
            args.push("-v".into());
        }
        args
    }

    fn wait(&self, child: &mut Child, cancel: &CancelSignal) -> Result<ExitStatus, EngineError> {
        loop {
            let status = match child.try_wait() {
                Ok(status) => status,
                Err(err) => {
                    // The reader threads only finish once the child's pipes close.
                    let _ = child.kill();
                    return Err(err.into());
                }
            };
            if let Some(status) = status {
                return Ok(status);
            }
            if cancel.is_cancelled() {
                child.kill()?;
                child.wait()?;
                return Err(EngineError::new("patch cancelled"));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl PatchEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn patch(
        &self,
        log: &dyn PatchLogger,
        options: &JobOptions,
        cancel: &CancelSignal,
    ) -> Result<(), EngineError> {
        let args = self.arguments(options);
        log.debug(&format!(
            "Running {} with {} argument(s)",
            self.program.display(),
            args.len()
        ));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::new(format!("failed to start {}: {e}", self.program.display()))
                    .with_source(e)
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_tail = Mutex::new(VecDeque::with_capacity(TRACE_LINES));

        let status = std::thread::scope(|scope| {
            if let Some(out) = stdout {
                scope.spawn(move || forward_lines(out, |line| log.info(line)));
            }
            if let Some(err) = stderr {
                let tail = &stderr_tail;
                scope.spawn(move || {
                    forward_lines(err, |line| {
                        log.debug(line);
                        let mut tail = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        if tail.len() == TRACE_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    });
                });
            }
            self.wait(&mut child, cancel)
        })?;

        if status.success() {
            return Ok(());
        }

        let tail = stderr_tail
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut err = EngineError::new(format!("{} exited with {status}", self.program.display()));
        if !tail.is_empty() {
            err = err.with_trace(Vec::from(tail).join("\n"));
        }
        Err(err)
    }
}

/// Emit each line of `stream`, decoding invalid UTF-8 lossily. Stops at EOF or
/// on a read error.
fn forward_lines(stream: impl Read, mut emit: impl FnMut(&str)) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => emit(String::from_utf8_lossy(&buf).trim_end()),
        }
    }
}
