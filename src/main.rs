mod cli;
mod ui;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, PatchArgs};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use patchctl::{
    CommandEngine, Intent, JobController, JobState, LogSink, PatchConfig, SigBypassLevel,
    TargetApp, clear_dir,
};
use ui::JobProgress;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PATCHCTL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => PatchConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PatchConfig::load().context("failed to load patchctl.toml")?,
    };
    config.verbose |= cli.verbose;

    match cli.command {
        Command::Patch(args) => run_patch(&config, &args).await,
        Command::Clean => {
            let removed = clear_dir(&config.tmp_dir);
            println!("Removed {removed} entries from {}", config.tmp_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_patch(config: &PatchConfig, args: &PatchArgs) -> Result<ExitCode> {
    std::fs::create_dir_all(&config.tmp_dir)
        .with_context(|| format!("failed to create {}", config.tmp_dir.display()))?;

    let engine = CommandEngine::new(
        &config.engine.program,
        config.engine.args.clone(),
        &config.output_dir,
    );
    let controller = JobController::new(
        Arc::new(engine),
        &config.tmp_dir,
        LogSink::new(config.verbose),
    )
    .with_defaults(config.defaults.clone());

    let label = args.label.clone().unwrap_or_else(|| args.package.clone());
    let target = TargetApp::new(label, &args.package, args.base.clone(), args.splits.clone());
    controller.dispatch(Intent::ConfigureTarget(target))?;

    let modules = args
        .module_artifacts()
        .into_iter()
        .enumerate()
        .map(|(i, artifacts)| TargetApp::from_artifacts(format!("module {i}"), format!("module-{i}"), artifacts))
        .collect::<Result<Vec<_>, _>>()?;
    let sig_bypass_level = args
        .sig_bypass_level
        .map(SigBypassLevel::try_from)
        .transpose()?;
    controller.update_settings(|s| {
        s.embedded_modules = modules;
        if args.embed {
            s.use_external_runtime = false;
        }
        s.debuggable |= args.debuggable;
        s.override_version_code |= args.override_version_code;
        s.sign_v1 |= args.v1;
        if args.no_v2 {
            s.sign_v2 = false;
        }
        if let Some(level) = sig_bypass_level {
            s.sig_bypass_level = level;
        }
    })?;

    controller.dispatch(Intent::Submit)?;

    let progress = JobProgress::start(&args.package);
    let (backlog, mut log_rx) = controller.logs().snapshot_and_subscribe();
    for entry in &backlog {
        progress.entry(entry);
    }
    controller.dispatch(Intent::Launch)?;

    let state = loop {
        tokio::select! {
            received = log_rx.recv() => match received {
                Ok(entry) => progress.entry(&entry),
                Err(RecvError::Lagged(skipped)) => progress.lagged(skipped),
                Err(RecvError::Closed) => break controller.wait().await,
            },
            state = controller.wait() => break state,
        }
    };
    // Every entry is in the log before the terminal state is published.
    loop {
        match log_rx.try_recv() {
            Ok(entry) => progress.entry(&entry),
            Err(TryRecvError::Lagged(skipped)) => progress.lagged(skipped),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    progress.complete(state);
    progress.print_report(&controller.report());

    Ok(if state == JobState::Finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
