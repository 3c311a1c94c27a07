//! Interface de terminal do patchctl — spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job de patch no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use patchctl::log_sink::{LogEntry, Severity};
use patchctl::state_machine::{JobReport, JobState};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado durante o patch e imprime cada entrada do log
/// com um prefixo colorido por severidade.
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para sucesso.
    green: Style,
    // Estilo vermelho para erros.
    red: Style,
    // Estilo esmaecido para entradas Debug.
    dim: Style,
    // Estilo ciano para entradas Info.
    cyan: Style,
}

impl JobProgress {
    /// Inicia o spinner com o pacote alvo e retorna a instância de progresso.
    pub fn start(package: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{}: {package}", JobState::Patching));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
            cyan: Style::new().cyan(),
        }
    }

    /// Imprime uma entrada do log acima do spinner.
    pub fn entry(&self, entry: &LogEntry) {
        let prefix = match entry.severity {
            Severity::Debug => self.dim.apply_to("D"),
            Severity::Info => self.cyan.apply_to("I"),
            Severity::Error => self.red.apply_to("E"),
        };
        self.pb.println(format!("  {prefix} {}", entry.message));
    }

    /// Avisa que o terminal perdeu entradas por não acompanhar o ritmo do log.
    pub fn lagged(&self, skipped: u64) {
        self.pb.println(format!(
            "  {} {skipped} log entries skipped",
            self.dim.apply_to("…")
        ));
    }

    /// Finaliza o spinner e exibe o estado terminal do job.
    pub fn complete(&self, state: JobState) {
        self.pb.finish_and_clear();
        match state {
            JobState::Finished => {
                println!("  {} Patch finished", self.green.apply_to("✓"));
            }
            other => {
                println!("  {} Patch ended in {other}", self.red.apply_to("✗"));
            }
        }
    }

    /// Imprime o relatório do job formatado em JSON com estilo colorido.
    pub fn print_report(&self, report: &JobReport) {
        let status_style = match report.state {
            JobState::Finished => &self.green,
            _ => &self.red,
        };
        println!();
        println!("{}", status_style.apply_to("─── Job Report ───"));
        match report.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("  {} {err}", self.red.apply_to("✗")),
        }
    }
}
