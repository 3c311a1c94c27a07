//! Interface de linha de comando do patchctl baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (patch, clean)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// patchctl — Controlador de jobs de patch de pacotes.
#[derive(Debug, Parser)]
#[command(name = "patchctl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para um arquivo de configuração alternativo.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose), incluindo entradas Debug do log.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um job de patch sobre o pacote informado.
    Patch(PatchArgs),

    /// Esvazia o diretório temporário configurado.
    Clean,
}

#[derive(Debug, Args)]
pub struct PatchArgs {
    /// Artefato base do pacote alvo.
    pub base: PathBuf,

    /// Artefatos split do pacote alvo (repetível).
    #[arg(long = "split")]
    pub splits: Vec<PathBuf>,

    /// Identificador do pacote alvo.
    #[arg(long)]
    pub package: String,

    /// Nome legível do app; usa o identificador do pacote se omitido.
    #[arg(long)]
    pub label: Option<String>,

    /// Módulo a embutir: artefatos separados por vírgula, base primeiro (repetível).
    #[arg(long = "module", value_name = "BASE[,SPLIT...]")]
    pub modules: Vec<String>,

    /// Embute os módulos no pacote em vez de usar o runtime externo.
    #[arg(long, default_value_t = false)]
    pub embed: bool,

    #[arg(long, default_value_t = false)]
    pub debuggable: bool,

    #[arg(long, default_value_t = false)]
    pub override_version_code: bool,

    /// Nível de bypass de verificação de assinatura.
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub sig_bypass_level: Option<u8>,

    /// Assina com o esquema v1.
    #[arg(long, default_value_t = false)]
    pub v1: bool,

    /// Não assina com o esquema v2.
    #[arg(long, default_value_t = false)]
    pub no_v2: bool,
}

impl PatchArgs {
    /// Artefatos de cada módulo, na ordem informada.
    pub fn module_artifacts(&self) -> Vec<Vec<PathBuf>> {
        self.modules
            .iter()
            .map(|module| {
                module.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .collect()
    }
}
