//! Configuração do patchctl carregada a partir de `patchctl.toml`.
//!
//! A struct [`PatchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `PATCHCTL_TMP_DIR` tem precedência sobre o arquivo.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PatchError;
use crate::state_machine::JobSettings;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "patchctl.toml";

/// Variável de ambiente que sobrescreve o diretório temporário.
pub const TMP_DIR_ENV: &str = "PATCHCTL_TMP_DIR";

/// Configuração de nível superior carregada de `patchctl.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Diretório de artefatos temporários, esvaziado ao fim de cada job.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Diretório onde o engine grava os pacotes gerados.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Mantém entradas Debug no log do job.
    #[serde(default)]
    pub verbose: bool,

    /// Executável externo que realiza o patch.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Valores iniciais das opções do job.
    #[serde(default)]
    pub defaults: JobSettings,
}

/// Como invocar o patcher externo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,

    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
}

// Valor padrão do diretório temporário: `<tmp do sistema>/patchctl`.
fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("patchctl")
}

// Valor padrão do diretório de saída: "patched".
fn default_output_dir() -> PathBuf {
    PathBuf::from("patched")
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("java")
}

fn default_engine_args() -> Vec<String> {
    vec!["-jar".to_string(), "patcher.jar".to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            args: default_engine_args(),
        }
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            output_dir: default_output_dir(),
            verbose: false,
            engine: EngineConfig::default(),
            defaults: JobSettings::default(),
        }
    }
}

impl PatchConfig {
    /// Carrega a configuração de `patchctl.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, PatchError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self, PatchError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Some(dir) = std::env::var_os(TMP_DIR_ENV).filter(|v| !v.is_empty()) {
            config.tmp_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, PatchError> {
        Ok(toml::from_str::<PatchConfig>(contents)?)
    }

    /// O diretório temporário é esvaziado ao fim de cada job, então não pode
    /// coincidir com o diretório de saída.
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.tmp_dir == self.output_dir {
            return Err(PatchError::Config(format!(
                "tmp_dir and output_dir must differ (both are {})",
                self.tmp_dir.display()
            )));
        }
        Ok(())
    }
}
