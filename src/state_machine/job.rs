use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;
use crate::error::PatchError;

/// An installed application picked for patching, or as an embedded module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetApp {
    label: String,
    package_name: String,
    /// Base artifact first, then split artifacts. Never empty.
    artifacts: Vec<PathBuf>,
}

impl TargetApp {
    pub fn new(
        label: impl Into<String>,
        package_name: impl Into<String>,
        base: PathBuf,
        splits: Vec<PathBuf>,
    ) -> Self {
        let mut artifacts = Vec::with_capacity(splits.len() + 1);
        artifacts.push(base);
        artifacts.extend(splits);
        Self {
            label: label.into(),
            package_name: package_name.into(),
            artifacts,
        }
    }

    /// Build from a flat artifact list whose first element is the base.
    pub fn from_artifacts(
        label: impl Into<String>,
        package_name: impl Into<String>,
        artifacts: Vec<PathBuf>,
    ) -> Result<Self, PatchError> {
        let package_name = package_name.into();
        let mut iter = artifacts.into_iter();
        let base = iter.next().ok_or_else(|| {
            PatchError::InvalidTarget(format!("{package_name} has no source artifacts"))
        })?;
        Ok(Self::new(label, package_name, base, iter.collect()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn base(&self) -> &Path {
        &self.artifacts[0]
    }

    pub fn splits(&self) -> &[PathBuf] {
        &self.artifacts[1..]
    }

    /// `[base] + splits`.
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }
}

/// Signature verification bypass level accepted by the engine (0..=2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SigBypassLevel(u8);

impl SigBypassLevel {
    pub const MAX: u8 = 2;

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for SigBypassLevel {
    fn default() -> Self {
        Self(Self::MAX)
    }
}

impl TryFrom<u8> for SigBypassLevel {
    type Error = PatchError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level <= Self::MAX {
            Ok(Self(level))
        } else {
            Err(PatchError::SigBypassLevel(level))
        }
    }
}

impl From<SigBypassLevel> for u8 {
    fn from(level: SigBypassLevel) -> Self {
        level.0
    }
}

/// Mutable configuration staged before submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Rely on an externally installed runtime ("manager") for modules.
    pub use_external_runtime: bool,
    pub debuggable: bool,
    pub override_version_code: bool,
    pub sign_v1: bool,
    pub sign_v2: bool,
    pub sig_bypass_level: SigBypassLevel,
    /// Auxiliary apps to embed; selected at runtime, never read from config.
    #[serde(skip)]
    pub embedded_modules: Vec<TargetApp>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            use_external_runtime: true,
            debuggable: false,
            override_version_code: false,
            sign_v1: false,
            sign_v2: true,
            sig_bypass_level: SigBypassLevel::default(),
            embedded_modules: Vec::new(),
        }
    }
}

/// Frozen input of one patch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOptions {
    pub artifact_paths: Vec<PathBuf>,
    pub debuggable: bool,
    pub override_version_code: bool,
    pub use_external_runtime: bool,
    pub sig_bypass_level: SigBypassLevel,
    pub sign_v1: bool,
    pub sign_v2: bool,
    /// The engine always emits debug output; the job log decides what to keep.
    pub verbose: bool,
    pub embedded_modules: Vec<PathBuf>,
}

/// Freeze a target and staged settings into job options.
///
/// Embedded modules are the flattened `[base] + splits` of every staged
/// module, or nothing at all when an external runtime supplies them.
pub fn build_options(target: &TargetApp, settings: &JobSettings) -> JobOptions {
    let embedded_modules = if settings.use_external_runtime {
        Vec::new()
    } else {
        settings
            .embedded_modules
            .iter()
            .flat_map(|module| module.artifacts().iter().cloned())
            .collect()
    };

    JobOptions {
        artifact_paths: target.artifacts().to_vec(),
        debuggable: settings.debuggable,
        override_version_code: settings.override_version_code,
        use_external_runtime: settings.use_external_runtime,
        sig_bypass_level: settings.sig_bypass_level,
        sign_v1: settings.sign_v1,
        sign_v2: settings.sign_v2,
        verbose: true,
        embedded_modules,
    }
}

/// What the engine call came back with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

/// Structured summary of a job, suitable for printing or archiving.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub package_name: Option<String>,
    pub state: JobState,
    pub state_transitions: Vec<JobState>,
    pub options: Option<JobOptions>,
    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub log_entries: usize,
    pub error_entries: usize,
    pub failure: Option<String>,
}

impl JobReport {
    /// Pretty-printed JSON form of the report.
    pub fn to_json(&self) -> Result<String, PatchError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
