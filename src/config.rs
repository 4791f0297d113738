use crate::constants::{DEFAULT_MAX_CONCURRENT_SANDBOXES, DEFAULT_METRICS_POLL_INTERVAL_MS};
use crate::error::{EvoGuardError, Result};
use crate::regression::RegressionThresholds;
use crate::sandbox::ResourceLimits;
use crate::security::SecurityPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which built-in rule set the validation engine starts with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProfile {
    #[default]
    Default,
    Production,
    Development,
}

impl FromStr for RuleProfile {
    type Err = EvoGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(EvoGuardError::Config(format!(
                "unknown rule profile '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Plain child processes; development and tests only
    Local,
    /// runc-compatible CLI driven with a generated bundle
    Oci {
        binary: PathBuf,
        rootfs: PathBuf,
        state_root: PathBuf,
    },
}

impl Default for RuntimeKind {
    fn default() -> Self {
        Self::Local
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoGuardConfig {
    pub max_concurrent_sandboxes: usize,
    pub work_root: PathBuf,
    pub default_limits: ResourceLimits,
    pub security_policy: SecurityPolicy,
    pub regression_thresholds: RegressionThresholds,
    pub rule_profile: RuleProfile,
    /// In-memory snapshot store when unset
    pub snapshot_db: Option<PathBuf>,
    pub runtime: RuntimeKind,
    pub metrics_poll_interval_ms: u64,
    pub log_json: bool,
}

impl Default for EvoGuardConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: DEFAULT_MAX_CONCURRENT_SANDBOXES,
            work_root: env::temp_dir().join("evoguard"),
            default_limits: ResourceLimits::default(),
            security_policy: SecurityPolicy::default(),
            regression_thresholds: RegressionThresholds::default(),
            rule_profile: RuleProfile::Default,
            snapshot_db: None,
            runtime: RuntimeKind::Local,
            metrics_poll_interval_ms: DEFAULT_METRICS_POLL_INTERVAL_MS,
            log_json: false,
        }
    }
}

impl EvoGuardConfig {
    /// Defaults overlaid with `EVOGUARD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EvoGuardError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EvoGuardError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(max) = var("EVOGUARD_MAX_SANDBOXES") {
            self.max_concurrent_sandboxes = max.parse().map_err(|_| {
                EvoGuardError::Config(format!("EVOGUARD_MAX_SANDBOXES is not a number: {}", max))
            })?;
        }
        if let Some(dir) = var("EVOGUARD_WORK_DIR") {
            self.work_root = PathBuf::from(dir);
        }
        if let Some(db) = var("EVOGUARD_SNAPSHOT_DB") {
            self.snapshot_db = Some(PathBuf::from(db));
        }
        if let Some(profile) = var("EVOGUARD_RULE_PROFILE") {
            self.rule_profile = profile.parse()?;
        }
        if let Some(runtime) = var("EVOGUARD_RUNTIME") {
            self.runtime = match runtime.as_str() {
                "local" => RuntimeKind::Local,
                "oci" => {
                    let rootfs = var("EVOGUARD_OCI_ROOTFS").ok_or_else(|| {
                        EvoGuardError::Config(
                            "EVOGUARD_RUNTIME=oci requires EVOGUARD_OCI_ROOTFS".to_string(),
                        )
                    })?;
                    RuntimeKind::Oci {
                        binary: PathBuf::from("runc"),
                        rootfs: PathBuf::from(rootfs),
                        state_root: self.work_root.join("oci-state"),
                    }
                }
                other => {
                    return Err(EvoGuardError::Config(format!(
                        "unknown runtime '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(json) = var("EVOGUARD_LOG_JSON") {
            self.log_json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        Ok(self)
    }
}
