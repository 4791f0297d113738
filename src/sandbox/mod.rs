use crate::comparison::PerformanceMetrics;
use crate::constants::*;
use crate::runner::TestResults;
use crate::security::{IsolatedContext, SecurityViolation};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub mod local;
pub mod manager;
pub mod oci;
pub mod spec;

pub use local::LocalRuntime;
pub use manager::SandboxManager;
pub use oci::OciRuntime;

/// Hard caps attached to a sandbox at creation. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_shares: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_processes: u64,
    pub max_file_descriptors: u64,
    pub network_enabled: bool,
    pub execution_timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_shares: DEFAULT_CPU_SHARES,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_mb: DEFAULT_DISK_MB,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_file_descriptors: DEFAULT_MAX_FILE_DESCRIPTORS,
            network_enabled: false,
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
        }
    }
}

/// Caller-supplied partial limits, merged over the manager defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub cpu_shares: Option<u64>,
    pub memory_mb: Option<u64>,
    pub disk_mb: Option<u64>,
    pub max_processes: Option<u64>,
    pub max_file_descriptors: Option<u64>,
    pub network_enabled: Option<bool>,
    pub execution_timeout_ms: Option<u64>,
}

impl ResourceLimits {
    pub fn merged(&self, overrides: &LimitOverrides) -> Self {
        Self {
            cpu_shares: overrides.cpu_shares.unwrap_or(self.cpu_shares),
            memory_mb: overrides.memory_mb.unwrap_or(self.memory_mb),
            disk_mb: overrides.disk_mb.unwrap_or(self.disk_mb),
            max_processes: overrides.max_processes.unwrap_or(self.max_processes),
            max_file_descriptors: overrides
                .max_file_descriptors
                .unwrap_or(self.max_file_descriptors),
            network_enabled: overrides.network_enabled.unwrap_or(self.network_enabled),
            execution_timeout_ms: overrides
                .execution_timeout_ms
                .unwrap_or(self.execution_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Created,
    Running,
    Completed,
    Failed,
    Timeout,
    Destroyed,
}

impl SandboxStatus {
    /// Live sandboxes count against the concurrency ceiling.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub pids: u64,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl SandboxMetrics {
    pub fn from_stats(stats: &RuntimeStats, disk_bytes: u64) -> Self {
        Self {
            cpu_percent: stats.cpu_percent,
            memory_bytes: stats.memory_bytes,
            disk_bytes,
            network_rx_bytes: stats.network_rx_bytes,
            network_tx_bytes: stats.network_tx_bytes,
            pids: stats.pids,
            sampled_at: Some(Utc::now()),
        }
    }
}

/// Opaque reference to an environment owned by a `ContainerRuntime`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub id: String,
    pub runtime: String,
}

/// Everything a runtime needs to provision one isolated environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub name: String,
    /// Private working directory; `source_dir` and `output_dir` live below it
    pub workspace_dir: PathBuf,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub limits: ResourceLimits,
    pub context: IsolatedContext,
}

impl EnvironmentSpec {
    pub fn new(
        name: &str,
        workspace_dir: &Path,
        limits: ResourceLimits,
        context: IsolatedContext,
    ) -> Self {
        Self {
            name: name.to_string(),
            workspace_dir: workspace_dir.to_path_buf(),
            source_dir: workspace_dir.join("src"),
            output_dir: workspace_dir.join("output"),
            limits,
            context,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub pids: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Narrow boundary to an isolation backend (containers, jails, microVMs, ...).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;
    /// Prepares the base image/template once, before any environment exists.
    async fn prepare(&self) -> Result<()>;
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle>;
    async fn start(&self, handle: &EnvironmentHandle) -> Result<()>;
    async fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest) -> Result<ExecOutput>;
    async fn stats(&self, handle: &EnvironmentHandle) -> Result<RuntimeStats>;
    /// Forcibly stops every process in the environment. Must be safe to repeat.
    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()>;
    async fn remove(&self, handle: &EnvironmentHandle) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_bytes: u64,
    pub peak_cpu_percent: f64,
    pub disk_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub duration_ms: u64,
}

/// Outcome of one `SandboxManager::execute` call. Immutable once produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub test_results: Option<TestResults>,
    pub performance: Option<PerformanceMetrics>,
    pub security_violations: Option<Vec<SecurityViolation>>,
    pub resource_usage: Option<ResourceUsage>,
}

/// A sandbox as tracked by the manager registry.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInstance {
    pub id: String,
    pub handle: Option<EnvironmentHandle>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resource_limits: ResourceLimits,
    pub working_dir: PathBuf,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub metrics: SandboxMetrics,
}

/// Wraps `args` in a shell prelude that applies the per-process limits
/// `ulimit` can express (open file descriptors).
pub fn limits_prelude(limits: &ResourceLimits, args: &[String]) -> Vec<String> {
    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "ulimit -n {} && exec {}",
            limits.max_file_descriptors,
            quoted.join(" ")
        ),
    ]
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Total size of regular files below `root`.
pub fn dir_size(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
