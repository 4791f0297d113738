//! Lifecycle of resource-limited sandboxes.
//!
//! The registry is the only state shared between concurrent operations and
//! sits behind a single mutex. A sandbox counts against the concurrency
//! ceiling from the moment its slot is reserved until it leaves
//! `CREATED`/`RUNNING`.

use crate::comparison::PerformanceMetrics;
use crate::constants::{
    DEFAULT_MAX_CONCURRENT_SANDBOXES, DEFAULT_METRICS_POLL_INTERVAL_MS, EVENT_CHANNEL_CAPACITY,
    REPORT_MARKER,
};
use crate::error::{EvoGuardError, Result};
use crate::events::SandboxEvent;
use crate::runner::{EvolutionTestRunner, HarnessMode, SuiteRun, TestFailure, TestHarness};
use crate::sandbox::{
    dir_size, ContainerRuntime, EnvironmentHandle, EnvironmentSpec, ExecutionResult,
    LimitOverrides, ResourceLimits, ResourceUsage, SandboxInstance, SandboxMetrics, SandboxStatus,
};
use crate::security::CodeIsolator;
use crate::{log_sandbox_created, log_sandbox_destroyed};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Default)]
struct Registry {
    sandboxes: HashMap<String, SandboxInstance>,
    /// Slots claimed by creations still provisioning
    reserved: usize,
}

impl Registry {
    fn live(&self) -> usize {
        self.sandboxes
            .values()
            .filter(|s| s.status.is_live())
            .count()
            + self.reserved
    }
}

/// Releases a reserved slot unless the creation completed.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut registry = self.registry.lock();
            registry.reserved = registry.reserved.saturating_sub(1);
        }
    }
}

/// Stops the environment if `execute` is abandoned before its own stop ran.
struct StopGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: EnvironmentHandle,
    armed: bool,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let runtime = self.runtime.clone();
            let handle = self.handle.clone();
            rt.spawn(async move {
                if let Err(e) = runtime.stop(&handle).await {
                    tracing::warn!(sandbox_id = %handle.id, error = %e, "Deferred stop failed");
                }
            });
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Peaks {
    memory_bytes: u64,
    cpu_percent: f64,
}

pub struct SandboxManager {
    registry: Arc<Mutex<Registry>>,
    runtime: Arc<dyn ContainerRuntime>,
    isolator: CodeIsolator,
    runner: EvolutionTestRunner,
    default_limits: ResourceLimits,
    max_concurrent: usize,
    work_root: PathBuf,
    poll_interval: Duration,
    events: broadcast::Sender<SandboxEvent>,
    initialized: AtomicBool,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        isolator: CodeIsolator,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        let work_root = work_root.into();
        let default_limits = ResourceLimits::default();
        let runner = EvolutionTestRunner::new(
            runtime.clone(),
            TestHarness::default(),
            work_root.clone(),
            default_limits.clone(),
            isolator.create_isolated_context(),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            runtime,
            isolator,
            runner,
            default_limits,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SANDBOXES,
            work_root,
            poll_interval: Duration::from_millis(DEFAULT_METRICS_POLL_INTERVAL_MS),
            events,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        let harness = self.runner.harness().clone();
        self.rebuild_runner(harness)
    }

    pub fn with_harness(self, harness: TestHarness) -> Self {
        self.rebuild_runner(harness)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn rebuild_runner(mut self, harness: TestHarness) -> Self {
        self.runner = EvolutionTestRunner::new(
            self.runtime.clone(),
            harness,
            self.work_root.clone(),
            self.default_limits.clone(),
            self.isolator.create_isolated_context(),
        );
        self
    }

    pub fn isolator(&self) -> &CodeIsolator {
        &self.isolator
    }

    pub fn runner(&self) -> &EvolutionTestRunner {
        &self.runner
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SandboxEvent) {
        let _ = self.events.send(event);
    }

    /// Prepares the runtime once and installs interrupt/terminate handlers
    /// that destroy every live sandbox before the process exits.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.runtime.prepare().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(EvoGuardError::environment("prepare", e));
        }
        tokio::fs::create_dir_all(&self.work_root).await?;

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = shutdown_signal().await;
            if let Some(manager) = manager.upgrade() {
                manager.cleanup().await;
            }
            std::process::exit(code);
        });

        tracing::info!(
            runtime = %self.runtime.name(),
            work_root = %self.work_root.display(),
            max_concurrent = self.max_concurrent,
            "Sandbox manager initialized"
        );
        Ok(())
    }

    /// Validates the candidate, claims a slot and provisions an isolated
    /// environment holding the code and its tests.
    pub async fn create_sandbox(
        &self,
        code: &str,
        tests: &str,
        limits: Option<LimitOverrides>,
    ) -> Result<SandboxInstance> {
        self.isolator.ensure_suite_valid(code, tests)?;

        let mut reservation = {
            let mut registry = self.registry.lock();
            let live = registry.live();
            if live >= self.max_concurrent {
                return Err(EvoGuardError::ConcurrencyLimit {
                    live,
                    max: self.max_concurrent,
                });
            }
            registry.reserved += 1;
            Reservation {
                registry: &self.registry,
                armed: true,
            }
        };

        let id = format!("sbx-{}", uuid::Uuid::new_v4().simple());
        let limits = match limits {
            Some(overrides) => self.default_limits.merged(&overrides),
            None => self.default_limits.clone(),
        };
        let workspace = self.work_root.join(&id);
        let spec = EnvironmentSpec::new(
            &id,
            &workspace,
            limits.clone(),
            self.isolator.create_isolated_context(),
        );

        let materialized = match tokio::fs::create_dir_all(&spec.output_dir).await {
            Ok(()) => {
                self.runner
                    .harness()
                    .materialize(&spec.source_dir, code, tests)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = materialized {
            remove_workspace(&id, &workspace).await;
            return Err(e.into());
        }

        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                remove_workspace(&id, &workspace).await;
                return Err(EvoGuardError::environment("create", e));
            }
        };

        let instance = SandboxInstance {
            id: id.clone(),
            handle: Some(handle),
            status: SandboxStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            resource_limits: limits.clone(),
            working_dir: workspace,
            logs: Vec::new(),
            error: None,
            metrics: SandboxMetrics::default(),
        };

        {
            let mut registry = self.registry.lock();
            registry.sandboxes.insert(id.clone(), instance.clone());
            registry.reserved = registry.reserved.saturating_sub(1);
            reservation.armed = false;
        }

        log_sandbox_created!(id, limits);
        self.emit(SandboxEvent::Created {
            sandbox_id: id,
            limits,
        });
        Ok(instance)
    }

    /// Runs the suite racing the execution timeout. Timeouts and environment
    /// failures are reported through the returned result, not as errors.
    pub async fn execute(&self, sandbox_id: &str) -> Result<ExecutionResult> {
        let (handle, limits, working_dir) = {
            let mut registry = self.registry.lock();
            let instance = registry
                .sandboxes
                .get_mut(sandbox_id)
                .ok_or_else(|| EvoGuardError::SandboxNotFound(sandbox_id.to_string()))?;
            if instance.status != SandboxStatus::Created {
                return Err(EvoGuardError::InvalidState {
                    sandbox_id: sandbox_id.to_string(),
                    status: instance.status.to_string(),
                    operation: "execute".to_string(),
                });
            }
            let handle = instance
                .handle
                .clone()
                .ok_or_else(|| EvoGuardError::environment("execute", "sandbox has no environment"))?;
            instance.status = SandboxStatus::Running;
            instance.started_at = Some(Utc::now());
            (
                handle,
                instance.resource_limits.clone(),
                instance.working_dir.clone(),
            )
        };
        self.emit(SandboxEvent::Started {
            sandbox_id: sandbox_id.to_string(),
        });

        let mut guard = StopGuard {
            runtime: self.runtime.clone(),
            handle: handle.clone(),
            armed: true,
        };
        let peaks = self.spawn_metrics_poller(sandbox_id, &handle);

        let started = Instant::now();
        let timeout_ms = limits.execution_timeout_ms;
        let run = async {
            self.runtime
                .start(&handle)
                .await
                .map_err(|e| EvoGuardError::environment("start", e))?;
            self.runner
                .run_in_environment(&handle, &limits, HarnessMode::Test)
                .await
        };
        let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(result) => result,
            Err(_) => Err(EvoGuardError::ExecutionTimeout {
                sandbox_id: sandbox_id.to_string(),
                timeout_ms,
            }),
        };

        let stop_error = self.runtime.stop(&handle).await.err();
        guard.armed = false;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, mut result) = match outcome {
            Ok(run) => (SandboxStatus::Completed, self.completed_result(run, duration_ms)),
            Err(err) => {
                let status = if matches!(err, EvoGuardError::ExecutionTimeout { .. }) {
                    SandboxStatus::Timeout
                } else {
                    SandboxStatus::Failed
                };
                tracing::warn!(sandbox_id, status = %status, error = %err, "Sandbox execution failed");
                (
                    status,
                    ExecutionResult {
                        success: false,
                        error: Some(err.to_string()),
                        ..Default::default()
                    },
                )
            }
        };
        if let Some(e) = stop_error {
            tracing::warn!(sandbox_id, error = %e, "Failed to stop environment");
            result
                .logs
                .push(format!("failed to stop environment: {}", e));
        }

        let peaks = *peaks.lock();
        let last_metrics = {
            let mut registry = self.registry.lock();
            match registry.sandboxes.get_mut(sandbox_id) {
                Some(instance) => {
                    instance.status = status;
                    instance.completed_at = Some(Utc::now());
                    instance.error = result.error.clone();
                    instance.logs.extend(result.logs.iter().cloned());
                    instance.metrics.clone()
                }
                None => SandboxMetrics::default(),
            }
        };

        if let Some(perf) = result.performance.as_mut() {
            perf.memory_usage_bytes = perf.memory_usage_bytes.max(peaks.memory_bytes);
            perf.cpu_percent = perf.cpu_percent.max(peaks.cpu_percent);
        }
        result.resource_usage = Some(ResourceUsage {
            peak_memory_bytes: peaks.memory_bytes,
            peak_cpu_percent: peaks.cpu_percent,
            disk_bytes: dir_size(&working_dir),
            network_rx_bytes: last_metrics.network_rx_bytes,
            network_tx_bytes: last_metrics.network_tx_bytes,
            duration_ms,
        });

        self.emit(SandboxEvent::Completed {
            sandbox_id: sandbox_id.to_string(),
            status,
            duration_ms,
        });
        Ok(result)
    }

    fn completed_result(&self, run: SuiteRun, duration_ms: u64) -> ExecutionResult {
        let SuiteRun {
            results,
            report,
            exec,
        } = run;

        let stdout = String::from_utf8_lossy(&exec.stdout);
        let output: Vec<&str> = stdout
            .lines()
            .filter(|line| !line.trim_start().starts_with(REPORT_MARKER))
            .collect();
        let mut logs = report.logs.clone();
        let stderr = String::from_utf8_lossy(&exec.stderr);
        logs.extend(stderr.lines().map(|l| format!("[stderr] {}", l)));

        let error_rate = if results.total == 0 {
            0.0
        } else {
            results.failed as f64 / results.total as f64
        };
        let performance = PerformanceMetrics {
            execution_time_ms: if report.duration_ms > 0 {
                report.duration_ms as f64
            } else {
                duration_ms as f64
            },
            memory_usage_bytes: report.heap_used_bytes,
            cpu_percent: 0.0,
            error_rate,
            error_types: error_types(&results.failures),
            samples_ms: Vec::new(),
        };

        let error = report.error.clone().or_else(|| {
            (exec.exit_code != 0 && results.failed == 0)
                .then(|| format!("harness exited with status {}", exec.exit_code))
        });

        ExecutionResult {
            success: error.is_none() && results.failed == 0 && report.violations.is_empty(),
            output: output.join("\n"),
            error,
            logs,
            test_results: Some(results),
            performance: Some(performance),
            security_violations: (!report.violations.is_empty()).then(|| report.violations.clone()),
            resource_usage: None,
        }
    }

    /// Samples runtime stats every poll interval while the sandbox stays
    /// `RUNNING`; exits on its own once the status changes.
    fn spawn_metrics_poller(&self, sandbox_id: &str, handle: &EnvironmentHandle) -> Arc<Mutex<Peaks>> {
        let peaks = Arc::new(Mutex::new(Peaks::default()));
        let registry = self.registry.clone();
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        let handle = handle.clone();
        let id = sandbox_id.to_string();
        let work_dir = self.work_root.join(sandbox_id);
        let interval = self.poll_interval;
        let shared = peaks.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let running = registry
                    .lock()
                    .sandboxes
                    .get(&id)
                    .map(|s| s.status == SandboxStatus::Running)
                    .unwrap_or(false);
                if !running {
                    break;
                }

                let stats = match runtime.stats(&handle).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::debug!(sandbox_id = %id, error = %e, "Metrics sample failed");
                        continue;
                    }
                };
                let metrics = SandboxMetrics::from_stats(&stats, dir_size(&work_dir));
                {
                    let mut peaks = shared.lock();
                    peaks.memory_bytes = peaks.memory_bytes.max(metrics.memory_bytes);
                    peaks.cpu_percent = peaks.cpu_percent.max(metrics.cpu_percent);
                }
                if let Some(instance) = registry.lock().sandboxes.get_mut(&id) {
                    instance.metrics = metrics.clone();
                }
                let _ = events.send(SandboxEvent::Metrics {
                    sandbox_id: id.clone(),
                    metrics,
                });
            }
        });

        peaks
    }

    /// Stops and removes the environment, deletes the working directory and
    /// drops the registry entry. Unknown ids are a no-op.
    pub async fn destroy_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxInstance>> {
        let removed = self.registry.lock().sandboxes.remove(sandbox_id);
        let Some(mut instance) = removed else {
            return Ok(None);
        };

        let mut clean = true;
        if let Some(handle) = &instance.handle {
            if let Err(e) = self.runtime.stop(handle).await {
                clean = false;
                tracing::warn!(sandbox_id, error = %e, "Failed to stop environment during destroy");
            }
            if let Err(e) = self.runtime.remove(handle).await {
                clean = false;
                tracing::warn!(sandbox_id, error = %e, "Failed to remove environment during destroy");
            }
        }
        if !remove_workspace(sandbox_id, &instance.working_dir).await {
            clean = false;
        }

        instance.status = SandboxStatus::Destroyed;
        log_sandbox_destroyed!(sandbox_id, clean);
        self.emit(SandboxEvent::Destroyed {
            sandbox_id: sandbox_id.to_string(),
        });
        Ok(Some(instance))
    }

    /// Last polled metrics overlaid with a live sample.
    pub async fn get_metrics(&self, sandbox_id: &str) -> Result<SandboxMetrics> {
        let (handle, mut metrics, working_dir) = {
            let registry = self.registry.lock();
            let instance = registry
                .sandboxes
                .get(sandbox_id)
                .ok_or_else(|| EvoGuardError::SandboxNotFound(sandbox_id.to_string()))?;
            (
                instance.handle.clone(),
                instance.metrics.clone(),
                instance.working_dir.clone(),
            )
        };

        if let Some(handle) = handle {
            match self.runtime.stats(&handle).await {
                Ok(stats) => {
                    let disk = metrics.disk_bytes;
                    metrics = SandboxMetrics::from_stats(&stats, disk);
                }
                Err(e) => {
                    tracing::debug!(sandbox_id, error = %e, "Live metrics sample failed");
                }
            }
        }
        metrics.disk_bytes = dir_size(&working_dir);
        Ok(metrics)
    }

    pub fn get_sandbox(&self, sandbox_id: &str) -> Option<SandboxInstance> {
        self.registry.lock().sandboxes.get(sandbox_id).cloned()
    }

    pub fn list_sandboxes(&self) -> Vec<SandboxInstance> {
        self.registry.lock().sandboxes.values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.registry.lock().live()
    }

    /// Destroys every registered sandbox concurrently.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.registry.lock().sandboxes.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "Cleaning up sandboxes");
        let results =
            futures::future::join_all(ids.iter().map(|id| self.destroy_sandbox(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(sandbox_id = %id, error = %e, "Cleanup failed");
            }
        }
    }
}

async fn remove_workspace(sandbox_id: &str, path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(sandbox_id, path = %path.display(), error = %e, "Failed to remove working directory");
            false
        }
    }
}

/// Error names (`TypeError`, `AssertionError`, ...) from failure details.
fn error_types(failures: &[TestFailure]) -> Vec<String> {
    let mut types: Vec<String> = failures
        .iter()
        .filter_map(|f| {
            let source = f.stack.as_deref().unwrap_or(&f.message);
            let head = source.split(':').next()?.trim();
            (head.ends_with("Error") && head.chars().all(|c| c.is_ascii_alphanumeric()))
                .then(|| head.to_string())
        })
        .collect();
    types.sort();
    types.dedup();
    types
}

/// Resolves with the exit status to use once SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> i32 {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Received Ctrl+C, destroying live sandboxes");
            130
        }
        _ = terminate => {
            tracing::warn!("Received terminate signal, destroying live sandboxes");
            143
        }
    }
}
