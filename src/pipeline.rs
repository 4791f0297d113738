//! End-to-end evaluation of one evolution candidate: static validation,
//! sandboxed execution, comparison against a baseline, regression
//! detection, rule evaluation and snapshotting.

use crate::comparison::{
    BaselineComparator, MetricsComparator, MetricsComparison, PerformanceMetrics,
};
use crate::config::{EvoGuardConfig, RuntimeKind};
use crate::error::{retry_with_backoff, EvoGuardError, Result, RetryConfig};
use crate::logging::PipelineStats;
use crate::regression::{Recommendation, RegressionAnalysis, RegressionDetector};
use crate::rules::{EvolutionDescriptor, RuleFailure, ValidationDecision, ValidationRulesEngine};
use crate::runner::RegressionTestOutcome;
use crate::sandbox::{
    ContainerRuntime, ExecutionResult, LimitOverrides, LocalRuntime, OciRuntime, SandboxManager,
    SandboxStatus,
};
use crate::security::{CodeIsolator, SecurityPolicyValidator};
use crate::severity::Severity;
use crate::snapshot::{
    MemorySnapshotStore, SnapshotManager, SnapshotMetadata, SnapshotStore, SqliteSnapshotStore,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A proposed change to evaluate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionCandidate {
    pub id: String,
    pub description: String,
    pub code: String,
    pub tests: String,
    /// When set together with `regression_tests`, both versions run the
    /// regression suite and behavioral differences reject the candidate
    #[serde(default)]
    pub original_code: Option<String>,
    #[serde(default)]
    pub regression_tests: Option<String>,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub sandbox_id: String,
    pub execution: ExecutionResult,
    pub comparison: MetricsComparison,
    pub regressions: RegressionAnalysis,
    pub decision: ValidationDecision,
    pub regression_tests: Option<RegressionTestOutcome>,
    pub snapshot_id: String,
    pub duration_ms: u64,
}

pub struct EvolutionPipeline {
    manager: Arc<SandboxManager>,
    comparator: Box<dyn MetricsComparator>,
    detector: RegressionDetector,
    rules: ValidationRulesEngine,
    snapshots: SnapshotManager,
    stats: Mutex<PipelineStats>,
    retry: RetryConfig,
}

impl EvolutionPipeline {
    pub fn new(
        manager: Arc<SandboxManager>,
        detector: RegressionDetector,
        rules: ValidationRulesEngine,
        snapshots: SnapshotManager,
    ) -> Self {
        Self {
            manager,
            comparator: Box::new(BaselineComparator::default()),
            detector,
            rules,
            snapshots,
            stats: Mutex::new(PipelineStats::new()),
            retry: RetryConfig::default(),
        }
    }

    /// Wires runtime, policy, store and rule profile from configuration.
    /// Call [`EvolutionPipeline::initialize`] before the first evaluation.
    pub fn from_config(config: &EvoGuardConfig) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = match &config.runtime {
            RuntimeKind::Local => Arc::new(LocalRuntime::new()),
            RuntimeKind::Oci {
                binary,
                rootfs,
                state_root,
            } => Arc::new(OciRuntime::new(binary, rootfs, state_root)),
        };

        let validator = Arc::new(SecurityPolicyValidator::new(config.security_policy.clone())?);
        let isolator = CodeIsolator::new(validator.clone());

        let store: Arc<dyn SnapshotStore> = match &config.snapshot_db {
            Some(path) => Arc::new(
                SqliteSnapshotStore::open(path)
                    .map_err(|e| EvoGuardError::storage("open snapshot db", e))?,
            ),
            None => Arc::new(MemorySnapshotStore::new()),
        };

        let manager = SandboxManager::new(runtime, isolator, config.work_root.clone())
            .with_max_concurrent(config.max_concurrent_sandboxes)
            .with_default_limits(config.default_limits.clone())
            .with_poll_interval(Duration::from_millis(config.metrics_poll_interval_ms));

        Ok(Self::new(
            Arc::new(manager),
            RegressionDetector::new(config.regression_thresholds.clone()),
            ValidationRulesEngine::from_profile(config.rule_profile),
            SnapshotManager::new(store).with_validator(validator),
        ))
    }

    pub fn with_comparator(mut self, comparator: Box<dyn MetricsComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn initialize(&self) -> Result<()> {
        self.manager.initialize().await
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn rules(&self) -> &ValidationRulesEngine {
        &self.rules
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    /// Evaluates `candidate` against `baseline`. Statically invalid code or
    /// tests are an error and never reach a sandbox; every other outcome, including
    /// timeouts and crashes, is a (possibly rejecting) decision.
    pub async fn evaluate(
        &self,
        candidate: &EvolutionCandidate,
        baseline: &PerformanceMetrics,
    ) -> Result<EvaluationOutcome> {
        let started = Instant::now();

        let suites = match &candidate.regression_tests {
            Some(regression) => format!("{}\n{}", candidate.tests, regression),
            None => candidate.tests.clone(),
        };
        let validation = self
            .manager
            .isolator()
            .validate_suite(&candidate.code, &suites);
        if !validation.valid {
            {
                let mut stats = self.stats.lock();
                stats.total_evaluations += 1;
                stats.static_rejections += 1;
                stats.rejected += 1;
            }
            tracing::info!(
                candidate = %candidate.id,
                score = validation.score,
                errors = validation.errors.len(),
                "Candidate rejected by static validation"
            );
            return Err(validation.into_error());
        }

        let instance = retry_with_backoff(&self.retry, || {
            self.manager
                .create_sandbox(&candidate.code, &candidate.tests, candidate.limits.clone())
        })
        .await?;
        let sandbox_id = instance.id;

        let executed = self.manager.execute(&sandbox_id).await;
        let final_status = self.manager.get_sandbox(&sandbox_id).map(|s| s.status);
        if let Err(e) = self.manager.destroy_sandbox(&sandbox_id).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to destroy sandbox");
        }
        let execution = executed?;

        let evolved = evolved_metrics(&execution);
        let comparison = self.comparator.compare(baseline, &evolved);
        let regressions = self.detector.detect_regressions(&comparison);

        let mut decision = self.rules.validate_evolution(
            &EvolutionDescriptor {
                id: candidate.id.clone(),
                description: candidate.description.clone(),
            },
            &comparison,
        );
        if !execution.success {
            decision = decision.reject_with(RuleFailure {
                rule: "execution".to_string(),
                severity: Severity::High,
                message: execution
                    .error
                    .clone()
                    .unwrap_or_else(|| "test suite failed".to_string()),
            });
        }
        if regressions.recommendation == Recommendation::DoNotApply {
            decision = decision.reject_with(RuleFailure {
                rule: "regression-verdict".to_string(),
                severity: Severity::High,
                message: format!(
                    "{} regression(s), recommendation: {}",
                    regressions.regressions.len(),
                    regressions.recommendation
                ),
            });
        }

        let regression_tests = match (&candidate.original_code, &candidate.regression_tests) {
            (Some(original), Some(tests)) => {
                let outcome = self
                    .manager
                    .runner()
                    .run_regression_tests(&candidate.code, original, tests)
                    .await;
                match outcome {
                    Ok(outcome) => {
                        if !outcome.passed {
                            decision = decision.reject_with(RuleFailure {
                                rule: "behavioral-equivalence".to_string(),
                                severity: Severity::Medium,
                                message: format!(
                                    "{} behavioral difference(s) against the original",
                                    outcome.differences.len()
                                ),
                            });
                        }
                        Some(outcome)
                    }
                    Err(e) => {
                        decision = decision.reject_with(RuleFailure {
                            rule: "behavioral-equivalence".to_string(),
                            severity: Severity::High,
                            message: format!("regression suite could not run: {}", e),
                        });
                        None
                    }
                }
            }
            _ => None,
        };

        let verdict = if decision.approved { "approved" } else { "rejected" };
        let snapshot_id = self.snapshots.create_snapshot(
            &sandbox_id,
            &candidate.code,
            &candidate.tests,
            Some(execution.clone()),
            Some(SnapshotMetadata {
                version: String::new(),
                description: Some(candidate.description.clone()),
                tags: vec![format!("candidate:{}", candidate.id), verdict.to_string()],
            }),
        )?;

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock();
            stats.total_evaluations += 1;
            stats.total_duration_ms += duration_ms;
            if decision.approved {
                stats.approved += 1;
            } else {
                stats.rejected += 1;
            }
            if final_status == Some(SandboxStatus::Timeout) {
                stats.timeouts += 1;
            }
        }

        tracing::info!(
            candidate = %candidate.id,
            sandbox_id = %sandbox_id,
            approved = decision.approved,
            score = decision.score,
            regressions = regressions.regressions.len(),
            duration_ms,
            "Evaluation finished"
        );

        Ok(EvaluationOutcome {
            sandbox_id,
            execution,
            comparison,
            regressions,
            decision,
            regression_tests,
            snapshot_id,
            duration_ms,
        })
    }
}

/// Metrics of the evolved run. A run without measurements counts as
/// entirely failed when it did not succeed.
fn evolved_metrics(execution: &ExecutionResult) -> PerformanceMetrics {
    match &execution.performance {
        Some(metrics) => metrics.clone(),
        None if execution.success => PerformanceMetrics::default(),
        None => PerformanceMetrics {
            error_rate: 1.0,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_metrics_of_failed_run_count_as_errors() {
        let failed = ExecutionResult {
            success: false,
            error: Some("timeout".to_string()),
            ..Default::default()
        };
        assert_eq!(evolved_metrics(&failed).error_rate, 1.0);

        let ok = ExecutionResult {
            success: true,
            ..Default::default()
        };
        assert_eq!(evolved_metrics(&ok).error_rate, 0.0);
    }

    #[test]
    fn test_from_config_with_local_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = EvoGuardConfig {
            work_root: dir.path().join("work"),
            snapshot_db: Some(dir.path().join("snapshots.db")),
            max_concurrent_sandboxes: 2,
            ..Default::default()
        };
        let pipeline = EvolutionPipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.manager().max_concurrent(), 2);
        assert_eq!(pipeline.manager().runtime().name(), "local");
        assert_eq!(pipeline.rules().rule_names().len(), 7);
        assert_eq!(pipeline.stats().total_evaluations, 0);
    }
}
