//! Weighted approval rules over a [`MetricsComparison`].

use crate::comparison::MetricsComparison;
use crate::config::RuleProfile;
use crate::log_rule_failure;
use crate::severity::Severity;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Predicate over a comparison. `Err` means the check itself could not be
/// evaluated and is treated as a high-severity failure.
pub type RuleCheck = Arc<dyn Fn(&MetricsComparison) -> Result<bool, String> + Send + Sync>;

#[derive(Clone)]
pub struct ValidationRule {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub weight: f64,
    check: RuleCheck,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .field("weight", &self.weight)
            .finish()
    }
}

impl ValidationRule {
    pub fn new<F>(name: &str, description: &str, severity: Severity, check: F) -> Self
    where
        F: Fn(&MetricsComparison) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            severity,
            weight: severity.weight(),
            check: Arc::new(check),
        }
    }

    /// Infallible predicate shorthand.
    pub fn predicate<F>(name: &str, description: &str, severity: Severity, check: F) -> Self
    where
        F: Fn(&MetricsComparison) -> bool + Send + Sync + 'static,
    {
        Self::new(name, description, severity, move |c| Ok(check(c)))
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn evaluate(&self, comparison: &MetricsComparison) -> RuleCheckResult {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.check)(comparison)));
        let (passed, severity, message) = match outcome {
            Ok(Ok(true)) => (true, self.severity, String::new()),
            Ok(Ok(false)) => (false, self.severity, self.description.clone()),
            Ok(Err(reason)) => (
                false,
                Severity::High,
                format!("rule check errored: {}", reason),
            ),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                (false, Severity::High, format!("rule check panicked: {}", reason))
            }
        };

        RuleCheckResult {
            rule: self.name.clone(),
            passed,
            severity,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCheckResult {
    pub rule: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

/// Identity of the evolution being judged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionDescriptor {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDecision {
    pub approved: bool,
    pub failures: Vec<RuleFailure>,
    /// Weighted share of passed rules, 0-100
    pub score: f64,
    pub recommendation: String,
}

impl ValidationDecision {
    /// Rejection carrying a failure that did not come from a rule.
    pub fn reject_with(mut self, failure: RuleFailure) -> Self {
        self.approved = false;
        self.failures.push(failure);
        self.recommendation = recommendation_for(&self.failures, 0);
        self
    }
}

fn recommendation_for(failures: &[RuleFailure], rule_count: usize) -> String {
    match failures.iter().max_by_key(|f| f.severity) {
        None => format!("Approve: all {} rules passed", rule_count),
        Some(worst) => {
            let action = match worst.severity {
                Severity::High => "Reject",
                Severity::Medium => "Review",
                Severity::Low => "Hold",
            };
            format!(
                "{}: {} rule '{}' failed ({})",
                action, worst.severity, worst.rule, worst.message
            )
        }
    }
}

pub fn default_rules() -> Vec<ValidationRule> {
    threshold_rules(5.0, 20.0, 0.05, 0.7)
}

/// Tighter thresholds, no tolerance for memory growth.
pub fn production_rules() -> Vec<ValidationRule> {
    threshold_rules(10.0, 0.0, 0.01, 0.9)
}

pub fn development_rules() -> Vec<ValidationRule> {
    threshold_rules(0.0, 50.0, 0.1, 0.5)
}

fn threshold_rules(
    min_improvement: f64,
    max_memory_increase: f64,
    max_p_value: f64,
    min_confidence: f64,
) -> Vec<ValidationRule> {
    let memory_rule = if max_memory_increase > 0.0 {
        ValidationRule::predicate(
            "memory-increase-cap",
            &format!("memory increase must stay below {}%", max_memory_increase),
            Severity::Medium,
            move |c| c.memory.increase < max_memory_increase,
        )
    } else {
        ValidationRule::predicate(
            "memory-increase-cap",
            "memory must not grow",
            Severity::Medium,
            |c| c.memory.increase <= 0.0,
        )
    };

    vec![
        ValidationRule::predicate(
            "minimum-improvement",
            &format!("performance must improve by more than {}%", min_improvement),
            Severity::Medium,
            move |c| c.performance.improvement > min_improvement,
        ),
        ValidationRule::predicate(
            "no-memory-leak",
            "no memory leak may be detected",
            Severity::High,
            |c| !c.memory.leak_detected,
        ),
        ValidationRule::predicate(
            "statistical-significance",
            &format!("improvement must be significant (p < {})", max_p_value),
            Severity::Medium,
            move |c| c.performance.p_value < max_p_value,
        ),
        ValidationRule::predicate(
            "no-reliability-regression",
            "error rate must not increase",
            Severity::High,
            |c| c.reliability.error_rate_change <= 0.0,
        ),
        memory_rule,
        ValidationRule::predicate(
            "confidence-floor",
            &format!("overall confidence must exceed {}", min_confidence),
            Severity::Medium,
            move |c| c.overall.confidence > min_confidence,
        ),
        ValidationRule::predicate(
            "no-new-error-types",
            "no new error types may appear",
            Severity::Medium,
            |c| c.reliability.new_error_types.is_empty(),
        ),
    ]
}

/// Named, weighted rule list that can be changed while in use.
pub struct ValidationRulesEngine {
    rules: RwLock<Vec<ValidationRule>>,
}

impl Default for ValidationRulesEngine {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl ValidationRulesEngine {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn production() -> Self {
        Self::new(production_rules())
    }

    pub fn development() -> Self {
        Self::new(development_rules())
    }

    pub fn from_profile(profile: RuleProfile) -> Self {
        match profile {
            RuleProfile::Default => Self::default(),
            RuleProfile::Production => Self::production(),
            RuleProfile::Development => Self::development(),
        }
    }

    /// Adds a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: ValidationRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn replace_rules(&self, rules: Vec<ValidationRule>) {
        *self.rules.write() = rules;
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().iter().map(|r| r.name.clone()).collect()
    }

    pub fn validate_evolution(
        &self,
        evolution: &EvolutionDescriptor,
        comparison: &MetricsComparison,
    ) -> ValidationDecision {
        let rules = self.rules.read().clone();
        if rules.is_empty() {
            tracing::warn!(evolution = %evolution.id, "No validation rules configured; rejecting");
            let failures = vec![RuleFailure {
                rule: "rule-set".to_string(),
                severity: Severity::High,
                message: "no validation rules configured".to_string(),
            }];
            return ValidationDecision {
                approved: false,
                recommendation: recommendation_for(&failures, 0),
                failures,
                score: 0.0,
            };
        }

        let mut failures = Vec::new();
        let mut total_weight = 0.0;
        let mut passed_weight = 0.0;
        for rule in &rules {
            let result = rule.evaluate(comparison);
            total_weight += rule.weight;
            if result.passed {
                passed_weight += rule.weight;
            } else {
                log_rule_failure!(result.rule, result.severity, result.message);
                failures.push(RuleFailure {
                    rule: result.rule,
                    severity: result.severity,
                    message: result.message,
                });
            }
        }

        let score = if total_weight > 0.0 {
            (passed_weight / total_weight * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let approved = failures.is_empty();
        tracing::info!(
            evolution = %evolution.id,
            approved,
            score,
            failures = failures.len(),
            "Evolution validated"
        );

        ValidationDecision {
            approved,
            recommendation: recommendation_for(&failures, rules.len()),
            failures,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evolution() -> EvolutionDescriptor {
        EvolutionDescriptor {
            id: "evo-1".to_string(),
            description: "faster add".to_string(),
        }
    }

    fn improved(improvement: f64) -> MetricsComparison {
        let mut cmp = MetricsComparison::neutral();
        cmp.performance.improvement = improvement;
        cmp.performance.p_value = 0.0;
        cmp.overall.confidence = 0.8;
        cmp
    }

    #[test]
    fn test_clear_improvement_is_approved() {
        let decision = ValidationRulesEngine::default().validate_evolution(&evolution(), &improved(20.0));
        assert!(decision.approved, "failures: {:?}", decision.failures);
        assert_eq!(decision.score, 100.0);
        assert!(decision.recommendation.starts_with("Approve"));
    }

    #[test]
    fn test_slowdown_is_rejected() {
        let decision = ValidationRulesEngine::default().validate_evolution(&evolution(), &improved(-15.0));
        assert!(!decision.approved);
        assert!(decision.failures.iter().any(|f| f.rule == "minimum-improvement"));
        assert!(decision.score < 100.0);
    }

    #[test]
    fn test_panicking_rule_is_high_severity() {
        let engine = ValidationRulesEngine::new(vec![ValidationRule::predicate(
            "explodes",
            "always panics",
            Severity::Low,
            |_| panic!("boom"),
        )]);
        let decision = engine.validate_evolution(&evolution(), &improved(20.0));
        assert!(!decision.approved);
        assert_eq!(decision.failures[0].severity, Severity::High);
        assert!(decision.failures[0].message.contains("boom"));
        assert_eq!(decision.score, 0.0);
    }

    #[test]
    fn test_erroring_rule_is_high_severity() {
        let engine = ValidationRulesEngine::new(vec![ValidationRule::new(
            "no-data",
            "needs data",
            Severity::Low,
            |_| Err("missing samples".to_string()),
        )]);
        let decision = engine.validate_evolution(&evolution(), &improved(20.0));
        assert_eq!(decision.failures[0].severity, Severity::High);
        assert!(decision.recommendation.starts_with("Reject"));
    }

    #[test]
    fn test_empty_rule_set_rejects() {
        let engine = ValidationRulesEngine::new(Vec::new());
        let decision = engine.validate_evolution(&evolution(), &improved(50.0));
        assert!(!decision.approved);
        assert_eq!(decision.score, 0.0);
    }

    #[test]
    fn test_weighted_score() {
        // leak rule (high, 3) fails out of a total weight of 16
        let mut cmp = improved(20.0);
        cmp.memory.leak_detected = true;
        let decision = ValidationRulesEngine::default().validate_evolution(&evolution(), &cmp);
        assert_eq!(decision.failures.len(), 1);
        assert!((decision.score - 13.0 / 16.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_runtime_rule_management() {
        let engine = ValidationRulesEngine::default();
        assert!(engine.remove_rule("minimum-improvement"));
        assert!(!engine.remove_rule("minimum-improvement"));
        let decision = engine.validate_evolution(&evolution(), &improved(1.0));
        assert!(decision.approved, "failures: {:?}", decision.failures);

        engine.add_rule(ValidationRule::predicate(
            "custom",
            "improvement above 2",
            Severity::Low,
            |c| c.performance.improvement > 2.0,
        ));
        assert!(!engine.validate_evolution(&evolution(), &improved(1.0)).approved);
    }

    #[test]
    fn test_production_is_stricter() {
        let cmp = improved(8.0);
        assert!(ValidationRulesEngine::default().validate_evolution(&evolution(), &cmp).approved);
        assert!(!ValidationRulesEngine::production().validate_evolution(&evolution(), &cmp).approved);
        assert!(ValidationRulesEngine::development().validate_evolution(&evolution(), &cmp).approved);
    }
}
