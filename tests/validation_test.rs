/// Static policy, regression detection and rule evaluation through the public API
#[cfg(test)]
mod tests {
    use evoguard::comparison::{
        BaselineComparator, MetricsComparator, MetricsComparison, PerformanceMetrics,
    };
    use evoguard::regression::{Recommendation, RegressionDetector, RegressionType};
    use evoguard::rules::{EvolutionDescriptor, ValidationRule, ValidationRulesEngine};
    use evoguard::security::{IssueCode, SecurityPolicy, SecurityPolicyValidator};
    use evoguard::Severity;

    fn metrics(time_ms: f64, memory: u64, error_rate: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            execution_time_ms: time_ms,
            memory_usage_bytes: memory,
            error_rate,
            ..Default::default()
        }
    }

    fn evolution() -> EvolutionDescriptor {
        EvolutionDescriptor {
            id: "evo-7".to_string(),
            description: "cache lookups".to_string(),
        }
    }

    #[test]
    fn test_identical_metrics_have_no_regressions() {
        let comparison = BaselineComparator::default()
            .compare(&metrics(100.0, 1000, 0.0), &metrics(100.0, 1000, 0.0));
        let analysis = RegressionDetector::default().detect_regressions(&comparison);
        assert!(!analysis.has_regressions);
        assert_eq!(analysis.recommendation, Recommendation::SafeToApply);
    }

    #[test]
    fn test_reliability_drop_is_do_not_apply() {
        let comparison = BaselineComparator::default()
            .compare(&metrics(100.0, 1000, 0.0), &metrics(90.0, 1000, 0.2));
        let analysis = RegressionDetector::default().detect_regressions(&comparison);
        assert!(analysis
            .regressions
            .iter()
            .any(|r| r.regression_type == RegressionType::Reliability && r.severity == Severity::High));
        assert_eq!(analysis.recommendation, Recommendation::DoNotApply);

        let decision = ValidationRulesEngine::default().validate_evolution(&evolution(), &comparison);
        assert!(!decision.approved);
        assert!(decision.recommendation.starts_with("Reject"));
    }

    #[test]
    fn test_production_profile_is_stricter() {
        // 8% faster with 5% more memory
        let comparison = BaselineComparator::default()
            .compare(&metrics(100.0, 1000, 0.0), &metrics(92.0, 1050, 0.0));

        let default = ValidationRulesEngine::default().validate_evolution(&evolution(), &comparison);
        assert!(default.approved);

        let production =
            ValidationRulesEngine::production().validate_evolution(&evolution(), &comparison);
        assert!(!production.approved);
        let failed: Vec<&str> = production.failures.iter().map(|f| f.rule.as_str()).collect();
        assert!(failed.contains(&"minimum-improvement"));
        assert!(failed.contains(&"memory-increase-cap"));
        assert!(production.score < default.score);
    }

    #[test]
    fn test_custom_rules_at_runtime() {
        let engine = ValidationRulesEngine::default();
        let mut comparison = MetricsComparison::neutral();
        comparison.performance.improvement = 30.0;
        comparison.performance.p_value = 0.0;
        comparison.overall.confidence = 0.9;
        assert!(engine.validate_evolution(&evolution(), &comparison).approved);

        engine.add_rule(ValidationRule::predicate(
            "cap-improvement",
            "suspiciously large improvements need review",
            Severity::Low,
            |c| c.performance.improvement < 25.0,
        ));
        let decision = engine.validate_evolution(&evolution(), &comparison);
        assert!(!decision.approved);
        assert_eq!(decision.failures[0].rule, "cap-improvement");

        assert!(engine.remove_rule("cap-improvement"));
        assert!(!engine.remove_rule("cap-improvement"));
        assert!(engine.validate_evolution(&evolution(), &comparison).approved);
    }

    #[test]
    fn test_panicking_rule_is_high_failure() {
        let engine = ValidationRulesEngine::new(vec![ValidationRule::predicate(
            "broken",
            "always panics",
            Severity::Low,
            |_| panic!("boom"),
        )]);
        let decision = engine.validate_evolution(&evolution(), &MetricsComparison::neutral());
        assert!(!decision.approved);
        assert_eq!(decision.failures[0].severity, Severity::High);
        assert_eq!(decision.score, 0.0);
    }

    #[test]
    fn test_empty_rule_set_never_approves() {
        let engine = ValidationRulesEngine::new(Vec::new());
        let decision = engine.validate_evolution(&evolution(), &MetricsComparison::neutral());
        assert!(!decision.approved);
    }

    #[test]
    fn test_policy_rejects_dangerous_code() {
        let validator = SecurityPolicyValidator::new(SecurityPolicy::default()).unwrap();

        let result = validator.validate_code("const x = eval('1 + 1');");
        assert!(!result.valid);
        assert!(result.has_code(IssueCode::DangerousFunction));

        let result = validator.validate_code("const fs = require('fs');\nfs.readFileSync('/etc/passwd');");
        assert!(!result.valid);
        assert!(result.has_code(IssueCode::BlockedPattern));

        let result = validator.validate_code("while (true) { tick(); }");
        assert!(!result.valid);
        assert!(result.has_code(IssueCode::InfiniteLoop));

        let result = validator.validate_code("function add(a, b) { return a + b; }");
        assert!(result.valid);
        assert_eq!(result.score, 100);
    }

    #[test]
    fn test_policy_flags_waive_patterns() {
        let policy = SecurityPolicy {
            allow_filesystem: true,
            ..Default::default()
        };
        let validator = SecurityPolicyValidator::new(policy).unwrap();
        assert!(validator.validate_code("const fs = require('fs');").valid);
        assert!(!validator.validate_code("const net = require('net');").valid);
    }
}
