use criterion::{criterion_group, criterion_main, Criterion};
use evoguard::comparison::{BaselineComparator, MetricsComparator, PerformanceMetrics};
use evoguard::regression::RegressionDetector;
use evoguard::rules::{EvolutionDescriptor, ValidationRulesEngine};
use evoguard::security::{SecurityPolicy, SecurityPolicyValidator};
use std::hint::black_box;

fn bench_static_validation(c: &mut Criterion) {
    let validator = SecurityPolicyValidator::new(SecurityPolicy::default()).unwrap();

    // A realistic candidate: a few hundred small functions
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!(
            "function step{i}(xs) {{\n  let acc = 0;\n  for (const x of xs) {{\n    if (x % {m} === 0 && x > 0) {{ acc += x; }}\n  }}\n  return acc;\n}}\n",
            i = i,
            m = i % 7 + 2
        ));
    }

    c.bench_function("static validation", |b| {
        b.iter(|| validator.validate_code(black_box(&source)))
    });
}

fn bench_regression_and_rules(c: &mut Criterion) {
    let comparator = BaselineComparator::default();
    let detector = RegressionDetector::default();
    let engine = ValidationRulesEngine::default();
    let evolution = EvolutionDescriptor {
        id: "bench".to_string(),
        description: String::new(),
    };
    let baseline = PerformanceMetrics {
        execution_time_ms: 100.0,
        memory_usage_bytes: 10_000,
        samples_ms: (0..50).map(|i| 100.0 + (i % 5) as f64).collect(),
        ..Default::default()
    };
    let evolved = PerformanceMetrics {
        execution_time_ms: 90.0,
        memory_usage_bytes: 10_500,
        samples_ms: (0..50).map(|i| 90.0 + (i % 3) as f64).collect(),
        ..Default::default()
    };

    c.bench_function("compare, detect and validate", |b| {
        b.iter(|| {
            let comparison = comparator.compare(black_box(&baseline), black_box(&evolved));
            let analysis = detector.detect_regressions(&comparison);
            let decision = engine.validate_evolution(&evolution, &comparison);
            (analysis, decision)
        })
    });
}

criterion_group!(benches, bench_static_validation, bench_regression_and_rules);
criterion_main!(benches);
