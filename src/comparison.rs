//! Baseline vs. evolved metrics comparison.
//!
//! `MetricsComparison` is the contract consumed by regression detection and
//! the rules engine. [`BaselineComparator`] is the reference producer; any
//! other statistics backend can implement [`MetricsComparator`].

use crate::constants::{DEFAULT_NOISE_FLOOR_PCT, DEFAULT_SINGLE_SAMPLE_CONFIDENCE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceMetrics {
    pub execution_time_ms: f64,
    pub memory_usage_bytes: u64,
    pub cpu_percent: f64,
    /// Failed / total, 0.0-1.0
    pub error_rate: f64,
    pub error_types: Vec<String>,
    /// Individual timing samples; `execution_time_ms` is used when empty
    pub samples_ms: Vec<f64>,
}

impl PerformanceMetrics {
    fn timing(&self) -> f64 {
        if self.samples_ms.is_empty() {
            self.execution_time_ms
        } else {
            mean(&self.samples_ms)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceComparison {
    /// Positive means faster
    pub improvement: f64,
    pub confidence: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryComparison {
    pub increase: f64,
    pub leak_detected: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityComparison {
    pub error_rate_change: f64,
    pub new_error_types: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallComparison {
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsComparison {
    pub performance: PerformanceComparison,
    pub memory: MemoryComparison,
    pub reliability: ReliabilityComparison,
    pub overall: OverallComparison,
}

impl MetricsComparison {
    /// No change anywhere, fully confident.
    pub fn neutral() -> Self {
        Self {
            performance: PerformanceComparison {
                improvement: 0.0,
                confidence: 1.0,
                p_value: 1.0,
            },
            memory: MemoryComparison {
                confidence: 1.0,
                ..Default::default()
            },
            reliability: ReliabilityComparison {
                confidence: 1.0,
                ..Default::default()
            },
            overall: OverallComparison { confidence: 1.0 },
        }
    }
}

pub trait MetricsComparator: Send + Sync {
    fn compare(&self, baseline: &PerformanceMetrics, evolved: &PerformanceMetrics)
        -> MetricsComparison;
}

#[derive(Debug, Clone)]
pub struct BaselineComparator {
    /// Relative change under which a single-sample difference is not significant
    pub noise_floor_pct: f64,
    pub single_sample_confidence: f64,
    /// Memory growth at or above this is reported as a leak
    pub leak_increase_pct: f64,
}

impl Default for BaselineComparator {
    fn default() -> Self {
        Self {
            noise_floor_pct: DEFAULT_NOISE_FLOOR_PCT,
            single_sample_confidence: DEFAULT_SINGLE_SAMPLE_CONFIDENCE,
            leak_increase_pct: 50.0,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

fn percent_change(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        (to - from) / from * 100.0
    } else if to > 0.0 {
        100.0
    } else {
        0.0
    }
}

/// Abramowitz & Stegun 7.1.26.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Two-sided Welch t-test p-value with a normal approximation of the t
/// distribution.
pub fn welch_p_value(a: &[f64], b: &[f64]) -> f64 {
    let se = (sample_variance(a) / a.len() as f64 + sample_variance(b) / b.len() as f64).sqrt();
    let diff = mean(a) - mean(b);
    if se == 0.0 {
        return if diff == 0.0 { 1.0 } else { 0.0 };
    }
    let t = diff / se;
    (2.0 * (1.0 - normal_cdf(t.abs()))).clamp(0.0, 1.0)
}

impl MetricsComparator for BaselineComparator {
    fn compare(
        &self,
        baseline: &PerformanceMetrics,
        evolved: &PerformanceMetrics,
    ) -> MetricsComparison {
        let improvement = -percent_change(baseline.timing(), evolved.timing());
        let (p_value, perf_confidence) =
            if baseline.samples_ms.len() >= 2 && evolved.samples_ms.len() >= 2 {
                let p = welch_p_value(&baseline.samples_ms, &evolved.samples_ms);
                (p, 1.0 - p)
            } else if improvement.abs() >= self.noise_floor_pct {
                (0.0, self.single_sample_confidence)
            } else {
                (1.0, self.single_sample_confidence)
            };

        let increase = percent_change(
            baseline.memory_usage_bytes as f64,
            evolved.memory_usage_bytes as f64,
        );

        let known: HashSet<&String> = baseline.error_types.iter().collect();
        let mut new_error_types: Vec<String> = evolved
            .error_types
            .iter()
            .filter(|t| !known.contains(t))
            .cloned()
            .collect();
        new_error_types.sort();
        new_error_types.dedup();

        let memory_confidence = self.single_sample_confidence;
        let reliability_confidence = self.single_sample_confidence;

        MetricsComparison {
            performance: PerformanceComparison {
                improvement,
                confidence: perf_confidence,
                p_value,
            },
            memory: MemoryComparison {
                increase,
                leak_detected: increase >= self.leak_increase_pct,
                confidence: memory_confidence,
            },
            reliability: ReliabilityComparison {
                error_rate_change: evolved.error_rate - baseline.error_rate,
                new_error_types,
                confidence: reliability_confidence,
            },
            overall: OverallComparison {
                confidence: perf_confidence
                    .min(memory_confidence)
                    .min(reliability_confidence),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(time_ms: f64, memory: u64) -> PerformanceMetrics {
        PerformanceMetrics {
            execution_time_ms: time_ms,
            memory_usage_bytes: memory,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_sample_improvement() {
        let cmp = BaselineComparator::default().compare(&metrics(100.0, 1000), &metrics(80.0, 1000));
        assert!((cmp.performance.improvement - 20.0).abs() < 1e-9);
        assert_eq!(cmp.performance.p_value, 0.0);
        assert_eq!(cmp.memory.increase, 0.0);
        assert!(!cmp.memory.leak_detected);
        assert!((cmp.overall.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_noise_is_not_significant() {
        let cmp = BaselineComparator::default().compare(&metrics(100.0, 0), &metrics(99.5, 0));
        assert_eq!(cmp.performance.p_value, 1.0);
    }

    #[test]
    fn test_memory_leak_detection() {
        let cmp = BaselineComparator::default().compare(&metrics(10.0, 100), &metrics(10.0, 200));
        assert!((cmp.memory.increase - 100.0).abs() < 1e-9);
        assert!(cmp.memory.leak_detected);
    }

    #[test]
    fn test_new_error_types() {
        let baseline = PerformanceMetrics {
            error_types: vec!["TypeError".to_string()],
            ..metrics(10.0, 0)
        };
        let evolved = PerformanceMetrics {
            error_rate: 0.25,
            error_types: vec!["TypeError".to_string(), "RangeError".to_string()],
            ..metrics(10.0, 0)
        };
        let cmp = BaselineComparator::default().compare(&baseline, &evolved);
        assert_eq!(cmp.reliability.new_error_types, vec!["RangeError".to_string()]);
        assert!((cmp.reliability.error_rate_change - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_welch_separates_distinct_samples() {
        let slow = [100.0, 101.0, 99.0, 100.5, 99.5];
        let fast = [80.0, 81.0, 79.0, 80.5, 79.5];
        assert!(welch_p_value(&slow, &fast) < 0.01);
        assert!(welch_p_value(&slow, &slow) > 0.99);
    }

    #[test]
    fn test_normal_cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
    }
}
