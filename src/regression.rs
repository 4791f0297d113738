use crate::comparison::MetricsComparison;
use crate::constants::{
    DEFAULT_ERROR_RATE_THRESHOLD, DEFAULT_MEMORY_THRESHOLD_PCT, DEFAULT_PERFORMANCE_THRESHOLD_PCT,
    DEFAULT_VARIANCE_CONFIDENCE_FLOOR,
};
use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionType {
    Performance,
    Memory,
    Reliability,
    Variance,
}

impl fmt::Display for RegressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Performance => "performance",
            Self::Memory => "memory",
            Self::Reliability => "reliability",
            Self::Variance => "variance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub regression_type: RegressionType,
    pub severity: Severity,
    /// Magnitude in the unit of the underlying metric (percent or rate)
    pub impact: f64,
    pub confidence: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    SafeToApply,
    MonitorAfterApplying,
    ReviewBeforeApplying,
    DoNotApply,
}

impl Recommendation {
    /// Derived only from which severities are present.
    pub fn from_severities(severities: &BTreeSet<Severity>) -> Self {
        if severities.contains(&Severity::High) {
            Self::DoNotApply
        } else if severities.contains(&Severity::Medium) {
            Self::ReviewBeforeApplying
        } else if severities.contains(&Severity::Low) {
            Self::MonitorAfterApplying
        } else {
            Self::SafeToApply
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SafeToApply => "safe to apply",
            Self::MonitorAfterApplying => "monitor after applying",
            Self::ReviewBeforeApplying => "review before applying",
            Self::DoNotApply => "do not apply",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionAnalysis {
    pub has_regressions: bool,
    pub regressions: Vec<Regression>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionThresholds {
    /// Percent slowdown tolerated before flagging
    pub performance_pct: f64,
    /// Percent memory growth tolerated
    pub memory_pct: f64,
    /// Absolute error-rate increase tolerated
    pub error_rate: f64,
    /// Overall confidence below which a low-severity variance regression is
    /// raised. Placeholder heuristic, tune per deployment.
    pub variance_confidence_floor: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            performance_pct: DEFAULT_PERFORMANCE_THRESHOLD_PCT,
            memory_pct: DEFAULT_MEMORY_THRESHOLD_PCT,
            error_rate: DEFAULT_ERROR_RATE_THRESHOLD,
            variance_confidence_floor: DEFAULT_VARIANCE_CONFIDENCE_FLOOR,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegressionDetector {
    thresholds: RegressionThresholds,
}

impl RegressionDetector {
    pub fn new(thresholds: RegressionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &RegressionThresholds {
        &self.thresholds
    }

    pub fn detect_regressions(&self, comparison: &MetricsComparison) -> RegressionAnalysis {
        let t = &self.thresholds;
        let mut regressions = Vec::new();

        let perf = &comparison.performance;
        if perf.improvement < -t.performance_pct {
            let slowdown = -perf.improvement;
            let severity = if slowdown > 20.0 {
                Severity::High
            } else if slowdown > 10.0 {
                Severity::Medium
            } else {
                Severity::Low
            };
            regressions.push(Regression {
                regression_type: RegressionType::Performance,
                severity,
                impact: slowdown,
                confidence: perf.confidence,
                description: format!("execution is {:.1}% slower than baseline", slowdown),
            });
        }

        let memory = &comparison.memory;
        if memory.increase > t.memory_pct {
            regressions.push(Regression {
                regression_type: RegressionType::Memory,
                severity: if memory.leak_detected {
                    Severity::High
                } else {
                    Severity::Medium
                },
                impact: memory.increase,
                confidence: memory.confidence,
                description: if memory.leak_detected {
                    format!("memory grew {:.1}% with a suspected leak", memory.increase)
                } else {
                    format!("memory grew {:.1}%", memory.increase)
                },
            });
        }

        let reliability = &comparison.reliability;
        if reliability.error_rate_change > t.error_rate {
            regressions.push(Regression {
                regression_type: RegressionType::Reliability,
                severity: Severity::High,
                impact: reliability.error_rate_change,
                confidence: reliability.confidence,
                description: format!(
                    "error rate increased by {:.3}",
                    reliability.error_rate_change
                ),
            });
        }
        for error_type in &reliability.new_error_types {
            regressions.push(Regression {
                regression_type: RegressionType::Reliability,
                severity: Severity::Medium,
                impact: 1.0,
                confidence: reliability.confidence,
                description: format!("new error type introduced: {}", error_type),
            });
        }

        if comparison.overall.confidence < t.variance_confidence_floor {
            regressions.push(Regression {
                regression_type: RegressionType::Variance,
                severity: Severity::Low,
                impact: t.variance_confidence_floor - comparison.overall.confidence,
                confidence: comparison.overall.confidence,
                description: format!(
                    "comparison confidence {:.2} is below {:.2}; results are unstable",
                    comparison.overall.confidence, t.variance_confidence_floor
                ),
            });
        }

        let severities: BTreeSet<Severity> = regressions.iter().map(|r| r.severity).collect();
        let recommendation = Recommendation::from_severities(&severities);
        if !regressions.is_empty() {
            tracing::info!(
                count = regressions.len(),
                recommendation = %recommendation,
                "Regressions detected"
            );
        }

        RegressionAnalysis {
            has_regressions: !regressions.is_empty(),
            regressions,
            recommendation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionTrends {
    /// Most frequent first; ties broken by type order
    pub most_frequent: Vec<(RegressionType, usize)>,
    /// Severity-weighted average over all regressions (high=3, medium=2, low=1)
    pub average_severity: f64,
    /// Fraction of analyses with no regressions at all
    pub clean_rate: f64,
}

pub fn analyze_regression_trends(history: &[RegressionAnalysis]) -> RegressionTrends {
    if history.is_empty() {
        return RegressionTrends::default();
    }

    let mut counts: HashMap<RegressionType, usize> = HashMap::new();
    let mut weight_sum = 0.0;
    let mut total = 0usize;
    for regression in history.iter().flat_map(|a| &a.regressions) {
        *counts.entry(regression.regression_type).or_insert(0) += 1;
        weight_sum += regression.severity.weight();
        total += 1;
    }

    let mut most_frequent: Vec<(RegressionType, usize)> = counts.into_iter().collect();
    most_frequent.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let clean = history.iter().filter(|a| !a.has_regressions).count();

    RegressionTrends {
        most_frequent,
        average_severity: if total == 0 {
            0.0
        } else {
            weight_sum / total as f64
        },
        clean_rate: clean as f64 / history.len() as f64,
    }
}
