use std::io;
/// Structured logging and observability utilities for evoguard
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evoguard=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for structured logging aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::ACTIVE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Counters for pipeline evaluations
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub total_evaluations: u64,
    pub approved: u64,
    pub rejected: u64,
    pub static_rejections: u64,
    pub timeouts: u64,
    pub total_duration_ms: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approval_rate(&self) -> f64 {
        let total = self.approved + self.rejected;
        if total == 0 {
            0.0
        } else {
            (self.approved as f64) / (total as f64)
        }
    }

    pub fn average_evaluation_ms(&self) -> f64 {
        if self.total_evaluations == 0 {
            0.0
        } else {
            (self.total_duration_ms as f64) / (self.total_evaluations as f64)
        }
    }
}

#[macro_export]
macro_rules! log_sandbox_created {
    ($id:expr, $limits:expr) => {
        tracing::info!(
            sandbox_id = %$id,
            memory_mb = $limits.memory_mb,
            timeout_ms = $limits.execution_timeout_ms,
            network = $limits.network_enabled,
            "Sandbox created"
        );
    };
}

#[macro_export]
macro_rules! log_sandbox_destroyed {
    ($id:expr, $clean:expr) => {
        tracing::info!(sandbox_id = %$id, clean = $clean, "Sandbox destroyed");
    };
}

#[macro_export]
macro_rules! log_rule_failure {
    ($rule:expr, $severity:expr, $message:expr) => {
        tracing::debug!(
            rule = %$rule,
            severity = %$severity,
            message = %$message,
            "Validation rule failed"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_rate_calculation() {
        let mut stats = PipelineStats::new();
        stats.approved = 3;
        stats.rejected = 1;

        assert!((stats.approval_rate() - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_average_evaluation_time() {
        let mut stats = PipelineStats::new();
        stats.total_evaluations = 4;
        stats.total_duration_ms = 2000;

        assert!((stats.average_evaluation_ms() - 500.0).abs() < 0.1);
    }

    #[test]
    fn test_init_logging_refuses_second_subscriber() {
        let _ = init_logging(false);
        assert!(init_logging(true).is_err());
    }

    #[test]
    fn test_zero_stats() {
        let stats = PipelineStats::new();
        assert_eq!(stats.approval_rate(), 0.0);
        assert_eq!(stats.average_evaluation_ms(), 0.0);
    }
}
