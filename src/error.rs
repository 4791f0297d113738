/// evoguard error types and handling utilities
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Main error type for evoguard operations
#[derive(Debug, Error)]
pub enum EvoGuardError {
    /// Candidate rejected by the static security policy before any sandbox exists
    #[error("Static validation failed (score {score}): {}", .errors.join("; "))]
    StaticValidation { errors: Vec<String>, score: u8 },

    /// Live sandbox ceiling reached; the caller may retry after backoff
    #[error("Concurrency limit reached: {live} live sandboxes (max {max})")]
    ConcurrencyLimit { live: usize, max: usize },

    /// Create/start/stop/remove/exec failure at the isolated-execution boundary
    #[error("Environment error in {operation}: {reason}")]
    Environment { operation: String, reason: String },

    /// Execution lost the race against its timeout
    #[error("Execution of sandbox {sandbox_id} timed out after {timeout_ms}ms")]
    ExecutionTimeout { sandbox_id: String, timeout_ms: u64 },

    /// A validation rule predicate failed to evaluate
    #[error("Rule check '{rule}' errored: {reason}")]
    RuleCheck { rule: String, reason: String },

    /// Isolated code touched a capability outside its allowlist
    #[error("Security violation ({name}): {message}")]
    SecurityViolation { name: String, message: String },

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Sandbox {sandbox_id} is {status}, cannot {operation}")]
    InvalidState {
        sandbox_id: String,
        status: String,
        operation: String,
    },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Snapshot store operation failed
    #[error("Storage error in {operation}: {reason}")]
    Storage { operation: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EvoGuardError>;

impl EvoGuardError {
    pub fn environment(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Environment {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn storage(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Helper to determine if an error is retryable
pub fn is_retryable(err: &EvoGuardError) -> bool {
    match err {
        EvoGuardError::ConcurrencyLimit { .. } => true,
        EvoGuardError::Environment { .. } => true,
        EvoGuardError::StaticValidation { .. } => false,
        EvoGuardError::ExecutionTimeout { .. } => false,
        EvoGuardError::RuleCheck { .. } => false,
        EvoGuardError::SecurityViolation { .. } => false,
        EvoGuardError::SandboxNotFound(_) => false,
        EvoGuardError::InvalidState { .. } => false,
        EvoGuardError::SnapshotNotFound(_) => false,
        EvoGuardError::Storage { .. } => false,
        EvoGuardError::Config(_) => false,
        EvoGuardError::Io(_) => false,
        EvoGuardError::Other(_) => false,
    }
}

/// Retry configuration for resilient operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff, then clamp to max
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter)
        .max(0.0)
        .min(config.max_backoff_ms as f64) as u64
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Sleeps `calculate_backoff` between attempts.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt + 1 < config.max_attempts => {
                let backoff = calculate_backoff(attempt, config);
                tracing::warn!(attempt, backoff_ms = backoff, error = %err, "Retrying after backoff");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_static_validation_display() {
        let err = EvoGuardError::StaticValidation {
            errors: vec!["eval() call".to_string(), "child_process".to_string()],
            score: 25,
        };
        let msg = err.to_string();
        assert!(msg.contains("score 25"));
        assert!(msg.contains("eval() call; child_process"));
    }

    #[test]
    fn test_retryable_detection() {
        let limit = EvoGuardError::ConcurrencyLimit { live: 10, max: 10 };
        assert!(is_retryable(&limit));

        let timeout = EvoGuardError::ExecutionTimeout {
            sandbox_id: "sbx".to_string(),
            timeout_ms: 100,
        };
        assert!(!is_retryable(&timeout));
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();
        for attempt in 0..6 {
            assert!(calculate_backoff(attempt, &config) <= config.max_backoff_ms);
        }
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        };
        let result: Result<()> = retry_with_backoff(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EvoGuardError::SandboxNotFound("x".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_concurrency_limit() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        };
        let result = retry_with_backoff(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EvoGuardError::ConcurrencyLimit { live: 1, max: 1 })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
