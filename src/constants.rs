// Centralized constants for evoguard to avoid magic numbers

/// Default ceiling on simultaneously live sandboxes
pub const DEFAULT_MAX_CONCURRENT_SANDBOXES: usize = 10;

/// Default CPU share weight (cgroup `cpu.shares`, 1024 = one full share)
pub const DEFAULT_CPU_SHARES: u64 = 512;

/// Default memory cap in megabytes
pub const DEFAULT_MEMORY_MB: u64 = 512;

/// Default disk quota in megabytes
pub const DEFAULT_DISK_MB: u64 = 1024;

/// Default maximum number of processes inside a sandbox
pub const DEFAULT_MAX_PROCESSES: u64 = 50;

/// Default maximum number of open file descriptors inside a sandbox
pub const DEFAULT_MAX_FILE_DESCRIPTORS: u64 = 1024;

/// Default execution timeout in milliseconds (5 minutes)
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Interval between live metrics samples of a running sandbox
pub const DEFAULT_METRICS_POLL_INTERVAL_MS: u64 = 1000;

/// Default maximum candidate source size in bytes (1 MB)
pub const DEFAULT_MAX_CODE_SIZE: usize = 1024 * 1024;

/// Branching keywords above which a complexity warning is emitted
pub const DEFAULT_MAX_BRANCHES: usize = 50;

/// Lifecycle event broadcast channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Prefix of the single structured report line printed by test harnesses
pub const REPORT_MARKER: &str = "__EVOGUARD_REPORT__";

/// Default regression thresholds (percent / absolute)
pub const DEFAULT_PERFORMANCE_THRESHOLD_PCT: f64 = 5.0;
pub const DEFAULT_MEMORY_THRESHOLD_PCT: f64 = 10.0;
pub const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.0;

/// Confidence floor below which a low-severity variance regression is raised
pub const DEFAULT_VARIANCE_CONFIDENCE_FLOOR: f64 = 0.5;

/// Confidence reported by the baseline comparator for single-sample measurements
pub const DEFAULT_SINGLE_SAMPLE_CONFIDENCE: f64 = 0.8;

/// Relative change (percent) below which a single-sample difference is noise
pub const DEFAULT_NOISE_FLOOR_PCT: f64 = 1.0;
