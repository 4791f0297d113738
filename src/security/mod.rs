//! Static safety validation of candidate source against a configurable policy.
//!
//! The policy is an ordered list of [`PolicyRule`]s. The default list covers
//! dynamic evaluation, process spawning, filesystem/network modules, module
//! allowlisting, code size, unbounded loops and branching complexity.

use crate::constants::{DEFAULT_MAX_BRANCHES, DEFAULT_MAX_CODE_SIZE};
use crate::error::{EvoGuardError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod isolator;
pub mod rules;

pub use isolator::{Capability, CodeIsolator, IsolatedContext, IsolatedOutput};
pub use rules::{
    CodeSizeRule, ComplexityRule, InfiniteLoopRule, ModuleAllowlistRule, PatternRule, PolicyRule,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    DangerousFunction,
    BlockedPattern,
    CriticalPattern,
    UnauthorizedModule,
    CodeTooLarge,
    InfiniteLoop,
    HighComplexity,
    SuspiciousConstruct,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DangerousFunction => "DANGEROUS_FUNCTION",
            Self::BlockedPattern => "BLOCKED_PATTERN",
            Self::CriticalPattern => "CRITICAL_PATTERN",
            Self::UnauthorizedModule => "UNAUTHORIZED_MODULE",
            Self::CodeTooLarge => "CODE_TOO_LARGE",
            Self::InfiniteLoop => "INFINITE_LOOP",
            Self::HighComplexity => "HIGH_COMPLEXITY",
            Self::SuspiciousConstruct => "SUSPICIOUS_CONSTRUCT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Warning,
    Error,
    Critical,
}

impl IssueLevel {
    fn penalty(self) -> i32 {
        match self {
            Self::Critical => 50,
            Self::Error => 25,
            Self::Warning => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub level: IssueLevel,
    pub rule: String,
    pub message: String,
    pub line: Option<usize>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} at line {}: {}", self.code, line, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// 0-100; critical errors cost 50, errors 25, warnings 5
    pub score: u8,
}

impl ValidationResult {
    pub fn has_code(&self, code: IssueCode) -> bool {
        self.errors.iter().chain(&self.warnings).any(|i| i.code == code)
    }

    pub fn into_error(self) -> EvoGuardError {
        EvoGuardError::StaticValidation {
            errors: self.errors.iter().map(|e| e.to_string()).collect(),
            score: self.score,
        }
    }
}

/// A violation observed while code ran (as opposed to a static finding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: String,
    pub name: String,
    pub message: String,
}

/// Forbidden construct expressed as a regular expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedPattern {
    pub name: String,
    pub pattern: String,
    pub code: IssueCode,
    pub level: IssueLevel,
    pub message: String,
    /// Capability that, when granted by the policy, waives this pattern
    #[serde(default)]
    pub waived_by: Option<Capability>,
}

impl BlockedPattern {
    fn new(name: &str, pattern: &str, code: IssueCode, level: IssueLevel, message: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            code,
            level,
            message: message.to_string(),
            waived_by: None,
        }
    }

    fn waived_by(mut self, capability: Capability) -> Self {
        self.waived_by = Some(capability);
        self
    }
}

/// Immutable per pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub allowed_modules: Vec<String>,
    pub blocked_patterns: Vec<BlockedPattern>,
    pub max_code_size: usize,
    pub max_branches: usize,
    pub allow_filesystem: bool,
    pub allow_child_process: bool,
    pub allow_network: bool,
    /// Unbounded loops threaten the timeout budget; errors unless relaxed
    pub infinite_loop_is_error: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            // The isolated context implements no other module itself
            allowed_modules: vec!["assert".to_string()],
            blocked_patterns: default_blocked_patterns(),
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            max_branches: DEFAULT_MAX_BRANCHES,
            allow_filesystem: false,
            allow_child_process: false,
            allow_network: false,
            infinite_loop_is_error: true,
        }
    }
}

impl SecurityPolicy {
    pub fn grants(&self, capability: Capability) -> bool {
        match capability {
            Capability::Console | Capability::Timers => true,
            Capability::Filesystem => self.allow_filesystem,
            Capability::ChildProcess => self.allow_child_process,
            Capability::Network => self.allow_network,
        }
    }
}

pub fn default_blocked_patterns() -> Vec<BlockedPattern> {
    vec![
        BlockedPattern::new(
            "dynamic-eval",
            r"\beval\s*\(",
            IssueCode::DangerousFunction,
            IssueLevel::Critical,
            "dynamic code evaluation via eval()",
        ),
        BlockedPattern::new(
            "function-constructor",
            r"\b(?:new\s+)?Function\s*\(",
            IssueCode::DangerousFunction,
            IssueLevel::Critical,
            "dynamic code evaluation via the Function constructor",
        ),
        BlockedPattern::new(
            "child-process-module",
            r#"(?:require\s*\(\s*|from\s+|import\s*\(\s*)['"](?:node:)?child_process['"]"#,
            IssueCode::CriticalPattern,
            IssueLevel::Critical,
            "child_process grants arbitrary process spawning",
        )
        .waived_by(Capability::ChildProcess),
        BlockedPattern::new(
            "process-spawn",
            r#"\b(?:execSync|execFileSync|execFile|spawnSync|spawn|fork)\s*\(|child_process['"]\s*\)\s*\.\s*exec\s*\("#,
            IssueCode::DangerousFunction,
            IssueLevel::Error,
            "process spawning call",
        )
        .waived_by(Capability::ChildProcess),
        BlockedPattern::new(
            "filesystem-module",
            r#"(?:require\s*\(\s*|from\s+|import\s*\(\s*)['"](?:node:)?fs(?:/promises)?['"]"#,
            IssueCode::BlockedPattern,
            IssueLevel::Error,
            "unrestricted filesystem access",
        )
        .waived_by(Capability::Filesystem),
        BlockedPattern::new(
            "network-module",
            r#"(?:require\s*\(\s*|from\s+|import\s*\(\s*)['"](?:node:)?(?:net|http|https|http2|dgram|tls|dns)['"]"#,
            IssueCode::BlockedPattern,
            IssueLevel::Error,
            "network access",
        )
        .waived_by(Capability::Network),
        BlockedPattern::new(
            "runtime-internals",
            r#"(?:require\s*\(\s*|from\s+|import\s*\(\s*)['"](?:node:)?(?:vm|worker_threads|cluster|v8|inspector)['"]"#,
            IssueCode::CriticalPattern,
            IssueLevel::Critical,
            "access to runtime internals",
        ),
        BlockedPattern::new(
            "process-control",
            r"\bprocess\s*\.\s*(?:exit|kill|abort|binding|dlopen|chdir|setuid|setgid)\b",
            IssueCode::DangerousFunction,
            IssueLevel::Error,
            "process control",
        ),
        BlockedPattern::new(
            "prototype-escape",
            r"__proto__|\bconstructor\s*\.\s*constructor\b",
            IssueCode::BlockedPattern,
            IssueLevel::Error,
            "prototype chain escape",
        ),
        BlockedPattern::new(
            "constructor-access",
            r#"\.\s*constructor\s*\(|\[\s*['"`]constructor['"`]\s*\]"#,
            IssueCode::DangerousFunction,
            IssueLevel::Critical,
            "constructor reached through property access",
        ),
        BlockedPattern::new(
            "string-timer",
            r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#,
            IssueCode::DangerousFunction,
            IssueLevel::Error,
            "string-bodied timer evaluates code",
        ),
        BlockedPattern::new(
            "debugger-statement",
            r"\bdebugger\b",
            IssueCode::SuspiciousConstruct,
            IssueLevel::Warning,
            "debugger statement",
        ),
        BlockedPattern::new(
            "with-statement",
            r"\bwith\s*\(",
            IssueCode::SuspiciousConstruct,
            IssueLevel::Warning,
            "with statement obscures scope",
        ),
    ]
}

/// Runs the ordered policy rules over candidate source.
pub struct SecurityPolicyValidator {
    policy: SecurityPolicy,
    rules: Vec<Box<dyn PolicyRule>>,
}

impl SecurityPolicyValidator {
    /// Compiles the policy into its rule list. Fails on an invalid pattern.
    pub fn new(policy: SecurityPolicy) -> Result<Self> {
        let mut rules: Vec<Box<dyn PolicyRule>> =
            vec![Box::new(CodeSizeRule::new(policy.max_code_size))];
        for pattern in &policy.blocked_patterns {
            if let Some(cap) = pattern.waived_by {
                if policy.grants(cap) {
                    continue;
                }
            }
            rules.push(Box::new(PatternRule::from_blocked(pattern)?));
        }
        rules.push(Box::new(ModuleAllowlistRule::new(&policy)?));
        rules.push(Box::new(InfiniteLoopRule::new(policy.infinite_loop_is_error)?));
        rules.push(Box::new(ComplexityRule::new(policy.max_branches)?));

        Ok(Self { policy, rules })
    }

    /// Appends a custom rule after the built-in ones.
    pub fn with_rule(mut self, rule: Box<dyn PolicyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn validate_code(&self, source: &str) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for rule in &self.rules {
            for issue in rule.check(source) {
                if issue.level == IssueLevel::Warning {
                    warnings.push(issue);
                } else {
                    errors.push(issue);
                }
            }
        }

        let penalty: i32 = errors
            .iter()
            .chain(&warnings)
            .map(|issue| issue.level.penalty())
            .sum();
        let score = (100 - penalty).clamp(0, 100) as u8;

        if !errors.is_empty() {
            tracing::warn!(
                errors = errors.len(),
                warnings = warnings.len(),
                score,
                "Candidate rejected by security policy"
            );
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
            score,
        }
    }
}

/// 1-based line number of a byte offset.
pub(crate) fn line_of(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())].matches('\n').count() + 1
}
