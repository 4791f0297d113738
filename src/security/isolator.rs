use crate::error::{EvoGuardError, Result};
use crate::runner::EvolutionTestRunner;
use crate::security::{SecurityPolicy, SecurityPolicyValidator, ValidationIssue, ValidationResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Environment variable carrying the granted capability list into the sandbox.
pub const CAPABILITIES_ENV: &str = "EVOGUARD_CAPABILITIES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Logging sink
    Console,
    Timers,
    Filesystem,
    ChildProcess,
    Network,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Timers => "timers",
            Self::Filesystem => "filesystem",
            Self::ChildProcess => "child_process",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit capability allowlist handed to isolated code. Starts empty;
/// anything not granted is absent inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedContext {
    capabilities: BTreeSet<Capability>,
}

impl IsolatedContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Console and timers only.
    pub fn minimal() -> Self {
        Self::empty()
            .grant(Capability::Console)
            .grant(Capability::Timers)
    }

    pub fn grant(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    pub fn to_env(&self) -> HashMap<String, String> {
        let list: Vec<&str> = self.capabilities.iter().map(|c| c.as_str()).collect();
        HashMap::from([(CAPABILITIES_ENV.to_string(), list.join(","))])
    }
}

/// Result of running a script through the isolation boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolatedOutput {
    pub value: Option<serde_json::Value>,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

/// Validation gate in front of every isolated execution.
#[derive(Clone)]
pub struct CodeIsolator {
    validator: Arc<SecurityPolicyValidator>,
}

impl CodeIsolator {
    pub fn new(validator: Arc<SecurityPolicyValidator>) -> Self {
        Self { validator }
    }

    pub fn from_policy(policy: SecurityPolicy) -> Result<Self> {
        Ok(Self::new(Arc::new(SecurityPolicyValidator::new(policy)?)))
    }

    pub fn validator(&self) -> &SecurityPolicyValidator {
        &self.validator
    }

    pub fn validate_code(&self, source: &str) -> ValidationResult {
        self.validator.validate_code(source)
    }

    /// Like `validate_code`, but a rejection becomes `StaticValidation`.
    pub fn ensure_valid(&self, source: &str) -> Result<ValidationResult> {
        let result = self.validate_code(source);
        if result.valid {
            Ok(result)
        } else {
            Err(result.into_error())
        }
    }

    /// Validates code together with its test suite. Both come from the same
    /// generator and run in the same context; test suite findings are
    /// prefixed so they can be told apart.
    pub fn validate_suite(&self, code: &str, tests: &str) -> ValidationResult {
        let mut result = self.validate_code(code);
        if tests.is_empty() {
            return result;
        }
        let suite = self.validate_code(tests);
        let tagged = |issue: ValidationIssue| ValidationIssue {
            message: format!("test suite: {}", issue.message),
            ..issue
        };
        result.errors.extend(suite.errors.into_iter().map(&tagged));
        result.warnings.extend(suite.warnings.into_iter().map(&tagged));
        result.valid = result.errors.is_empty();
        result.score = result.score.min(suite.score);
        result
    }

    pub fn ensure_suite_valid(&self, code: &str, tests: &str) -> Result<ValidationResult> {
        let result = self.validate_suite(code, tests);
        if result.valid {
            Ok(result)
        } else {
            Err(result.into_error())
        }
    }

    /// Minimal context plus whatever the policy explicitly grants.
    pub fn create_isolated_context(&self) -> IsolatedContext {
        let policy = self.validator.policy();
        [
            Capability::Filesystem,
            Capability::ChildProcess,
            Capability::Network,
        ]
        .into_iter()
        .filter(|cap| policy.grants(*cap))
        .fold(IsolatedContext::minimal(), IsolatedContext::grant)
    }

    /// Validates `code`, evaluates it in a throwaway environment, and fails
    /// if the code reached for any capability outside its context.
    pub async fn execute_isolated(
        &self,
        runner: &EvolutionTestRunner,
        code: &str,
    ) -> Result<IsolatedOutput> {
        self.ensure_valid(code)?;
        let report = runner.run_script(code).await?;

        if let Some(violation) = report.violations.first() {
            tracing::warn!(
                violations = report.violations.len(),
                name = %violation.name,
                "Isolated code touched a forbidden capability"
            );
            return Err(EvoGuardError::SecurityViolation {
                name: violation.name.clone(),
                message: violation.message.clone(),
            });
        }

        Ok(IsolatedOutput {
            value: report.value,
            logs: report.logs,
            error: report.error,
        })
    }
}
