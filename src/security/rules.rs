use crate::error::{EvoGuardError, Result};
use crate::security::{
    line_of, BlockedPattern, Capability, IssueCode, IssueLevel, SecurityPolicy, ValidationIssue,
};
use regex::Regex;
use std::collections::HashSet;

/// One entry of the ordered policy: inspects source, reports issues.
pub trait PolicyRule: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, source: &str) -> Vec<ValidationIssue>;
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| EvoGuardError::Config(format!("invalid pattern for rule '{}': {}", name, e)))
}

/// Flags every match of a regular expression.
pub struct PatternRule {
    name: String,
    regex: Regex,
    code: IssueCode,
    level: IssueLevel,
    message: String,
}

impl PatternRule {
    pub fn new(
        name: &str,
        pattern: &str,
        code: IssueCode,
        level: IssueLevel,
        message: &str,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            regex: compile(name, pattern)?,
            code,
            level,
            message: message.to_string(),
        })
    }

    pub fn from_blocked(pattern: &BlockedPattern) -> Result<Self> {
        Self::new(
            &pattern.name,
            &pattern.pattern,
            pattern.code,
            pattern.level,
            &pattern.message,
        )
    }
}

impl PolicyRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, source: &str) -> Vec<ValidationIssue> {
        self.regex
            .find_iter(source)
            .map(|m| ValidationIssue {
                code: self.code,
                level: self.level,
                rule: self.name.clone(),
                message: format!("{}: `{}`", self.message, m.as_str().trim()),
                line: Some(line_of(source, m.start())),
            })
            .collect()
    }
}

/// Rejects imports of modules outside the allowlist.
pub struct ModuleAllowlistRule {
    allowed: HashSet<String>,
    import: Regex,
}

impl ModuleAllowlistRule {
    pub fn new(policy: &SecurityPolicy) -> Result<Self> {
        let mut allowed: HashSet<String> = policy.allowed_modules.iter().cloned().collect();
        let granted: &[(Capability, &[&str])] = &[
            (Capability::Filesystem, &["fs", "fs/promises"]),
            (Capability::ChildProcess, &["child_process"]),
            (
                Capability::Network,
                &["net", "http", "https", "http2", "dgram", "tls", "dns"],
            ),
        ];
        for (cap, modules) in granted {
            if policy.grants(*cap) {
                allowed.extend(modules.iter().map(|m| m.to_string()));
            }
        }

        Ok(Self {
            allowed,
            import: compile(
                "module-allowlist",
                r#"(?:\brequire\s*\(\s*|\bimport\s*\(\s*|\bfrom\s+|\bimport\s+)['"]([^'"]+)['"]"#,
            )?,
        })
    }
}

impl PolicyRule for ModuleAllowlistRule {
    fn name(&self) -> &str {
        "module-allowlist"
    }

    fn check(&self, source: &str) -> Vec<ValidationIssue> {
        self.import
            .captures_iter(source)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let module = caps.get(1)?.as_str();
                let bare = module.strip_prefix("node:").unwrap_or(module);
                if self.allowed.contains(bare) {
                    return None;
                }
                Some(ValidationIssue {
                    code: IssueCode::UnauthorizedModule,
                    level: IssueLevel::Error,
                    rule: self.name().to_string(),
                    message: format!("module '{}' is not in the allowlist", module),
                    line: Some(line_of(source, whole.start())),
                })
            })
            .collect()
    }
}

pub struct CodeSizeRule {
    max_bytes: usize,
}

impl CodeSizeRule {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl PolicyRule for CodeSizeRule {
    fn name(&self) -> &str {
        "code-size"
    }

    fn check(&self, source: &str) -> Vec<ValidationIssue> {
        if source.len() <= self.max_bytes {
            return Vec::new();
        }
        vec![ValidationIssue {
            code: IssueCode::CodeTooLarge,
            level: IssueLevel::Error,
            rule: self.name().to_string(),
            message: format!(
                "code is {} bytes, maximum is {}",
                source.len(),
                self.max_bytes
            ),
            line: None,
        }]
    }
}

/// Flags `while (true)` / `for (;;)` loops whose body has no exit.
pub struct InfiniteLoopRule {
    header: Regex,
    exit: Regex,
    level: IssueLevel,
}

impl InfiniteLoopRule {
    pub fn new(as_error: bool) -> Result<Self> {
        Ok(Self {
            header: compile(
                "infinite-loop",
                r"\bwhile\s*\(\s*(?:true|1)\s*\)|\bfor\s*\(\s*;\s*;\s*\)",
            )?,
            exit: compile("infinite-loop", r"\b(?:break|return|throw)\b")?,
            level: if as_error {
                IssueLevel::Error
            } else {
                IssueLevel::Warning
            },
        })
    }
}

/// Text of the brace-delimited block starting at or after `from`, or the
/// single statement up to the next `;` when there is no block.
fn loop_body(source: &str, from: usize) -> &str {
    let rest = &source[from..];
    let trimmed = rest.trim_start();
    if !trimmed.starts_with('{') {
        return rest.split(';').next().unwrap_or(rest);
    }
    let open = from + (rest.len() - trimmed.len());
    let mut depth = 0usize;
    for (i, ch) in source[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return &source[open..open + i + 1];
                }
            }
            _ => {}
        }
    }
    &source[open..]
}

impl PolicyRule for InfiniteLoopRule {
    fn name(&self) -> &str {
        "infinite-loop"
    }

    fn check(&self, source: &str) -> Vec<ValidationIssue> {
        self.header
            .find_iter(source)
            .filter(|m| !self.exit.is_match(loop_body(source, m.end())))
            .map(|m| ValidationIssue {
                code: IssueCode::InfiniteLoop,
                level: self.level,
                rule: self.name().to_string(),
                message: format!("unbounded loop `{}` without break or return", m.as_str()),
                line: Some(line_of(source, m.start())),
            })
            .collect()
    }
}

/// Warns when branching exceeds a budget.
pub struct ComplexityRule {
    max_branches: usize,
    branch: Regex,
}

impl ComplexityRule {
    pub fn new(max_branches: usize) -> Result<Self> {
        Ok(Self {
            max_branches,
            branch: compile(
                "complexity",
                r"\b(?:if|for|while|case|catch)\b|&&|\|\||\?\?",
            )?,
        })
    }
}

impl PolicyRule for ComplexityRule {
    fn name(&self) -> &str {
        "complexity"
    }

    fn check(&self, source: &str) -> Vec<ValidationIssue> {
        let branches = self.branch.find_iter(source).count();
        if branches <= self.max_branches {
            return Vec::new();
        }
        vec![ValidationIssue {
            code: IssueCode::HighComplexity,
            level: IssueLevel::Warning,
            rule: self.name().to_string(),
            message: format!(
                "{} branch points exceed the budget of {}",
                branches, self.max_branches
            ),
            line: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_loop_without_exit() {
        let rule = InfiniteLoopRule::new(true).unwrap();
        let issues = rule.check("let i = 0;\nwhile (true) { i++; }\n");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::InfiniteLoop);
        assert_eq!(issues[0].level, IssueLevel::Error);
        assert_eq!(issues[0].line, Some(2));
    }

    #[test]
    fn test_loop_with_break_is_fine() {
        let rule = InfiniteLoopRule::new(true).unwrap();
        let source = "for (;;) { if (done()) { break; } step(); }";
        assert!(rule.check(source).is_empty());
    }

    #[test]
    fn test_infinite_loop_as_warning_when_relaxed() {
        let rule = InfiniteLoopRule::new(false).unwrap();
        let issues = rule.check("while(1) tick();");
        assert_eq!(issues[0].level, IssueLevel::Warning);
    }

    #[test]
    fn test_module_allowlist() {
        let rule = ModuleAllowlistRule::new(&SecurityPolicy::default()).unwrap();
        let issues = rule.check("const a = require('assert');\nimport x from 'left-pad';\n");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("left-pad"));
        assert_eq!(issues[0].line, Some(2));
    }

    #[test]
    fn test_node_prefix_is_normalized() {
        let rule = ModuleAllowlistRule::new(&SecurityPolicy::default()).unwrap();
        assert!(rule.check("const assert = require('node:assert');").is_empty());
        assert_eq!(rule.check("const util = require('node:util');").len(), 1);
    }

    #[test]
    fn test_complexity_warning() {
        let rule = ComplexityRule::new(2).unwrap();
        let issues = rule.check("if (a && b) { } else if (c) { }");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::HighComplexity);
        assert!(ComplexityRule::new(10).unwrap().check("if (a) {}").is_empty());
    }
}
