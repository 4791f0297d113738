/// The bundled Node harness end to end through the local runtime. Every test
/// returns early when `node` is not installed in the standard system paths.
#[cfg(test)]
mod tests {
    use evoguard::runner::DifferenceKind;
    use evoguard::sandbox::LocalRuntime;
    use evoguard::security::{default_blocked_patterns, CodeIsolator, SecurityPolicy};
    use evoguard::{ContainerRuntime, EvoGuardError, SandboxManager, SandboxStatus};
    use std::process::Command;
    use std::sync::Arc;
    use tempfile::TempDir;

    const ADD: &str = "function add(a, b) { return a + b; }";

    /// The local runtime only searches the standard system directories
    fn node_available() -> bool {
        let found = Command::new("/bin/sh")
            .args(["-c", "command -v node"])
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !found {
            eprintln!("node not found, skipping");
        }
        found
    }

    fn manager(policy: SecurityPolicy, dir: &TempDir) -> SandboxManager {
        let isolator = CodeIsolator::from_policy(policy).unwrap();
        SandboxManager::new(
            Arc::new(LocalRuntime::new()) as Arc<dyn ContainerRuntime>,
            isolator,
            dir.path().join("work"),
        )
    }

    /// Default policy minus the static constructor check, so only the
    /// context boundary stands between the code and the host
    fn without_constructor_check() -> SecurityPolicy {
        SecurityPolicy {
            blocked_patterns: default_blocked_patterns()
                .into_iter()
                .filter(|p| p.name != "constructor-access")
                .collect(),
            ..SecurityPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_passing_suite_reports_counts() {
        if !node_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let manager = manager(SecurityPolicy::default(), &dir);

        let tests = "test('adds', () => { expect(add(2, 3)).toBe(5); });\n\
                     test('waits', () => new Promise((resolve) => setTimeout(() => resolve(add(1, 1)), 50)));\n\
                     test.skip('later');";
        let instance = manager.create_sandbox(ADD, tests, None).await.unwrap();
        let result = manager.execute(&instance.id).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        let results = result.test_results.unwrap();
        assert_eq!(
            (results.total, results.passed, results.failed, results.skipped),
            (3, 2, 0, 1)
        );
        assert!(result.security_violations.is_none());
        assert!(result.performance.unwrap().memory_usage_bytes > 0);
        assert_eq!(
            manager.get_sandbox(&instance.id).unwrap().status,
            SandboxStatus::Completed
        );
        manager.destroy_sandbox(&instance.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_assertion_carries_expected_and_actual() {
        if !node_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let manager = manager(SecurityPolicy::default(), &dir);

        let tests = "test('adds', () => { expect(add(2, 2)).toBe(5); });";
        let instance = manager.create_sandbox(ADD, tests, None).await.unwrap();
        let result = manager.execute(&instance.id).await.unwrap();

        assert!(!result.success);
        let results = result.test_results.unwrap();
        assert_eq!((results.total, results.failed), (1, 1));
        let failure = &results.failures[0];
        assert_eq!(failure.test_name, "adds");
        assert_eq!(failure.expected.as_deref(), Some("5"));
        assert_eq!(failure.actual.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_constructor_escape_is_a_violation() {
        if !node_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let manager = manager(without_constructor_check(), &dir);

        let code = format!(
            "const P = expect.constructor('return pro' + 'cess')();\nconst pid = P.pid;\n{}",
            ADD
        );
        let tests = "test('adds', () => { expect(add(2, 3)).toBe(5); });";
        let instance = manager.create_sandbox(&code, tests, None).await.unwrap();
        let result = manager.execute(&instance.id).await.unwrap();

        assert!(!result.success);
        assert!(result.error.is_some());
        let violations = result.security_violations.unwrap();
        assert_eq!(violations[0].kind, "codegen");
        assert_eq!(violations[0].name, "Function");
    }

    #[tokio::test]
    async fn test_escape_is_rejected_before_any_environment() {
        let dir = TempDir::new().unwrap();
        let manager = manager(SecurityPolicy::default(), &dir);

        let code = format!("const P = expect.constructor('return pro' + 'cess')();\n{}", ADD);
        let err = manager.create_sandbox(&code, "", None).await.unwrap_err();
        assert!(matches!(err, EvoGuardError::StaticValidation { .. }));
        assert!(!dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_isolated_script_capabilities() {
        if !node_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let manager = manager(SecurityPolicy::default(), &dir);
        let isolator = manager.isolator();

        let output = isolator
            .execute_isolated(manager.runner(), "console.log('hi');\n6 * 7")
            .await
            .unwrap();
        assert_eq!(output.value, Some(serde_json::json!(42)));
        assert_eq!(output.logs, vec!["[log] hi".to_string()]);

        let output = isolator
            .execute_isolated(
                manager.runner(),
                "const assert = require('assert');\nassert.strictEqual(add2(1), 3);\nfunction add2(x) { return x + 2; }\n'ok'",
            )
            .await
            .unwrap();
        assert_eq!(output.value, Some(serde_json::json!("ok")));

        let err = isolator
            .execute_isolated(manager.runner(), "const pid = process.pid;")
            .await
            .unwrap_err();
        match err {
            EvoGuardError::SecurityViolation { name, .. } => assert_eq!(name, "process"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_allowlisted_module_without_capability_is_absent() {
        if !node_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let policy = SecurityPolicy {
            allowed_modules: vec!["assert".to_string(), "util".to_string()],
            ..SecurityPolicy::default()
        };
        let manager = manager(policy, &dir);

        let err = manager
            .isolator()
            .execute_isolated(manager.runner(), "const util = require('util');")
            .await
            .unwrap_err();
        match err {
            EvoGuardError::SecurityViolation { name, .. } => assert_eq!(name, "util"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_regression_suite_diffs_observable_outputs() {
        if !node_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let manager = manager(SecurityPolicy::default(), &dir);

        let evolved = "function add(a, b) { return a === 2 ? a + b + 1 : a + b; }";
        let suite = "test('small', () => add(2, 3));\ntest('large', () => add(10, 5));";
        let outcome = manager
            .runner()
            .run_regression_tests(evolved, ADD, suite)
            .await
            .unwrap();

        assert!(!outcome.passed);
        assert_eq!(outcome.differences.len(), 1);
        let difference = &outcome.differences[0];
        assert_eq!(difference.test_name, "small");
        assert_eq!(difference.kind, DifferenceKind::OutputChanged);
        assert_eq!(difference.original.as_deref(), Some("5"));
        assert_eq!(difference.evolved.as_deref(), Some("6"));
        assert_eq!(outcome.original.passed, 2);
        assert_eq!(outcome.evolved.passed, 2);
    }
}
