//! Runs candidate test suites inside the isolation boundary.
//!
//! A [`TestHarness`] is written next to the candidate code and executed by
//! the [`ContainerRuntime`]. It prints a single report line prefixed with
//! [`REPORT_MARKER`] which is parsed into [`TestResults`].

use crate::constants::REPORT_MARKER;
use crate::error::{EvoGuardError, Result};
use crate::sandbox::{
    limits_prelude, ContainerRuntime, EnvironmentHandle, EnvironmentSpec, ExecOutput, ExecRequest,
    ResourceLimits,
};
use crate::security::{IsolatedContext, SecurityViolation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const NODE_HARNESS: &str = r##"'use strict';
const fs = require('fs');
const path = require('path');
const vm = require('vm');

const MARKER = '__EVOGUARD_REPORT__';
const mode = process.env.EVOGUARD_MODE || 'test';
const timeoutMs = Number(process.env.EVOGUARD_TIMEOUT_MS || 0) || undefined;
const caps = (process.env.EVOGUARD_CAPABILITIES || '').split(',').filter(Boolean);
const CAP_MODULES = {
  filesystem: ['fs', 'fs/promises'],
  child_process: ['child_process'],
  network: ['net', 'http', 'https', 'http2', 'dgram', 'tls', 'dns'],
};
const hostModules = caps.flatMap((cap) => CAP_MODULES[cap] || []);

function read(variable) {
  const file = process.env[variable];
  return file ? fs.readFileSync(path.resolve(file), 'utf8') : '';
}

function describe(err) {
  try { return String((err && err.stack) || err); } catch (_) { return 'unprintable error'; }
}

// Compiled from its source text inside the context, so every object and
// function it creates belongs to the context realm. The only host value it
// ever receives is `loadHostModule`, and only when a module capability is
// granted.
function prelude(configJson, loadHostModule) {
  'use strict';
  const config = JSON.parse(configJson);
  const caps = new Set(config.capabilities);
  const hostModules = new Set(config.hostModules);
  const g = globalThis;
  const PromiseCtor = Promise;
  const toJson = JSON.stringify;
  const fromJson = JSON.parse;
  const MAX_TIMER_FIRINGS = 10000;
  const MAX_IDLE_SPINS = 1024;

  const logs = [];
  const violations = [];
  const failures = [];
  const outputs = {};
  const tests = [];
  const counts = { passed: 0, failed: 0, skipped: 0 };
  const timers = [];
  let clock = 0;
  let timerSeq = 0;
  let scriptValue = null;
  let runError = null;
  let finished = false;

  function text(value) {
    try { return String(value); } catch (_) { return 'unprintable value'; }
  }
  function show(value) {
    if (value === undefined) return 'undefined';
    if (typeof value === 'string') return value;
    try { return toJson(value); } catch (_) { return text(value); }
  }
  function plain(value) {
    if (value === undefined || typeof value === 'function') return null;
    try { return fromJson(toJson(value)); } catch (_) { return text(value); }
  }
  function deepEqual(a, b) {
    if (Object.is(a, b)) return true;
    if (a === null || b === null || typeof a !== 'object' || typeof b !== 'object') return false;
    if (Object.getPrototypeOf(a) !== Object.getPrototypeOf(b)) return false;
    const keys = Object.keys(a);
    if (keys.length !== Object.keys(b).length) return false;
    return keys.every((k) => Object.prototype.hasOwnProperty.call(b, k) && deepEqual(a[k], b[k]));
  }
  function violation(kind, name, message) {
    violations.push({ kind, name, message });
    return message;
  }

  function define(name, value) {
    Object.defineProperty(g, name, { value, writable: true, enumerable: false, configurable: true });
  }
  function forbid(name, kind) {
    Object.defineProperty(g, name, {
      enumerable: false,
      configurable: false,
      get() {
        throw new Error(violation(kind, name, `access to '${name}' is not permitted in the isolated context`));
      },
    });
  }

  // Reaching a function's constructor is the way back to code generation
  const denyCodegen = function () {
    throw new EvalError(violation('codegen', 'Function', 'code generation is not permitted in the isolated context'));
  };
  const functionKinds = [function () {}, async function () {}, function* () {}, async function* () {}];
  for (const fn of functionKinds) {
    Object.defineProperty(Object.getPrototypeOf(fn), 'constructor', {
      value: denyCodegen,
      writable: false,
      enumerable: false,
      configurable: false,
    });
  }
  Object.defineProperty(g, 'eval', { value: denyCodegen, writable: false, enumerable: false, configurable: false });

  if (caps.has('console')) {
    const sink = (level) => (...args) => { logs.push(`[${level}] ` + args.map(show).join(' ')); };
    define('console', Object.freeze({
      log: sink('log'), info: sink('info'), warn: sink('warn'), error: sink('error'), debug: sink('debug'),
    }));
  } else {
    forbid('console', 'capability');
  }

  // Timers run on a virtual clock advanced whenever pending work is idle
  function fireNext() {
    if (timers.length === 0) return false;
    timers.sort((a, b) => a.due - b.due || a.id - b.id);
    const timer = timers.shift();
    clock = timer.due;
    if (timer.every) timers.push(Object.assign({}, timer, { due: clock + timer.every }));
    timer.fn(...timer.args);
    return true;
  }
  if (caps.has('timers')) {
    const schedule = (repeat) => (fn, ms, ...args) => {
      if (typeof fn !== 'function') throw new TypeError('timer callback must be a function');
      const delay = Math.max(0, Number(ms) || 0);
      timerSeq += 1;
      timers.push({ id: timerSeq, due: clock + delay, every: repeat ? Math.max(1, delay) : 0, fn, args });
      return timerSeq;
    };
    const cancel = (id) => {
      const index = timers.findIndex((t) => t.id === id);
      if (index >= 0) timers.splice(index, 1);
    };
    define('setTimeout', schedule(false));
    define('setInterval', schedule(true));
    define('clearTimeout', cancel);
    define('clearInterval', cancel);
  } else {
    for (const name of ['setTimeout', 'clearTimeout', 'setInterval', 'clearInterval']) forbid(name, 'capability');
  }
  for (const name of ['process', 'Buffer', 'global', 'setImmediate', 'queueMicrotask']) forbid(name, 'global');

  class AssertionFailure extends Error {
    constructor(message, expected, actual) {
      super(message);
      this.name = 'AssertionError';
      this.expected = show(expected);
      this.actual = show(actual);
    }
  }
  function check(ok, message, expected, actual) {
    if (!ok) throw new AssertionFailure(message, expected, actual);
  }
  const expect = (actual) => Object.freeze({
    toBe: (expected) => check(Object.is(actual, expected), 'expected values to be identical', expected, actual),
    toEqual: (expected) => check(deepEqual(actual, expected), 'expected values to be deeply equal', expected, actual),
    toBeTruthy: () => check(Boolean(actual), 'expected a truthy value', true, actual),
    toThrow: () => {
      let threw = false;
      try { actual(); } catch (_) { threw = true; }
      check(threw, 'expected function to throw', 'throw', 'returned');
    },
  });
  const assert = (cond, message) => check(Boolean(cond), message || 'assertion failed', true, cond);
  assert.ok = assert;
  assert.strictEqual = (actual, expected, message) =>
    check(Object.is(actual, expected), message || 'expected values to be identical', expected, actual);
  assert.deepStrictEqual = (actual, expected, message) =>
    check(deepEqual(actual, expected), message || 'expected values to be deeply equal', expected, actual);
  assert.throws = (fn, message) => {
    let threw = false;
    try { fn(); } catch (_) { threw = true; }
    check(threw, message || 'expected function to throw', 'throw', 'returned');
  };
  Object.freeze(assert);

  const shims = { assert };
  define('require', (name) => {
    const bare = text(name).replace(/^node:/, '');
    if (Object.prototype.hasOwnProperty.call(shims, bare)) return shims[bare];
    if (loadHostModule && hostModules.has(bare)) return loadHostModule(bare);
    throw new Error(violation('module', bare, `module '${bare}' is not available in the isolated context`));
  });

  const test = (name, fn) => { tests.push({ name: text(name), fn, skip: false }); };
  test.skip = (name) => { tests.push({ name: text(name), fn: null, skip: true }); };
  const moduleObject = { exports: {} };
  define('module', moduleObject);
  define('exports', moduleObject.exports);
  define('assert', assert);
  define('assertEqual', (actual, expected, message) =>
    check(deepEqual(actual, expected), message || 'expected values to be equal', expected, actual));
  define('expect', expect);
  define('test', test);
  define('it', test);
  define('describe', (_name, fn) => fn());

  for (const target of [JSON, PromiseCtor, PromiseCtor.prototype, Array.prototype, Function.prototype, Object]) {
    Object.freeze(target);
  }

  // Resolves `value`, firing virtual timers whenever microtasks run dry
  async function settle(value) {
    if (value === null || (typeof value !== 'object' && typeof value !== 'function')) return value;
    if (typeof value.then !== 'function') return value;
    let state = 'pending';
    let result;
    PromiseCtor.resolve(value).then(
      (v) => { state = 'fulfilled'; result = v; },
      (e) => { state = 'rejected'; result = e; },
    );
    let fired = 0;
    while (state === 'pending') {
      for (let spin = 0; spin < MAX_IDLE_SPINS && state === 'pending'; spin += 1) await undefined;
      if (state !== 'pending') break;
      if (fired >= MAX_TIMER_FIRINGS || !fireNext()) throw new Error('asynchronous work never settled');
      fired += 1;
    }
    if (state === 'rejected') throw result;
    return result;
  }

  async function runTests() {
    for (const t of tests) {
      if (t.skip) {
        counts.skipped += 1;
        outputs[t.name] = { status: 'skipped', value: null };
        continue;
      }
      try {
        const value = await settle(t.fn());
        counts.passed += 1;
        outputs[t.name] = { status: 'passed', value: plain(value) };
      } catch (err) {
        counts.failed += 1;
        const e = err || {};
        const message = text(e.message || e);
        failures.push({
          test_name: t.name,
          message,
          expected: e.expected === undefined ? null : text(e.expected),
          actual: e.actual === undefined ? null : text(e.actual),
          stack: e.stack ? text(e.stack) : null,
        });
        outputs[t.name] = { status: 'failed', value: message };
      }
    }
  }

  return Object.freeze({
    start(completion) {
      const work = config.mode === 'script'
        ? settle(completion).then((value) => { scriptValue = plain(value); })
        : runTests();
      work.then(
        () => { finished = true; },
        (err) => { runError = text((err && err.stack) || err); finished = true; },
      );
    },
    done() {
      return finished;
    },
    report() {
      return toJson({
        total: counts.passed + counts.failed + counts.skipped,
        passed: counts.passed,
        failed: counts.failed,
        skipped: counts.skipped,
        failures,
        outputs,
        logs,
        violations,
        value: scriptValue,
        error: runError,
      });
    },
  });
}

const context = vm.createContext(Object.create(null), {
  name: 'evoguard-isolated',
  codeGeneration: { strings: false, wasm: false },
});
const control = vm.runInContext('(' + prelude.toString() + ')', context)(
  JSON.stringify({ mode, capabilities: caps, hostModules }),
  hostModules.length > 0 ? (name) => require(name) : undefined,
);

function nextTurn() {
  return new Promise((resolve) => setImmediate(resolve));
}

(async () => {
  const started = Date.now();
  let loadError = null;
  try {
    const options = (variable) => ({ filename: process.env[variable], timeout: timeoutMs });
    const completion = vm.runInContext(read('EVOGUARD_CODE_FILE'), context, options('EVOGUARD_CODE_FILE'));
    if (mode !== 'script') {
      vm.runInContext(read('EVOGUARD_TEST_FILE'), context, options('EVOGUARD_TEST_FILE'));
    }
    control.start(completion);
    while (control.done() !== true) await nextTurn();
  } catch (err) {
    loadError = describe(err);
  }
  const raw = control.report();
  const inner = JSON.parse(typeof raw === 'string' ? raw : '{}');
  const error = loadError || inner.error || null;
  const violations = inner.violations || [];
  const report = {
    mode,
    total: inner.total || 0,
    passed: inner.passed || 0,
    failed: inner.failed || 0,
    skipped: inner.skipped || 0,
    duration_ms: Date.now() - started,
    failures: inner.failures || [],
    outputs: inner.outputs || {},
    heap_used_bytes: process.memoryUsage().heapUsed,
    logs: inner.logs || [],
    violations,
    value: inner.value === undefined ? null : inner.value,
    error,
  };
  process.stdout.write(MARKER + JSON.stringify(report) + '\n');
  process.exitCode = report.failed === 0 && error === null && violations.length === 0 ? 0 : 1;
})();
"##;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessMode {
    /// Load code, then run the registered tests
    Test,
    /// Evaluate the code and report its completion value
    Script,
}

impl HarnessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Script => "script",
        }
    }
}

/// How to run a suite inside an environment. The default harness targets
/// Node.js; any interpreter that honors the same environment variables and
/// prints the marker report can be substituted.
#[derive(Debug, Clone)]
pub struct TestHarness {
    pub command: Vec<String>,
    pub script_name: String,
    pub script: String,
    pub code_file: String,
    pub test_file: String,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::node()
    }
}

impl TestHarness {
    pub fn node() -> Self {
        Self {
            command: vec!["node".to_string()],
            script_name: "harness.js".to_string(),
            script: NODE_HARNESS.to_string(),
            code_file: "candidate.js".to_string(),
            test_file: "candidate.test.js".to_string(),
        }
    }

    /// Writes code, tests and the harness script into `source_dir`.
    pub async fn materialize(
        &self,
        source_dir: &Path,
        code: &str,
        tests: &str,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(source_dir).await?;
        tokio::fs::write(source_dir.join(&self.code_file), code).await?;
        tokio::fs::write(source_dir.join(&self.test_file), tests).await?;
        tokio::fs::write(source_dir.join(&self.script_name), &self.script).await?;
        Ok(())
    }

    pub fn request(
        &self,
        mode: HarnessMode,
        context: &IsolatedContext,
        limits: &ResourceLimits,
    ) -> ExecRequest {
        let mut args = self.command.clone();
        args.push(self.script_name.clone());

        let mut env: HashMap<String, String> = context.to_env();
        env.insert("EVOGUARD_MODE".to_string(), mode.as_str().to_string());
        env.insert("EVOGUARD_CODE_FILE".to_string(), self.code_file.clone());
        env.insert("EVOGUARD_TEST_FILE".to_string(), self.test_file.clone());
        env.insert(
            "EVOGUARD_TIMEOUT_MS".to_string(),
            limits.execution_timeout_ms.to_string(),
        );

        ExecRequest {
            args: limits_prelude(limits, &args),
            env,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    pub message: String,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeCoverage {
    pub lines_pct: f64,
    pub branches_pct: f64,
    pub functions_pct: f64,
    pub statements_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_ms: u64,
    pub failures: Vec<TestFailure>,
    pub coverage: Option<CodeCoverage>,
}

impl TestResults {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Observable outcome of one test, compared across code versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestOutput {
    pub status: String,
    pub value: Option<serde_json::Value>,
}

/// The marker-prefixed JSON line printed by a harness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessReport {
    pub mode: String,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_ms: u64,
    pub failures: Vec<TestFailure>,
    pub outputs: BTreeMap<String, TestOutput>,
    pub heap_used_bytes: u64,
    pub logs: Vec<String>,
    pub violations: Vec<SecurityViolation>,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub coverage: Option<CodeCoverage>,
}

impl HarnessReport {
    pub fn test_results(&self) -> TestResults {
        TestResults {
            total: self.total,
            passed: self.passed,
            failed: self.failed,
            skipped: self.skipped,
            duration_ms: self.duration_ms,
            failures: self.failures.clone(),
            coverage: self.coverage.clone(),
        }
    }
}

/// Extracts the last report line from harness stdout.
pub fn parse_report(stdout: &str) -> Result<HarnessReport> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim_start().strip_prefix(REPORT_MARKER))
        .ok_or_else(|| EvoGuardError::environment("parse report", "harness printed no report"))?;
    serde_json::from_str(line).map_err(|e| EvoGuardError::environment("parse report", e))
}

/// One harness run: parsed results plus the raw process output.
#[derive(Debug, Clone)]
pub struct SuiteRun {
    pub results: TestResults,
    pub report: HarnessReport,
    pub exec: ExecOutput,
}

impl SuiteRun {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.exec.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.exec.stderr).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    /// Test present for the original code only
    Missing,
    /// Test present for the evolved code only
    Added,
    StatusChanged,
    OutputChanged,
    /// The suite itself failed differently
    ErrorChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDifference {
    pub test_name: String,
    pub kind: DifferenceKind,
    pub original: Option<String>,
    pub evolved: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegressionTestOutcome {
    pub passed: bool,
    pub differences: Vec<BehaviorDifference>,
    pub original: TestResults,
    pub evolved: TestResults,
}

fn render(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

/// Per-test behavioral diff between two reports of the same suite.
pub fn diff_reports(original: &HarnessReport, evolved: &HarnessReport) -> Vec<BehaviorDifference> {
    let mut differences = Vec::new();

    if original.error != evolved.error {
        differences.push(BehaviorDifference {
            test_name: "(suite)".to_string(),
            kind: DifferenceKind::ErrorChanged,
            original: original.error.clone(),
            evolved: evolved.error.clone(),
        });
    }

    let names: BTreeSet<&String> = original.outputs.keys().chain(evolved.outputs.keys()).collect();
    for name in names {
        let diff = match (original.outputs.get(name), evolved.outputs.get(name)) {
            (Some(before), None) => Some((DifferenceKind::Missing, Some(before.status.clone()), None)),
            (None, Some(after)) => Some((DifferenceKind::Added, None, Some(after.status.clone()))),
            (Some(before), Some(after)) if before.status != after.status => Some((
                DifferenceKind::StatusChanged,
                Some(before.status.clone()),
                Some(after.status.clone()),
            )),
            (Some(before), Some(after)) if before.value != after.value => Some((
                DifferenceKind::OutputChanged,
                render(&before.value),
                render(&after.value),
            )),
            _ => None,
        };
        if let Some((kind, original, evolved)) = diff {
            differences.push(BehaviorDifference {
                test_name: name.clone(),
                kind,
                original,
                evolved,
            });
        }
    }

    differences
}

/// Executes suites through a `ContainerRuntime`, either inside an
/// environment the caller already owns or in a throwaway one.
pub struct EvolutionTestRunner {
    runtime: Arc<dyn ContainerRuntime>,
    harness: TestHarness,
    work_root: PathBuf,
    limits: ResourceLimits,
    context: IsolatedContext,
}

impl EvolutionTestRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        harness: TestHarness,
        work_root: impl Into<PathBuf>,
        limits: ResourceLimits,
        context: IsolatedContext,
    ) -> Self {
        Self {
            runtime,
            harness,
            work_root: work_root.into(),
            limits,
            context,
        }
    }

    pub fn harness(&self) -> &TestHarness {
        &self.harness
    }

    pub fn context(&self) -> &IsolatedContext {
        &self.context
    }

    /// Runs the harness in an already started environment whose source
    /// directory holds the materialized suite.
    pub async fn run_in_environment(
        &self,
        handle: &EnvironmentHandle,
        limits: &ResourceLimits,
        mode: HarnessMode,
    ) -> Result<SuiteRun> {
        let request = self.harness.request(mode, &self.context, limits);
        let exec = self
            .runtime
            .exec(handle, &request)
            .await
            .map_err(|e| EvoGuardError::environment("exec", e))?;

        let stdout = String::from_utf8_lossy(&exec.stdout);
        let report = parse_report(&stdout).map_err(|err| {
            let stderr = String::from_utf8_lossy(&exec.stderr);
            tracing::debug!(sandbox_id = %handle.id, exit_code = exec.exit_code, stderr = %stderr, "Harness produced no report");
            err
        })?;

        Ok(SuiteRun {
            results: report.test_results(),
            report,
            exec,
        })
    }

    pub async fn run_tests(&self, code: &str, tests: &str) -> Result<TestResults> {
        let run = self.run_ephemeral("test", code, tests, HarnessMode::Test).await?;
        Ok(run.results)
    }

    pub async fn run_script(&self, code: &str) -> Result<HarnessReport> {
        let run = self.run_ephemeral("iso", code, "", HarnessMode::Script).await?;
        Ok(run.report)
    }

    /// Runs the same suite against both versions concurrently and reports
    /// every observable behavioral difference.
    pub async fn run_regression_tests(
        &self,
        evolved_code: &str,
        original_code: &str,
        regression_tests: &str,
    ) -> Result<RegressionTestOutcome> {
        let (original, evolved) = futures::try_join!(
            self.run_ephemeral("reg-orig", original_code, regression_tests, HarnessMode::Test),
            self.run_ephemeral("reg-evo", evolved_code, regression_tests, HarnessMode::Test),
        )?;

        let differences = diff_reports(&original.report, &evolved.report);
        if !differences.is_empty() {
            tracing::info!(
                differences = differences.len(),
                "Regression suite observed behavioral differences"
            );
        }

        Ok(RegressionTestOutcome {
            passed: differences.is_empty(),
            differences,
            original: original.results,
            evolved: evolved.results,
        })
    }

    async fn run_ephemeral(
        &self,
        label: &str,
        code: &str,
        tests: &str,
        mode: HarnessMode,
    ) -> Result<SuiteRun> {
        let name = format!("{}-{}", label, uuid::Uuid::new_v4().simple());
        let workspace = self.work_root.join(&name);
        let spec = EnvironmentSpec::new(&name, &workspace, self.limits.clone(), self.context.clone());
        let materialized = match tokio::fs::create_dir_all(&spec.output_dir).await {
            Ok(()) => self.harness.materialize(&spec.source_dir, code, tests).await,
            Err(e) => Err(e),
        };
        if let Err(e) = materialized {
            let _ = tokio::fs::remove_dir_all(&workspace).await;
            return Err(e.into());
        }

        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&workspace).await;
                return Err(EvoGuardError::environment("create", e));
            }
        };

        let timeout = Duration::from_millis(self.limits.execution_timeout_ms);
        let outcome = tokio::time::timeout(timeout, async {
            self.runtime
                .start(&handle)
                .await
                .map_err(|e| EvoGuardError::environment("start", e))?;
            self.run_in_environment(&handle, &self.limits, mode).await
        })
        .await
        .unwrap_or_else(|_| {
            Err(EvoGuardError::ExecutionTimeout {
                sandbox_id: name.clone(),
                timeout_ms: self.limits.execution_timeout_ms,
            })
        });

        if let Err(e) = self.runtime.stop(&handle).await {
            tracing::warn!(environment = %name, error = %e, "Failed to stop environment");
        }
        if let Err(e) = self.runtime.remove(&handle).await {
            tracing::warn!(environment = %name, error = %e, "Failed to remove environment");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            tracing::warn!(environment = %name, error = %e, "Failed to remove workspace");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outputs: &[(&str, &str, serde_json::Value)]) -> HarnessReport {
        HarnessReport {
            outputs: outputs
                .iter()
                .map(|(name, status, value)| {
                    (
                        name.to_string(),
                        TestOutput {
                            status: status.to_string(),
                            value: Some(value.clone()),
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_report_takes_last_marker_line() {
        let stdout = format!(
            "noise\n{m}{{\"total\":9}}\nmore noise\n{m}{{\"total\":1,\"passed\":1,\"duration_ms\":4}}\n",
            m = REPORT_MARKER
        );
        let report = parse_report(&stdout).unwrap();
        let results = report.test_results();
        assert_eq!(results.total, 1);
        assert_eq!(results.passed, 1);
        assert_eq!(results.failed, 0);
        assert_eq!(results.duration_ms, 4);
    }

    #[test]
    fn test_parse_report_missing_marker() {
        let err = parse_report("hello\n").unwrap_err();
        assert!(matches!(err, EvoGuardError::Environment { .. }));
        assert!(parse_report(&format!("{}not json", REPORT_MARKER)).is_err());
    }

    #[test]
    fn test_request_wraps_command_and_exports_context() {
        let harness = TestHarness::node();
        let request = harness.request(
            HarnessMode::Test,
            &IsolatedContext::minimal(),
            &ResourceLimits::default(),
        );
        assert_eq!(request.args[0], "/bin/sh");
        assert!(request.args[2].ends_with("exec 'node' 'harness.js'"));
        assert_eq!(request.env["EVOGUARD_MODE"], "test");
        assert_eq!(request.env["EVOGUARD_CODE_FILE"], "candidate.js");
        assert_eq!(request.env["EVOGUARD_CAPABILITIES"], "console,timers");
    }

    #[tokio::test]
    async fn test_materialize_writes_suite() {
        let dir = tempfile::tempdir().unwrap();
        let harness = TestHarness::node();
        harness
            .materialize(&dir.path().join("src"), "code", "tests")
            .await
            .unwrap();
        let src = dir.path().join("src");
        assert_eq!(std::fs::read_to_string(src.join("candidate.js")).unwrap(), "code");
        assert_eq!(std::fs::read_to_string(src.join("candidate.test.js")).unwrap(), "tests");
        assert!(std::fs::read_to_string(src.join("harness.js"))
            .unwrap()
            .contains(REPORT_MARKER));
    }

    #[test]
    fn test_node_harness_builds_api_inside_context() {
        let script = TestHarness::node().script;
        assert!(script.contains("vm.runInContext('(' + prelude.toString() + ')', context)"));
        assert!(script.contains("codeGeneration: { strings: false, wasm: false }"));
        assert!(script.contains("vm.createContext(Object.create(null)"));
    }

    #[test]
    fn test_diff_reports_classifies_changes() {
        let original = report(&[
            ("same", "passed", serde_json::json!(1)),
            ("status", "passed", serde_json::json!(null)),
            ("value", "passed", serde_json::json!(5)),
            ("gone", "passed", serde_json::json!(null)),
        ]);
        let evolved = report(&[
            ("same", "passed", serde_json::json!(1)),
            ("status", "failed", serde_json::json!("boom")),
            ("value", "passed", serde_json::json!(6)),
            ("new", "passed", serde_json::json!(null)),
        ]);
        let diffs = diff_reports(&original, &evolved);
        let kind = |name: &str| diffs.iter().find(|d| d.test_name == name).map(|d| d.kind);
        assert_eq!(diffs.len(), 4);
        assert_eq!(kind("status"), Some(DifferenceKind::StatusChanged));
        assert_eq!(kind("value"), Some(DifferenceKind::OutputChanged));
        assert_eq!(kind("gone"), Some(DifferenceKind::Missing));
        assert_eq!(kind("new"), Some(DifferenceKind::Added));
        assert_eq!(kind("same"), None);
    }

    #[test]
    fn test_identical_reports_have_no_differences() {
        let a = report(&[("t", "passed", serde_json::json!([1, 2]))]);
        assert!(diff_reports(&a, &a.clone()).is_empty());
    }
}
