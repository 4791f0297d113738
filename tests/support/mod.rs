#![allow(dead_code)]

//! Scripted `ContainerRuntime` for integration tests. Every call is
//! recorded; `exec` answers with whatever the responder returns for the
//! materialized candidate source.

use anyhow::{bail, Result};
use async_trait::async_trait;
use evoguard::constants::REPORT_MARKER;
use evoguard::sandbox::{
    EnvironmentHandle, EnvironmentSpec, ExecOutput, ExecRequest, RuntimeStats,
};
use evoguard::ContainerRuntime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct Reply {
    pub stdout: String,
    pub exit_code: i32,
    pub delay: Duration,
}

impl Reply {
    pub fn report(report: serde_json::Value) -> Self {
        Self {
            stdout: format!("some test output\n{}{}\n", REPORT_MARKER, report),
            exit_code: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn raw(stdout: &str, exit_code: i32) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_code,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A passing single-test report taking `duration_ms` and using `heap` bytes.
pub fn passing_report(duration_ms: u64, heap: u64) -> serde_json::Value {
    serde_json::json!({
        "mode": "test",
        "total": 1,
        "passed": 1,
        "failed": 0,
        "skipped": 0,
        "duration_ms": duration_ms,
        "heap_used_bytes": heap,
        "outputs": { "adds": { "status": "passed", "value": 3 } },
    })
}

type Responder = Box<dyn Fn(&str) -> Reply + Send + Sync>;

pub struct MockRuntime {
    responder: Responder,
    calls: Mutex<Vec<String>>,
    sources: Mutex<HashMap<String, PathBuf>>,
    pub fail_remove: bool,
    pub fail_prepare: bool,
}

impl MockRuntime {
    pub fn new(responder: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            sources: Mutex::new(HashMap::new()),
            fail_remove: false,
            fail_prepare: false,
        }
    }

    pub fn passing(duration_ms: u64, heap: u64) -> Self {
        Self::new(move |_| Reply::report(passing_report(duration_ms, heap)))
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls of one kind (`create`, `stop`, ...).
    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, id: &str) {
        self.calls.lock().push(format!("{}:{}", op, id));
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn prepare(&self) -> Result<()> {
        self.record("prepare", "-");
        if self.fail_prepare {
            bail!("image unavailable");
        }
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        self.record("create", &spec.name);
        self.sources
            .lock()
            .insert(spec.name.clone(), spec.source_dir.clone());
        Ok(EnvironmentHandle {
            id: spec.name.clone(),
            runtime: "mock".to_string(),
        })
    }

    async fn start(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.record("start", &handle.id);
        Ok(())
    }

    async fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest) -> Result<ExecOutput> {
        self.record("exec", &handle.id);
        let code_file = request
            .env
            .get("EVOGUARD_CODE_FILE")
            .cloned()
            .unwrap_or_else(|| "candidate.js".to_string());
        let source = self.sources.lock().get(&handle.id).cloned();
        let code = match source {
            Some(dir) => std::fs::read_to_string(dir.join(code_file))?,
            None => bail!("unknown environment {}", handle.id),
        };

        let reply = (self.responder)(&code);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        Ok(ExecOutput {
            exit_code: reply.exit_code,
            stdout: reply.stdout.into_bytes(),
            stderr: Vec::new(),
        })
    }

    async fn stats(&self, _handle: &EnvironmentHandle) -> Result<RuntimeStats> {
        Ok(RuntimeStats {
            cpu_percent: 12.5,
            memory_bytes: 4096,
            pids: 1,
            ..Default::default()
        })
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.record("stop", &handle.id);
        Ok(())
    }

    async fn remove(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.record("remove", &handle.id);
        self.sources.lock().remove(&handle.id);
        if self.fail_remove {
            bail!("device busy");
        }
        Ok(())
    }
}
