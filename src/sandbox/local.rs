use crate::sandbox::{
    ContainerRuntime, EnvironmentHandle, EnvironmentSpec, ExecOutput, ExecRequest, RuntimeStats,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

struct LocalEnvironment {
    source_dir: PathBuf,
    running: bool,
    pid: Option<u32>,
    stop: Arc<Notify>,
}

/// Runs environments as plain host processes in their private working
/// directory with a scrubbed environment. Only the `ulimit` prelude applies,
/// so this backend is meant for development and tests.
#[derive(Default)]
pub struct LocalRuntime {
    environments: Mutex<HashMap<String, LocalEnvironment>>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_env<T>(&self, id: &str, f: impl FnOnce(&mut LocalEnvironment) -> T) -> Result<T> {
        let mut envs = self.environments.lock();
        let env = envs
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown local environment {}", id))?;
        Ok(f(env))
    }
}

fn resident_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    fn name(&self) -> &str {
        "local"
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        tokio::fs::create_dir_all(&spec.source_dir).await?;
        tokio::fs::create_dir_all(&spec.output_dir).await?;

        let mut envs = self.environments.lock();
        if envs.contains_key(&spec.name) {
            bail!("local environment {} already exists", spec.name);
        }
        envs.insert(
            spec.name.clone(),
            LocalEnvironment {
                source_dir: spec.source_dir.clone(),
                running: false,
                pid: None,
                stop: Arc::new(Notify::new()),
            },
        );

        Ok(EnvironmentHandle {
            id: spec.name.clone(),
            runtime: self.name().to_string(),
        })
    }

    async fn start(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.with_env(&handle.id, |env| {
            env.running = true;
            env.stop = Arc::new(Notify::new());
        })
    }

    async fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest) -> Result<ExecOutput> {
        let (source_dir, stop) = self.with_env(&handle.id, |env| {
            (env.running, env.source_dir.clone(), env.stop.clone())
        })
        .and_then(|(running, dir, stop)| {
            if running {
                Ok((dir, stop))
            } else {
                Err(anyhow!("local environment {} is not running", handle.id))
            }
        })?;

        let (program, args) = request
            .args
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .envs(&request.env)
            .current_dir(&source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;

        let pid = child.id();
        self.with_env(&handle.id, |env| env.pid = pid)?;

        let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not captured"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not captured"))?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = stop.notified() => {
                child.kill().await.ok();
                bail!("local environment {} was stopped during exec", handle.id);
            }
        };

        let _ = self.with_env(&handle.id, |env| env.pid = None);

        Ok(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_task.await??,
            stderr: stderr_task.await??,
        })
    }

    async fn stats(&self, handle: &EnvironmentHandle) -> Result<RuntimeStats> {
        let pid = self.with_env(&handle.id, |env| env.pid)?;
        Ok(match pid {
            Some(pid) => RuntimeStats {
                memory_bytes: resident_bytes(pid).unwrap_or(0),
                pids: 1,
                ..RuntimeStats::default()
            },
            None => RuntimeStats::default(),
        })
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()> {
        if let Some(env) = self.environments.lock().get_mut(&handle.id) {
            env.running = false;
            env.pid = None;
            env.stop.notify_one();
        }
        Ok(())
    }

    async fn remove(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.environments.lock().remove(&handle.id);
        Ok(())
    }
}
