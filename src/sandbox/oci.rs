use crate::sandbox::spec::{build_spec, CONTAINER_WORKSPACE, NOBODY};
use crate::sandbox::{
    ContainerRuntime, EnvironmentHandle, EnvironmentSpec, ExecOutput, ExecRequest, RuntimeStats,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Drives a runc-compatible OCI runtime CLI. Each environment gets a bundle
/// under its working directory whose `config.json` carries the hard limits.
pub struct OciRuntime {
    binary: PathBuf,
    rootfs: PathBuf,
    state_root: PathBuf,
    /// Last cumulative CPU reading per environment, for utilisation deltas
    cpu_samples: Mutex<HashMap<String, (u64, Instant)>>,
}

impl OciRuntime {
    pub fn new(
        binary: impl Into<PathBuf>,
        rootfs: impl Into<PathBuf>,
        state_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            rootfs: rootfs.into(),
            state_root: state_root.into(),
            cpu_samples: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.state_root);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to invoke {}", self.binary.display()))?;
        Ok(output)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary.display(),
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }

    /// Like `run_checked`, but a container that is already gone or stopped
    /// counts as success.
    async fn run_idempotent(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("does not exist") || stderr.contains("not running") {
            tracing::debug!(args = ?args, "OCI container already gone");
            return Ok(());
        }
        bail!(
            "{} {} failed: {}",
            self.binary.display(),
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )
    }

    fn cpu_percent(&self, id: &str, total_ns: u64) -> f64 {
        let now = Instant::now();
        let previous = self
            .cpu_samples
            .lock()
            .insert(id.to_string(), (total_ns, now));
        match previous {
            Some((prev_ns, at)) => {
                let elapsed = now.duration_since(at).as_nanos() as f64;
                if elapsed <= 0.0 {
                    0.0
                } else {
                    total_ns.saturating_sub(prev_ns) as f64 / elapsed * 100.0
                }
            }
            None => 0.0,
        }
    }
}

pub(crate) fn bundle_dir(workspace: &Path) -> PathBuf {
    workspace.join("bundle")
}

/// Parses the JSON emitted by `runc events --stats`.
fn parse_stats(raw: &[u8]) -> Result<(RuntimeStats, u64)> {
    let event: serde_json::Value = serde_json::from_slice(raw)?;
    let data = &event["data"];
    let cpu_total = data["cpu"]["usage"]["total"].as_u64().unwrap_or(0);

    let (rx, tx) = data["network_interfaces"]
        .as_array()
        .map(|ifaces| {
            ifaces.iter().fold((0u64, 0u64), |(rx, tx), iface| {
                (
                    rx + iface["rx_bytes"].as_u64().unwrap_or(0),
                    tx + iface["tx_bytes"].as_u64().unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    Ok((
        RuntimeStats {
            cpu_percent: 0.0,
            memory_bytes: data["memory"]["usage"]["usage"].as_u64().unwrap_or(0),
            pids: data["pids"]["current"].as_u64().unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        },
        cpu_total,
    ))
}

#[async_trait]
impl ContainerRuntime for OciRuntime {
    fn name(&self) -> &str {
        "oci"
    }

    async fn prepare(&self) -> Result<()> {
        if !self.rootfs.is_dir() {
            bail!("OCI rootfs {} is not a directory", self.rootfs.display());
        }
        tokio::fs::create_dir_all(&self.state_root).await?;
        let output = self
            .run_checked(&["--version"])
            .await
            .context("OCI runtime binary is not usable")?;
        let version = String::from_utf8_lossy(&output.stdout);
        tracing::info!(
            binary = %self.binary.display(),
            version = %version.lines().next().unwrap_or_default(),
            "OCI runtime prepared"
        );
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        tokio::fs::create_dir_all(&spec.source_dir).await?;
        tokio::fs::create_dir_all(&spec.output_dir).await?;
        let bundle = bundle_dir(&spec.workspace_dir);
        tokio::fs::create_dir_all(&bundle).await?;

        let keepalive = vec!["sleep".to_string(), "infinity".to_string()];
        let config = build_spec(spec, &self.rootfs, &keepalive)?;
        tokio::fs::write(bundle.join("config.json"), serde_json::to_vec_pretty(&config)?).await?;

        let bundle_arg = bundle.to_string_lossy().into_owned();
        self.run_checked(&["create", "--bundle", &bundle_arg, &spec.name])
            .await?;

        Ok(EnvironmentHandle {
            id: spec.name.clone(),
            runtime: self.name().to_string(),
        })
    }

    async fn start(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.run_checked(&["start", &handle.id]).await?;
        Ok(())
    }

    async fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest) -> Result<ExecOutput> {
        if request.args.is_empty() {
            return Err(anyhow!("empty command"));
        }
        let user = format!("{}:{}", NOBODY, NOBODY);
        let mut cmd = self.command();
        cmd.args(["exec", "--no-new-privs", "--cwd", CONTAINER_WORKSPACE, "--user", user.as_str()]);
        let mut env: Vec<_> = request.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        cmd.arg(&handle.id).args(&request.args);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to exec in {}", handle.id))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn stats(&self, handle: &EnvironmentHandle) -> Result<RuntimeStats> {
        let output = self.run_checked(&["events", "--stats", &handle.id]).await?;
        let (mut stats, cpu_total) = parse_stats(&output.stdout)?;
        stats.cpu_percent = self.cpu_percent(&handle.id, cpu_total);
        Ok(stats)
    }

    async fn stop(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.run_idempotent(&["kill", &handle.id, "KILL"]).await
    }

    async fn remove(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.cpu_samples.lock().remove(&handle.id);
        self.run_idempotent(&["delete", "--force", &handle.id]).await
    }
}
