use crate::sandbox::{ResourceLimits, SandboxMetrics, SandboxStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Lifecycle notifications published by the `SandboxManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SandboxEvent {
    Created {
        sandbox_id: String,
        limits: ResourceLimits,
    },
    Started {
        sandbox_id: String,
    },
    Metrics {
        sandbox_id: String,
        metrics: SandboxMetrics,
    },
    Completed {
        sandbox_id: String,
        status: SandboxStatus,
        duration_ms: u64,
    },
    Destroyed {
        sandbox_id: String,
    },
}

impl SandboxEvent {
    pub fn sandbox_id(&self) -> &str {
        match self {
            Self::Created { sandbox_id, .. }
            | Self::Started { sandbox_id }
            | Self::Metrics { sandbox_id, .. }
            | Self::Completed { sandbox_id, .. }
            | Self::Destroyed { sandbox_id } => sandbox_id,
        }
    }
}

/// Consumes lifecycle events into `tracing` until the channel closes.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<SandboxEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SandboxEvent::Metrics {
                    sandbox_id,
                    metrics,
                }) => {
                    tracing::trace!(
                        sandbox_id = %sandbox_id,
                        cpu_percent = metrics.cpu_percent,
                        memory_bytes = metrics.memory_bytes,
                        "Sandbox metrics"
                    );
                }
                Ok(SandboxEvent::Completed {
                    sandbox_id,
                    status,
                    duration_ms,
                }) => {
                    tracing::info!(sandbox_id = %sandbox_id, status = %status, duration_ms, "Sandbox finished");
                }
                Ok(event) => {
                    tracing::debug!(sandbox_id = %event.sandbox_id(), event = ?event, "Sandbox event");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
