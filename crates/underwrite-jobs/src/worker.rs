//! Extraction worker: pulls leases from the queue and runs them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use underwrite_core::defaults::{EVENT_BUS_CAPACITY, WORKER_POLL_INTERVAL_MS};
use underwrite_core::{Error, Result};

use crate::orchestrator::RunOutcome;
use crate::pipeline::Pipeline;
use crate::queue::DispatchOutcome;

/// Configuration for the extraction worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Whether to process tasks at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: WORKER_POLL_INTERVAL_MS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable extraction |
    /// | `WORKER_POLL_INTERVAL_MS` | `500` | Polling interval when idle |
    ///
    /// Concurrency is governed by the queue (`QUEUE_MAX_CONCURRENT`).
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(WORKER_POLL_INTERVAL_MS)
            .max(1);

        Self {
            poll_interval_ms,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the extraction worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    RunStarted {
        document_id: Uuid,
        attempt: u32,
    },
    DocumentCompleted {
        document_id: Uuid,
        field_count: usize,
    },
    RetryScheduled {
        document_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    DocumentFailed {
        document_id: Uuid,
        error: String,
    },
    RunSuperseded {
        document_id: Uuid,
    },
    WorkerStarted,
    WorkerStopped,
}

impl WorkerEvent {
    fn from_outcome(document_id: Uuid, outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed { field_count, .. } => WorkerEvent::DocumentCompleted {
                document_id,
                field_count: *field_count,
            },
            RunOutcome::Retrying { attempt, delay, .. } => WorkerEvent::RetryScheduled {
                document_id,
                attempt: *attempt,
                delay: *delay,
            },
            RunOutcome::Failed { error } => WorkerEvent::DocumentFailed {
                document_id,
                error: error.clone(),
            },
            RunOutcome::Superseded => WorkerEvent::RunSuperseded { document_id },
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to stop. In-flight runs finish first.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Pulls leases while admission allows and runs each on its own task.
pub struct ExtractionWorker {
    pipeline: Pipeline,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl ExtractionWorker {
    pub fn new(pipeline: Pipeline, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            pipeline,
            config,
            event_tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Extraction worker is disabled, not starting");
            return;
        }

        let stats = self.pipeline.queue_stats().await;
        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = stats.max_concurrent,
            "Extraction worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut runs = JoinSet::new();

        loop {
            for reaped in self.pipeline.reap_expired().await {
                if let Some(exhausted) = reaped.exhausted {
                    let _ = self.event_tx.send(WorkerEvent::DocumentFailed {
                        document_id: reaped.document_id,
                        error: exhausted.to_string(),
                    });
                }
            }

            let wait = self.fill(&mut runs, poll_interval).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(subsystem = "jobs", component = "worker", "Extraction worker received shutdown signal");
                    break;
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        error!(subsystem = "jobs", component = "worker", error = ?e, "Extraction run panicked");
                    }
                }
                _ = sleep(wait) => {}
            }
        }

        if !runs.is_empty() {
            debug!(in_flight = runs.len(), "Waiting for in-flight runs");
        }
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                error!(subsystem = "jobs", component = "worker", error = ?e, "Extraction run panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "jobs", component = "worker", "Extraction worker stopped");
    }

    /// Spawn runs until the queue refuses; returns how long to idle.
    async fn fill(&self, runs: &mut JoinSet<()>, poll_interval: Duration) -> Duration {
        loop {
            match self.pipeline.queue().try_dispatch().await {
                DispatchOutcome::Leased(lease) => {
                    let document_id = lease.document_id;
                    let _ = self.event_tx.send(WorkerEvent::RunStarted {
                        document_id,
                        attempt: lease.attempt,
                    });
                    let pipeline = self.pipeline.clone();
                    let event_tx = self.event_tx.clone();
                    runs.spawn(async move {
                        let outcome = pipeline.process(lease).await;
                        let _ = event_tx.send(WorkerEvent::from_outcome(document_id, &outcome));
                    });
                }
                DispatchOutcome::Idle { next_due } => {
                    return next_due.map_or(poll_interval, |d| d.min(poll_interval)).max(Duration::from_millis(1));
                }
                DispatchOutcome::Saturated { .. } => return poll_interval,
                DispatchOutcome::RateLimited { retry_after } => {
                    return retry_after.min(poll_interval).max(Duration::from_millis(1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_builders() {
        let config = WorkerConfig::default()
            .with_poll_interval(50)
            .with_enabled(false);
        assert_eq!(config.poll_interval_ms, 50);
        assert!(!config.enabled);
    }

    #[test]
    fn test_events_from_outcomes() {
        let id = Uuid::nil();
        assert_eq!(
            WorkerEvent::from_outcome(id, &RunOutcome::Superseded),
            WorkerEvent::RunSuperseded { document_id: id }
        );
        assert_eq!(
            WorkerEvent::from_outcome(
                id,
                &RunOutcome::Retrying {
                    attempt: 2,
                    delay: Duration::from_secs(1),
                    error: "Oracle timed out after 120s".into()
                }
            ),
            WorkerEvent::RetryScheduled {
                document_id: id,
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
    }
}
