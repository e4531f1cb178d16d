//! One-shot task workers
//!
//! A worker reads one batch from the service's `data` channel as its own
//! consumer, runs each message through the pipeline and exits. The
//! controller decides how many of them exist at any time.

use std::sync::Arc;

use cannon_ledger::{Channel, Ledger, LedgerError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::controller::{WorkerHandle, WorkerKind, WorkerSpawner, WorkerSpec};
use crate::pipeline::{Pipeline, PipelineError};

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Reading or claiming failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Publishing results or acknowledging failed
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// What a finished worker did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Messages read or claimed
    pub received: usize,
    /// Messages whose pipeline hit a failing task
    pub failed: usize,
    /// Messages whose ack removed a pending entry
    pub acked: usize,
}

/// A single-batch consumer of the `data` channel
pub struct TaskWorker {
    ledger: Ledger,
    pipeline: Arc<Pipeline>,
    spec: WorkerSpec,
}

impl TaskWorker {
    /// Create a worker reading as a fresh, unique consumer
    pub fn new(ledger: &Ledger, pipeline: Arc<Pipeline>, spec: WorkerSpec) -> Self {
        Self {
            ledger: ledger.with_consumer(format!("worker-{}", Uuid::now_v7())),
            pipeline,
            spec,
        }
    }

    /// Consumer name this worker reads as
    pub fn consumer(&self) -> &str {
        self.ledger.consumer()
    }

    /// Read one batch, process it and exit
    #[instrument(skip(self), fields(consumer = %self.ledger.consumer(), kind = %self.spec.kind))]
    pub async fn run(self) -> Result<WorkerReport, WorkerError> {
        let messages = match self.spec.kind {
            WorkerKind::Backlog => {
                self.ledger
                    .claim_pending(Channel::Data, self.spec.count, self.spec.min_idle)
                    .await?
            }
            WorkerKind::Hot | WorkerKind::Idle => {
                self.ledger
                    .read(Channel::Data, Some(self.spec.count), self.spec.block)
                    .await?
            }
        };

        let mut report = WorkerReport {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            debug!("no messages");
            return Ok(report);
        }

        if self.spec.kind == WorkerKind::Backlog {
            info!(count = messages.len(), "reclaimed pending messages");
        }

        let mut session = self.pipeline.session();
        for message in &messages {
            let outcome = session.process(&self.ledger, message).await?;
            if outcome.failure.is_some() {
                report.failed += 1;
            }
            if outcome.acked {
                report.acked += 1;
            }
        }

        debug!(
            received = report.received,
            failed = report.failed,
            "worker finished"
        );
        Ok(report)
    }
}

/// Handle on a worker running as a tokio task
///
/// Terminating aborts the task at its next await point.
pub struct TaskHandle {
    consumer: String,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

impl WorkerHandle for TaskHandle {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn terminate(&self) {
        debug!(consumer = %self.consumer, "terminating worker");
        self.handle.abort();
    }
}

/// Spawns [`TaskWorker`]s as tokio tasks over one ledger and pipeline
#[derive(Clone)]
pub struct LedgerWorkerSpawner {
    ledger: Ledger,
    pipeline: Arc<Pipeline>,
}

impl LedgerWorkerSpawner {
    pub fn new(ledger: Ledger, pipeline: Arc<Pipeline>) -> Self {
        Self { ledger, pipeline }
    }
}

impl WorkerSpawner for LedgerWorkerSpawner {
    fn spawn(&self, spec: WorkerSpec) -> Box<dyn WorkerHandle> {
        let worker = TaskWorker::new(&self.ledger, Arc::clone(&self.pipeline), spec);
        let consumer = worker.consumer().to_string();
        let name = consumer.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!(consumer = %name, error = %e, "worker failed");
            }
        });

        Box::new(TaskHandle { consumer, handle })
    }
}
