//! Ingestion loop
//!
//! Bridges a [`Collector`] and the ledger: collected items go to `data` and
//! produce load signals, `taskback` results go back to the collector.

use std::sync::Arc;

use async_trait::async_trait;
use cannon_ledger::{Block, Channel, Fields, Ledger, LedgerError, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::controller::Signal;

/// Source of work and sink of results for a service
///
/// Implemented by chat adapters, pollers and the like.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Next batch of items; may be empty
    async fn read(&self) -> anyhow::Result<Vec<Fields>>;

    /// Receive one processed result
    async fn taskback(&self, message: &Message) -> anyhow::Result<()>;
}

/// Errors that stop the ingestion loop
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The controller's receiver was dropped
    #[error("pool controller is gone")]
    ControllerGone,
}

/// What one iteration did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Items written to `data`
    pub written: usize,
    /// `taskback` messages handed to the collector
    pub fed_back: usize,
    /// Whether the iteration counted as idle
    pub idle: bool,
}

/// Producer side of the pool
pub struct Ingestor {
    ledger: Ledger,
    collector: Arc<dyn Collector>,
    signals: mpsc::Sender<Signal>,
    config: PoolConfig,
}

impl Ingestor {
    pub fn new(
        ledger: Ledger,
        collector: Arc<dyn Collector>,
        signals: mpsc::Sender<Signal>,
        config: PoolConfig,
    ) -> Self {
        Self {
            ledger,
            collector,
            signals,
            config,
        }
    }

    /// Run one read, write and feedback pass
    ///
    /// An idle pass sends `LoopDone` but does not sleep.
    pub async fn iterate(&self) -> Result<IterationReport, IngestError> {
        let batch = self.collect().await;
        self.publish(batch).await
    }

    /// Hand `taskback` messages left pending by an earlier run to the collector
    ///
    /// Returns how many were delivered.
    pub async fn redeliver_pending(&self) -> Result<usize, IngestError> {
        let pending = self.ledger.read_backlog(Channel::Taskback, None).await?;
        self.feed_back(&pending).await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "redelivered pending taskback");
        }
        Ok(pending.len())
    }

    async fn collect(&self) -> Vec<Fields> {
        match self.collector.read().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "collector read failed");
                Vec::new()
            }
        }
    }

    async fn publish(&self, batch: Vec<Fields>) -> Result<IterationReport, IngestError> {
        let mut report = IterationReport::default();
        for item in batch {
            if item.is_empty() {
                continue;
            }
            self.ledger.write(Channel::Data, item).await?;
            report.written += 1;
            if !self.config.lazy {
                self.signal(Signal::Hot).await?;
            }
        }

        let feedback = self
            .ledger
            .read(Channel::Taskback, None, Block::Never)
            .await?;
        self.feed_back(&feedback).await?;
        report.fed_back = feedback.len();

        let hot = report.written > 0 && !self.config.lazy;
        report.idle = !hot && report.fed_back == 0;
        if report.idle {
            self.signal(Signal::LoopDone).await?;
        }

        Ok(report)
    }

    async fn feed_back(&self, messages: &[Message]) -> Result<(), IngestError> {
        for message in messages {
            if let Err(e) = self.collector.taskback(message).await {
                warn!(message_id = %message.id, error = %e, "collector rejected taskback");
            }
            self.ledger
                .ack_stream(&message.stream, &[message.id])
                .await?;
        }
        Ok(())
    }

    /// Loop until `shutdown` is cancelled or an iteration fails
    ///
    /// Pending `taskback` from an earlier run is redelivered first.
    /// Cancellation interrupts a pass only while the collector is reading.
    ///
    /// Always sends `Shutdown` to the controller on the way out, preceded by
    /// `KillJobs` on cancellation or error.
    #[instrument(skip_all, fields(service = %self.ledger.service_name()))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), IngestError> {
        info!(lazy = self.config.lazy, "Starting ingestion loop");

        let result = self.ingest(&shutdown).await;
        match &result {
            Ok(()) => info!("shutdown requested, terminating workers"),
            Err(e) => warn!(error = %e, "ingestion failed, terminating workers"),
        }

        // The controller may already be gone; nothing left to stop then
        let _ = self.signals.send(Signal::KillJobs).await;
        let _ = self.signals.send(Signal::Shutdown).await;
        result
    }

    async fn ingest(&self, shutdown: &CancellationToken) -> Result<(), IngestError> {
        self.redeliver_pending().await?;

        loop {
            // Only the collector read is abandoned on cancel; once items are
            // in hand they are written and feedback is acked.
            let batch = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                batch = self.collect() => batch,
            };
            let report = self.publish(batch).await?;

            if report.idle {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.idle_sleep) => {}
                }
            } else {
                debug!(
                    written = report.written,
                    fed_back = report.fed_back,
                    "ingested"
                );
            }
        }
    }

    async fn signal(&self, signal: Signal) -> Result<(), IngestError> {
        self.signals
            .send(signal)
            .await
            .map_err(|_| IngestError::ControllerGone)
    }
}
