//! Service runner
//!
//! Wires one service together: the ledger, the resolved pipeline, the pool
//! controller with its tokio workers and the ingestion loop.

use std::sync::Arc;

use cannon_ledger::{Channel, Ledger, LedgerConfig, LedgerError, StreamStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{PoolConfig, ServiceDefinition};
use crate::controller::{signal_channel, PoolController, PoolStats};
use crate::ingest::{Collector, IngestError, Ingestor};
use crate::pipeline::Pipeline;
use crate::registry::{RegistryError, TaskRegistry};
use crate::worker::LedgerWorkerSpawner;

/// Errors from booting or running a service
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The ledger lacks a channel the pool needs
    #[error("service ledger has no {0} channel")]
    MissingChannel(Channel),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The controller task panicked
    #[error("pool controller task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A bootable bot service
pub struct Service {
    ledger: Ledger,
    pipeline: Arc<Pipeline>,
    collector: Arc<dyn Collector>,
    config: PoolConfig,
}

impl Service {
    /// Assemble a service from parts
    ///
    /// The ledger must carry the `data` and `taskback` channels.
    pub fn new(
        ledger: Ledger,
        pipeline: Pipeline,
        collector: Arc<dyn Collector>,
        config: PoolConfig,
    ) -> Result<Self, ServiceError> {
        for channel in [Channel::Data, Channel::Taskback] {
            if !ledger.has_channel(channel) {
                return Err(ServiceError::MissingChannel(channel));
            }
        }

        Ok(Self {
            ledger,
            pipeline: Arc::new(pipeline),
            collector,
            config,
        })
    }

    /// Open the ledger and resolve the definition's pipeline
    ///
    /// Any configuration problem (bad names, unknown entry points, missing
    /// params, a shell task without a shell) fails here.
    pub async fn boot(
        store: Arc<dyn StreamStore>,
        ledger_config: LedgerConfig,
        definition: &ServiceDefinition,
        registry: &TaskRegistry,
        collector: Arc<dyn Collector>,
        config: PoolConfig,
    ) -> Result<Self, ServiceError> {
        if ledger_config.service_name != definition.name {
            warn!(
                ledger = %ledger_config.service_name,
                definition = %definition.name,
                "service definition name differs from ledger service name"
            );
        }

        let pipeline =
            Pipeline::from_definition(definition, registry)?.with_recall_shell(config.recall_shell);
        let ledger = Ledger::open(store, ledger_config).await?;

        info!(
            service = %ledger.service_name(),
            tasks = ?pipeline.task_names().collect::<Vec<_>>(),
            "Service booted"
        );
        Self::new(ledger, pipeline, collector, config)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run the controller and the ingestion loop until `shutdown`
    ///
    /// Returns the controller's last period counters.
    pub async fn up(self, shutdown: CancellationToken) -> Result<PoolStats, ServiceError> {
        info!(service = %self.ledger.service_name(), "Service starting");

        let (signals, receiver) = signal_channel(self.config.signal_capacity);
        let spawner = LedgerWorkerSpawner::new(self.ledger.clone(), Arc::clone(&self.pipeline));
        let controller = PoolController::new(Arc::new(spawner), self.config.clone());
        let controller = tokio::spawn(controller.run(receiver));

        let ingestor = Ingestor::new(self.ledger, self.collector, signals, self.config);
        let ingested = ingestor.run(shutdown).await;

        let stats = controller.await?;
        ingested?;

        info!("Service stopped");
        Ok(stats)
    }
}

/// Token cancelled on the first ctrl-c
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    token
}
