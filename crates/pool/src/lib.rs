//! # Cannon Pool
//!
//! Adaptive worker pool that processes a service ledger with disposable,
//! single-batch workers.
//!
//! ## Features
//!
//! - **Task registry**: named task and shell factories with declared config schemas
//! - **Task pipeline**: ordered tasks, first-writer-wins results, unconditional ack
//! - **Adaptive controller**: spawns short-lived workers on load, keeps one parked when idle
//! - **Ingestion loop**: collector items to `data`, `taskback` results back to the collector
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  items   ┌──────────┐  Hot / LoopDone  ┌────────────────┐
//! │ Collector │ ───────> │ Ingestor │ ───────────────> │ PoolController │
//! └───────────┘ <─────── └──────────┘                  └────────────────┘
//!                taskback     │ write data                     │ spawn
//!                             ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               Ledger                                │
//! └─────────────────────────────────────────────────────────────────────┘
//!                             ▲ read data, write taskback, ack
//!                             │
//!                      ┌────────────┐
//!                      │ TaskWorker │ ── PipelineSession ── Task / Shell
//!                      └────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use cannon_pool::prelude::*;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register_task("reply", ConfigSchema::new().required("token"), |params| {
//!     Ok(Arc::new(Reply::new(&params["token"])))
//! });
//!
//! let service = Service::boot(
//!     store,
//!     LedgerConfig::from_env("echo-bot"),
//!     &definition,
//!     &registry,
//!     Arc::new(SlackCollector::new()),
//!     PoolConfig::from_env(),
//! )
//! .await?;
//!
//! service.up(shutdown_on_ctrl_c()).await?;
//! ```

pub mod config;
pub mod controller;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{PoolConfig, ServiceDefinition, TaskSpec};
    pub use crate::ingest::Collector;
    pub use crate::registry::{ConfigSchema, TaskRegistry};
    pub use crate::service::{shutdown_on_ctrl_c, Service, ServiceError};
    pub use crate::task::{Shell, Task, TaskContext, TaskError};
    pub use cannon_ledger::prelude::*;
}

// Re-export key types at crate root
pub use config::{EntrySpec, PoolConfig, ServiceDefinition, TaskSpec};
pub use controller::{
    signal_channel, PoolController, PoolStats, Signal, WorkerHandle, WorkerKind, WorkerSpawner,
    WorkerSpec,
};
pub use ingest::{Collector, IngestError, Ingestor, IterationReport};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineError, PipelineOutcome, PipelineSession, TaskFailure,
};
pub use registry::{ConfigSchema, RegistryError, ShellFactory, TaskFactory, TaskRegistry};
pub use service::{shutdown_on_ctrl_c, Service, ServiceError};
pub use task::{Shell, Task, TaskContext, TaskError};
pub use worker::{LedgerWorkerSpawner, TaskHandle, TaskWorker, WorkerError, WorkerReport};
