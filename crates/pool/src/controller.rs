//! Adaptive pool controller
//!
//! A single control loop that turns load signals into worker spawns:
//!
//! | Signal     | Effect                                                   |
//! |------------|----------------------------------------------------------|
//! | `Hot`      | spawn a short-timeout worker                             |
//! | `Idle`     | spawn a long-timeout worker                              |
//! | `LoopDone` | reap finished workers, spawn an idle one if none is left |
//! | `KillJobs` | terminate every tracked worker                           |
//! | `Shutdown` | exit the loop                                            |

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use cannon_ledger::Block;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

/// Load signal sent to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// New data was written
    Hot,
    /// Capacity should be kept warm
    Idle,
    /// An ingestion iteration finished without work
    LoopDone,
    /// Terminate all workers
    KillJobs,
    /// Stop the controller
    Shutdown,
}

/// Bounded signal channel; senders wait while it is full
pub fn signal_channel(capacity: usize) -> (mpsc::Sender<Signal>, mpsc::Receiver<Signal>) {
    mpsc::channel(capacity.max(1))
}

/// What a spawned worker does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Short read timeout, spawned per unit of load
    Hot,
    /// Long read timeout, keeps one reader parked while idle
    Idle,
    /// Claims stale pending entries instead of reading new ones
    Backlog,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Hot => f.write_str("hot"),
            WorkerKind::Idle => f.write_str("idle"),
            WorkerKind::Backlog => f.write_str("backlog"),
        }
    }
}

/// Parameters of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    pub kind: WorkerKind,
    /// How long the worker's read may wait
    pub block: Block,
    /// Messages to read (or claim) before exiting
    pub count: usize,
    /// Minimum idle time of claimed entries (backlog workers only)
    pub min_idle: Duration,
}

impl WorkerSpec {
    pub fn hot(config: &PoolConfig) -> Self {
        Self {
            kind: WorkerKind::Hot,
            block: config.hot_read(),
            count: config.batch_count.max(1),
            min_idle: Duration::ZERO,
        }
    }

    pub fn idle(config: &PoolConfig) -> Self {
        Self {
            kind: WorkerKind::Idle,
            block: config.idle_read(),
            count: config.batch_count.max(1),
            min_idle: Duration::ZERO,
        }
    }

    pub fn backlog(config: &PoolConfig) -> Self {
        Self {
            kind: WorkerKind::Backlog,
            block: Block::Never,
            count: config.backlog_count.max(1),
            min_idle: config.backlog_min_idle,
        }
    }
}

/// Handle on a running worker
pub trait WorkerHandle: Send {
    /// Whether the worker is still running
    fn is_alive(&self) -> bool;

    /// Stop the worker; it must not process further messages
    fn terminate(&self);
}

/// Starts workers for the controller
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: WorkerSpec) -> Box<dyn WorkerHandle>;
}

/// Counters for one cooldown period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers alive at report time
    pub alive: usize,
    /// Workers spawned during the period
    pub spawned: usize,
    /// `Hot` signals received during the period
    pub hot: usize,
}

/// Control loop scaling workers from load signals
///
/// The controller never sends to its own channel; an `Idle` reaction to
/// `LoopDone` is handled inline.
///
/// # Example
///
/// ```ignore
/// let (signals, receiver) = signal_channel(config.signal_capacity);
/// let controller = PoolController::new(Arc::new(spawner), config);
/// let handle = tokio::spawn(controller.run(receiver));
///
/// signals.send(Signal::Hot).await?;
/// signals.send(Signal::Shutdown).await?;
/// handle.await?;
/// ```
pub struct PoolController {
    spawner: Arc<dyn WorkerSpawner>,
    config: PoolConfig,
    workers: Vec<Box<dyn WorkerHandle>>,
    period: PoolStats,
    total_spawned: usize,
}

impl PoolController {
    /// Create a new controller
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: PoolConfig) -> Self {
        Self {
            spawner,
            config,
            workers: Vec::new(),
            period: PoolStats::default(),
            total_spawned: 0,
        }
    }

    /// Apply one signal
    ///
    /// Returns `Break` when the controller should stop.
    pub fn handle(&mut self, signal: Signal) -> ControlFlow<()> {
        match signal {
            Signal::Hot => {
                self.period.hot += 1;
                self.spawn(WorkerSpec::hot(&self.config));
            }
            Signal::Idle => {
                self.spawn(WorkerSpec::idle(&self.config));
            }
            Signal::LoopDone => {
                self.reap();
                if self.workers.is_empty() {
                    debug!("no live workers, parking an idle worker");
                    return self.handle(Signal::Idle);
                }
            }
            Signal::KillJobs => {
                self.terminate_all();
            }
            Signal::Shutdown => {
                debug!("shutdown signal received");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Run until `Shutdown` arrives or every sender is gone
    ///
    /// Remaining workers are terminated on exit. Returns the counters of the
    /// last, unreported period.
    pub async fn run(mut self, mut signals: mpsc::Receiver<Signal>) -> PoolStats {
        info!(
            cooldown_secs = self.config.cooldown.as_secs(),
            hot_block_ms = self.config.hot_block.as_millis() as u64,
            idle_block_ms = self.config.idle_block.as_millis() as u64,
            "Starting pool controller"
        );

        if self.config.reclaim_backlog {
            self.spawn(WorkerSpec::backlog(&self.config));
        }

        let period = self.config.cooldown.max(Duration::from_millis(1));
        let mut cooldown = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        warn!("signal channel closed, stopping controller");
                        break;
                    };
                    if self.handle(signal).is_break() {
                        break;
                    }
                }
                _ = cooldown.tick() => {
                    self.report();
                }
            }
        }

        self.terminate_all();
        let stats = self.stats();
        info!(spawned = self.total_spawned, "Pool controller stopped");
        stats
    }

    /// Log and reset the period counters, dropping dead handles
    pub fn report(&mut self) -> PoolStats {
        self.reap();
        let stats = self.stats();
        info!(
            alive = stats.alive,
            spawned = stats.spawned,
            hot = stats.hot,
            "pool cooldown"
        );
        self.period = PoolStats::default();
        stats
    }

    /// Counters of the current period
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            alive: self.alive(),
            ..self.period
        }
    }

    /// Workers currently alive
    pub fn alive(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Handles tracked, alive or not yet reaped
    pub fn tracked(&self) -> usize {
        self.workers.len()
    }

    /// Workers spawned since start
    pub fn total_spawned(&self) -> usize {
        self.total_spawned
    }

    fn spawn(&mut self, spec: WorkerSpec) {
        debug!(kind = %spec.kind, "spawning worker");
        self.workers.push(self.spawner.spawn(spec));
        self.period.spawned += 1;
        self.total_spawned += 1;
    }

    fn reap(&mut self) {
        let before = self.workers.len();
        self.workers.retain(|w| w.is_alive());
        let reaped = before - self.workers.len();
        if reaped > 0 {
            debug!(reaped, remaining = self.workers.len(), "reaped workers");
        }
    }

    fn terminate_all(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!(count = self.workers.len(), "terminating workers");
        for worker in self.workers.drain(..) {
            worker.terminate();
        }
    }
}

impl fmt::Debug for PoolController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolController")
            .field("tracked", &self.workers.len())
            .field("period", &self.period)
            .field("total_spawned", &self.total_spawned)
            .finish()
    }
}
