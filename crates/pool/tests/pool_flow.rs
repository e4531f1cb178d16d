//! End-to-end service tests over the in-memory store
//!
//! Collector items flow through `data`, the workers' pipeline and `taskback`
//! back into the collector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cannon_ledger::{
    Block, Channel, Fields, InMemoryStreamStore, Ledger, LedgerConfig, Message, StreamStore,
    STATUS_ERROR,
};
use cannon_pool::{
    Collector, ConfigSchema, PoolConfig, PoolStats, Service, ServiceDefinition, ServiceError, Task,
    TaskContext, TaskError, TaskRegistry, TaskSpec,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct Feed {
    items: Mutex<Vec<Fields>>,
    results: Mutex<Vec<Message>>,
}

impl Feed {
    fn with_items(texts: &[&str]) -> Arc<Self> {
        let feed = Feed::default();
        *feed.items.lock() = texts.iter().map(|t| text(t)).collect();
        Arc::new(feed)
    }

    fn result_count(&self) -> usize {
        self.results.lock().len()
    }

    fn result_texts(&self, key: &str) -> Vec<String> {
        let mut texts: Vec<String> = self
            .results
            .lock()
            .iter()
            .filter_map(|m| m.get(key).map(str::to_string))
            .collect();
        texts.sort();
        texts
    }
}

#[async_trait]
impl Collector for Feed {
    async fn read(&self) -> anyhow::Result<Vec<Fields>> {
        Ok(std::mem::take(&mut *self.items.lock()))
    }

    async fn taskback(&self, message: &Message) -> anyhow::Result<()> {
        self.results.lock().push(message.clone());
        Ok(())
    }
}

struct Shout {
    suffix: String,
}

#[async_trait]
impl Task for Shout {
    async fn run(&self, ctx: TaskContext<'_>) -> Result<Fields, TaskError> {
        let text = ctx
            .get("text")
            .ok_or_else(|| TaskError::failed("missing text"))?;
        if text == "poison" {
            return Err(TaskError::failed("refusing poison"));
        }
        Ok(Fields::from([(
            "shout".to_string(),
            format!("{}{}", text.to_uppercase(), self.suffix),
        )]))
    }
}

fn text(value: &str) -> Fields {
    Fields::from([("text".to_string(), value.to_string())])
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_task(
        "shout",
        ConfigSchema::new().optional("suffix", "!"),
        |params| {
            Ok(Arc::new(Shout {
                suffix: params["suffix"].clone(),
            }) as Arc<dyn Task>)
        },
    );
    registry
}

fn definition() -> ServiceDefinition {
    ServiceDefinition::new("echo-bot")
        .with_task(TaskSpec::new("shout", "shout").with_config_key("shout"))
        .with_params("shout", Fields::from([("suffix".to_string(), "!!".to_string())]))
}

fn pool_config() -> PoolConfig {
    PoolConfig::default()
        .with_blocks(Duration::from_millis(200), Duration::from_millis(500))
        .with_cooldown(Duration::from_secs(1))
}

async fn boot(store: Arc<dyn StreamStore>, feed: Arc<Feed>, config: PoolConfig) -> Service {
    Service::boot(
        store,
        LedgerConfig::new("echo-bot"),
        &definition(),
        &registry(),
        feed,
        config,
    )
    .await
    .expect("service should boot")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn wait_for_acks(ledger: &Ledger) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let pending = ledger.list_pending().await.unwrap();
            if pending.values().all(Vec::is_empty) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pending entries should be acknowledged");
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<Result<PoolStats, ServiceError>>) {
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service should stop")
        .expect("service task panicked")
        .expect("service failed");
}

// ============================================================================
// Tests
// ============================================================================

#[test_log::test(tokio::test)]
async fn test_items_round_trip_through_workers() {
    let store: Arc<dyn StreamStore> = Arc::new(InMemoryStreamStore::new());
    let feed = Feed::with_items(&["hello", "world", "again"]);
    let service = boot(store.clone(), feed.clone(), pool_config()).await;
    let ledger = service.ledger().clone();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(service.up(shutdown.clone()));

    wait_until("three results", || feed.result_count() == 3).await;
    wait_for_acks(&ledger).await;
    stop(shutdown, handle).await;

    assert_eq!(
        feed.result_texts("shout"),
        vec!["AGAIN!!", "HELLO!!", "WORLD!!"]
    );
    // The input payload rides along with the results
    assert_eq!(feed.result_texts("text"), vec!["again", "hello", "world"]);
}

#[tokio::test]
async fn test_lazy_items_are_picked_up_by_idle_workers() {
    let store: Arc<dyn StreamStore> = Arc::new(InMemoryStreamStore::new());
    let feed = Feed::with_items(&["a", "b"]);
    let service = boot(store, feed.clone(), pool_config().with_lazy(true)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(service.up(shutdown.clone()));

    wait_until("two results", || feed.result_count() == 2).await;
    stop(shutdown, handle).await;

    assert_eq!(feed.result_texts("shout"), vec!["A!!", "B!!"]);
}

#[tokio::test]
async fn test_failed_task_is_logged_and_acked() {
    let store: Arc<dyn StreamStore> = Arc::new(InMemoryStreamStore::new());
    let feed = Feed::with_items(&["poison", "fine"]);
    let service = boot(store, feed.clone(), pool_config()).await;
    let ledger = service.ledger().clone();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(service.up(shutdown.clone()));

    wait_until("one result", || feed.result_count() == 1).await;
    // The failing message is acknowledged too
    wait_for_acks(&ledger).await;
    stop(shutdown, handle).await;

    assert_eq!(feed.result_texts("shout"), vec!["FINE!!"]);

    let logs = ledger
        .recent(Channel::Log, Duration::from_secs(60))
        .await
        .unwrap();
    let failure = logs
        .iter()
        .find(|m| m.status == STATUS_ERROR)
        .expect("failure record in log");
    assert_eq!(failure.get("task"), Some("shout"));
    assert_eq!(failure.get("error"), Some("refusing poison"));
}

#[tokio::test]
async fn test_backlog_worker_reclaims_abandoned_message() {
    let store: Arc<dyn StreamStore> = Arc::new(InMemoryStreamStore::new());

    // A previous worker read a message and died before acknowledging it
    let previous = Ledger::open(
        store.clone(),
        LedgerConfig::new("echo-bot").with_consumer("worker-dead"),
    )
    .await
    .unwrap();
    previous.write(Channel::Data, text("orphan")).await.unwrap();
    let taken = previous
        .read(Channel::Data, None, Block::Never)
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);

    let feed = Feed::with_items(&[]);
    let config = pool_config().with_backlog_reclaim(10, Duration::ZERO);
    let service = boot(store, feed.clone(), config).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(service.up(shutdown.clone()));

    wait_until("reclaimed result", || feed.result_count() == 1).await;
    wait_for_acks(&previous).await;
    stop(shutdown, handle).await;

    assert_eq!(feed.result_texts("shout"), vec!["ORPHAN!!"]);
}

#[tokio::test]
async fn test_shutdown_with_no_traffic() {
    let store: Arc<dyn StreamStore> = Arc::new(InMemoryStreamStore::new());
    let feed = Feed::with_items(&[]);
    let service = boot(store, feed.clone(), pool_config()).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(service.up(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop(shutdown, handle).await;

    assert_eq!(feed.result_count(), 0);
}
