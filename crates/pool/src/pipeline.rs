//! Task pipeline executor
//!
//! Runs a service's ordered task list over one message, republishes the
//! merged result to `taskback` and acknowledges the message.

use std::fmt;
use std::sync::Arc;

use cannon_ledger::{
    Channel, Fields, Ledger, LedgerError, Message, MessageId, WriteOptions, STATUS_ERROR,
};
use tracing::{debug, instrument, warn};

use crate::config::{EntrySpec, ServiceDefinition};
use crate::registry::{RegistryError, ShellFactory, TaskRegistry};
use crate::task::{Shell, Task, TaskContext, TaskError};

/// Errors from processing a message
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Ledger error while publishing results or acknowledging
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// A task that failed while processing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
}

/// Result of processing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub message_id: MessageId,
    /// Accumulated task results
    pub results: Fields,
    /// Id of the `taskback` entry, when results were published
    pub taskback_id: Option<MessageId>,
    /// First failing task, which stopped the pipeline
    pub failure: Option<TaskFailure>,
    /// Whether the ack removed a pending entry
    pub acked: bool,
}

struct Step {
    name: String,
    task: Arc<dyn Task>,
    uses_shell: bool,
}

struct ShellSource {
    entry_point: String,
    params: Fields,
    factory: ShellFactory,
}

impl ShellSource {
    fn build(&self) -> Result<Arc<dyn Shell>, TaskError> {
        (self.factory)(&self.params).map_err(|e| {
            TaskError::ShellUnavailable(format!("{} failed to start: {e}", self.entry_point))
        })
    }
}

/// Resolved, immutable task pipeline of one service
///
/// Built once at boot and shared by every worker. Each worker processes
/// messages through its own [`PipelineSession`], which owns the shell.
pub struct Pipeline {
    steps: Vec<Step>,
    shell: Option<ShellSource>,
    recall_shell: bool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("tasks", &self.task_names().collect::<Vec<_>>())
            .field("shell", &self.shell.as_ref().map(|s| &s.entry_point))
            .field("recall_shell", &self.recall_shell)
            .finish()
    }
}

impl Pipeline {
    /// Start an empty pipeline
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Resolve every task and the shell of `definition` against `registry`
    pub fn from_definition(
        definition: &ServiceDefinition,
        registry: &TaskRegistry,
    ) -> Result<Self, RegistryError> {
        let params_for = |entry_point: &str, config_key: &Option<String>| match config_key {
            Some(key) => definition
                .params
                .get(key)
                .cloned()
                .ok_or_else(|| RegistryError::MissingParams {
                    entry_point: entry_point.to_string(),
                    config_key: key.clone(),
                }),
            None => Ok(Fields::new()),
        };

        let mut builder = Pipeline::builder();

        if let Some(EntrySpec {
            entry_point,
            config_key,
        }) = &definition.shell
        {
            let params = params_for(entry_point, config_key)?;
            let (factory, params) = registry.shell_factory(entry_point, &params)?;
            builder.shell = Some(ShellSource {
                entry_point: entry_point.clone(),
                params,
                factory,
            });
        }

        for spec in &definition.tasks {
            if spec.uses_shell && builder.shell.is_none() {
                return Err(RegistryError::ShellRequired {
                    task: spec.name.clone(),
                });
            }
            let params = params_for(&spec.entry_point, &spec.config_key)?;
            let task = registry.resolve_task(&spec.entry_point, &params)?;
            builder.steps.push(Step {
                name: spec.name.clone(),
                task,
                uses_shell: spec.uses_shell,
            });
        }

        Ok(builder.build())
    }

    /// Task names in execution order
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Build a fresh shell for every message
    pub fn with_recall_shell(mut self, recall: bool) -> Self {
        self.recall_shell = recall;
        self
    }

    /// Whether shells are rebuilt for every message
    pub fn recalls_shell(&self) -> bool {
        self.recall_shell
    }

    /// Per-worker processing state
    pub fn session(self: &Arc<Self>) -> PipelineSession {
        PipelineSession {
            pipeline: Arc::clone(self),
            shell: None,
        }
    }
}

/// Builder for pipelines assembled in code
#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
    shell: Option<ShellSource>,
    recall_shell: bool,
}

impl PipelineBuilder {
    /// Append a task that runs without the shell
    pub fn task(mut self, name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        self.steps.push(Step {
            name: name.into(),
            task,
            uses_shell: false,
        });
        self
    }

    /// Append a task that receives the shell
    pub fn shell_task(mut self, name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        self.steps.push(Step {
            name: name.into(),
            task,
            uses_shell: true,
        });
        self
    }

    /// Set the shell factory
    pub fn shell<F>(mut self, entry_point: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Fields) -> anyhow::Result<Arc<dyn Shell>> + Send + Sync + 'static,
    {
        self.shell = Some(ShellSource {
            entry_point: entry_point.into(),
            params: Fields::new(),
            factory: Arc::new(factory),
        });
        self
    }

    /// Build a fresh shell for every message
    pub fn recall_shell(mut self, recall: bool) -> Self {
        self.recall_shell = recall;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            steps: self.steps,
            shell: self.shell,
            recall_shell: self.recall_shell,
        }
    }
}

/// A worker's view of a pipeline
///
/// Holds the lazily built shell so it survives across messages unless the
/// pipeline recalls shells.
pub struct PipelineSession {
    pipeline: Arc<Pipeline>,
    shell: Option<Arc<dyn Shell>>,
}

impl PipelineSession {
    /// Run every task over `message`, publish results and acknowledge
    ///
    /// The message is acknowledged exactly once whatever the tasks did. A
    /// failing task stops the remaining ones.
    #[instrument(skip(self, ledger, message), fields(message_id = %message.id))]
    pub async fn process(
        &mut self,
        ledger: &Ledger,
        message: &Message,
    ) -> Result<PipelineOutcome, PipelineError> {
        if self.pipeline.recall_shell {
            self.shell = None;
        }

        let (results, failure) = self.run_tasks(message).await;

        if let Some(failure) = &failure {
            warn!(task = %failure.task, error = %failure.error, "task failed, skipping remaining tasks");
            if ledger.has_channel(Channel::Log) {
                let mut record = Fields::new();
                record.insert("message_id".to_string(), message.id.to_string());
                record.insert("task".to_string(), failure.task.clone());
                record.insert("error".to_string(), failure.error.clone());
                if let Err(e) = ledger
                    .write_with(Channel::Log, record, WriteOptions::status(STATUS_ERROR))
                    .await
                {
                    warn!(error = %e, "failed to record task failure");
                }
            }
        }

        let published = if results.is_empty() {
            Ok(None)
        } else {
            let mut merged = message.payload.clone();
            merged.extend(results.iter().map(|(k, v)| (k.clone(), v.clone())));
            ledger.write(Channel::Taskback, merged).await.map(Some)
        };

        let acked = ledger.ack_stream(&message.stream, &[message.id]).await;

        let taskback_id = published?;
        let acked = acked?.unwrap_or(0) > 0;
        debug!(results = results.len(), acked, "processed message");

        Ok(PipelineOutcome {
            message_id: message.id,
            results,
            taskback_id,
            failure,
            acked,
        })
    }

    async fn run_tasks(&mut self, message: &Message) -> (Fields, Option<TaskFailure>) {
        let pipeline = Arc::clone(&self.pipeline);
        let mut results = Fields::new();

        for step in &pipeline.steps {
            let shell = if step.uses_shell {
                match self.shell() {
                    Ok(shell) => Some(shell),
                    Err(e) => {
                        return (
                            results,
                            Some(TaskFailure {
                                task: step.name.clone(),
                                error: e.to_string(),
                            }),
                        )
                    }
                }
            } else {
                None
            };

            let ctx = TaskContext {
                message,
                results: &results,
                shell: shell.as_deref(),
            };

            match step.task.run(ctx).await {
                Ok(output) => {
                    for (key, value) in output {
                        results.entry(key).or_insert(value);
                    }
                }
                Err(e) => {
                    return (
                        results,
                        Some(TaskFailure {
                            task: step.name.clone(),
                            error: e.to_string(),
                        }),
                    )
                }
            }
        }

        (results, None)
    }

    fn shell(&mut self) -> Result<Arc<dyn Shell>, TaskError> {
        if let Some(shell) = &self.shell {
            return Ok(Arc::clone(shell));
        }
        let source = self
            .pipeline
            .shell
            .as_ref()
            .ok_or_else(|| TaskError::ShellUnavailable("service defines no shell".into()))?;
        let shell = source.build()?;
        debug!(shell = %source.entry_point, "started shell");
        self.shell = Some(Arc::clone(&shell));
        Ok(shell)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use async_trait::async_trait;
    use cannon_ledger::{Block, InMemoryStreamStore, LedgerConfig};

    use crate::config::TaskSpec;
    use crate::registry::ConfigSchema;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Emit(Fields);

    #[async_trait]
    impl Task for Emit {
        async fn run(&self, _ctx: TaskContext<'_>) -> Result<Fields, TaskError> {
            Ok(self.0.clone())
        }
    }

    struct Fail;

    #[async_trait]
    impl Task for Fail {
        async fn run(&self, _ctx: TaskContext<'_>) -> Result<Fields, TaskError> {
            Err(TaskError::failed("boom"))
        }
    }

    struct Echo;

    #[async_trait]
    impl Task for Echo {
        async fn run(&self, ctx: TaskContext<'_>) -> Result<Fields, TaskError> {
            let text = ctx.get("text").unwrap_or_default();
            let output = ctx.shell()?.invoke(text).await?;
            Ok(fields(&[("echo", output.as_str())]))
        }
    }

    struct CountingShell;

    #[async_trait]
    impl Shell for CountingShell {
        async fn invoke(&self, command: &str) -> Result<String, TaskError> {
            Ok(command.to_uppercase())
        }
    }

    fn counting_factory(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(&Fields) -> anyhow::Result<Arc<dyn Shell>> + Send + Sync + 'static {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingShell) as Arc<dyn Shell>)
        }
    }

    async fn ledger_with(data: &[Fields]) -> (Ledger, Vec<Message>) {
        let ledger = Ledger::open(
            Arc::new(InMemoryStreamStore::new()),
            LedgerConfig::new("bot"),
        )
        .await
        .unwrap();
        for item in data {
            ledger.write(Channel::Data, item.clone()).await.unwrap();
        }
        let messages = ledger.read(Channel::Data, None, Block::Never).await.unwrap();
        (ledger, messages)
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let pipeline = Arc::new(
            Pipeline::builder()
                .task("first", Arc::new(Emit(fields(&[("x", "1")]))))
                .task("second", Arc::new(Emit(fields(&[("x", "2"), ("y", "3")]))))
                .build(),
        );
        let (ledger, messages) = ledger_with(&[fields(&[("x", "payload")])]).await;

        let outcome = pipeline
            .session()
            .process(&ledger, &messages[0])
            .await
            .unwrap();
        assert_eq!(outcome.results, fields(&[("x", "1"), ("y", "3")]));
        assert!(outcome.acked);

        // Results win over payload in the taskback entry
        let taskback = ledger
            .read(Channel::Taskback, None, Block::Never)
            .await
            .unwrap();
        assert_eq!(taskback[0].get("x"), Some("1"));
        assert_eq!(taskback[0].get("y"), Some("3"));
    }

    #[tokio::test]
    async fn test_status_result_reaches_taskback() {
        let pipeline = Arc::new(
            Pipeline::builder()
                .task("deliver", Arc::new(Emit(fields(&[("status", "delivered")]))))
                .build(),
        );
        let (ledger, messages) = ledger_with(&[fields(&[("status", "queued")])]).await;

        pipeline
            .session()
            .process(&ledger, &messages[0])
            .await
            .unwrap();

        let taskback = ledger
            .read(Channel::Taskback, None, Block::Never)
            .await
            .unwrap();
        assert_eq!(taskback[0].get("status"), Some("delivered"));
        assert!(taskback[0].is_ok());
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline_and_still_acks() {
        let pipeline = Arc::new(
            Pipeline::builder()
                .task("first", Arc::new(Emit(fields(&[("a", "1")]))))
                .task("broken", Arc::new(Fail))
                .task("never", Arc::new(Emit(fields(&[("b", "2")]))))
                .build(),
        );
        let (ledger, messages) = ledger_with(&[fields(&[("text", "hi")])]).await;

        let outcome = pipeline
            .session()
            .process(&ledger, &messages[0])
            .await
            .unwrap();

        assert_eq!(
            outcome.failure,
            Some(TaskFailure {
                task: "broken".into(),
                error: "boom".into()
            })
        );
        assert_eq!(outcome.results, fields(&[("a", "1")]));
        assert!(outcome.acked);
        assert!(ledger.list_pending().await.unwrap()[&Channel::Data].is_empty());

        let log = ledger.read(Channel::Log, None, Block::Never).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "ERROR");
        assert_eq!(log[0].get("task"), Some("broken"));
        assert_eq!(log[0].get("message_id"), Some(messages[0].id.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_empty_results_are_not_published() {
        let pipeline = Arc::new(
            Pipeline::builder()
                .task("nothing", Arc::new(Emit(Fields::new())))
                .build(),
        );
        let (ledger, messages) = ledger_with(&[fields(&[("text", "hi")])]).await;

        let outcome = pipeline
            .session()
            .process(&ledger, &messages[0])
            .await
            .unwrap();
        assert_eq!(outcome.taskback_id, None);
        assert!(outcome.acked);
        assert!(ledger
            .read(Channel::Taskback, None, Block::Never)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_shell_is_reused_per_session() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(
            Pipeline::builder()
                .shell("upper", counting_factory(starts.clone()))
                .shell_task("echo", Arc::new(Echo))
                .build(),
        );
        let (ledger, messages) =
            ledger_with(&[fields(&[("text", "a")]), fields(&[("text", "b")])]).await;

        let mut session = pipeline.session();
        for message in &messages {
            let outcome = session.process(&ledger, message).await.unwrap();
            assert!(outcome.failure.is_none());
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recall_builds_shell_per_message() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(
            Pipeline::builder()
                .shell("upper", counting_factory(starts.clone()))
                .shell_task("echo", Arc::new(Echo))
                .recall_shell(true)
                .build(),
        );
        let (ledger, messages) =
            ledger_with(&[fields(&[("text", "a")]), fields(&[("text", "b")])]).await;

        let mut session = pipeline.session();
        for message in &messages {
            let outcome = session.process(&ledger, message).await.unwrap();
            assert_eq!(outcome.results["echo"], message.get("text").unwrap().to_uppercase());
        }
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shell_not_built_without_shell_tasks() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(
            Pipeline::builder()
                .shell("upper", counting_factory(starts.clone()))
                .task("plain", Arc::new(Emit(fields(&[("a", "1")]))))
                .build(),
        );
        let (ledger, messages) = ledger_with(&[fields(&[("text", "a")])]).await;

        pipeline
            .session()
            .process(&ledger, &messages[0])
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_definition_requires_shell() {
        let mut registry = TaskRegistry::new();
        registry.register_task("echo", ConfigSchema::new(), |_| {
            Ok(Arc::new(Echo) as Arc<dyn Task>)
        });

        let definition =
            ServiceDefinition::new("bot").with_task(TaskSpec::new("echo", "echo").with_shell());
        let err = Pipeline::from_definition(&definition, &registry).unwrap_err();
        assert!(matches!(err, RegistryError::ShellRequired { .. }));
    }

    #[test]
    fn test_definition_missing_params_block() {
        let mut registry = TaskRegistry::new();
        registry.register_task("emit", ConfigSchema::new(), |_| {
            Ok(Arc::new(Emit(Fields::new())) as Arc<dyn Task>)
        });

        let definition = ServiceDefinition::new("bot")
            .with_task(TaskSpec::new("emit", "emit").with_config_key("absent"));
        let err = Pipeline::from_definition(&definition, &registry).unwrap_err();
        assert!(matches!(err, RegistryError::MissingParams { .. }));
    }

    #[test]
    fn test_definition_resolves_in_order() {
        let mut registry = TaskRegistry::new();
        registry.register_task("emit", ConfigSchema::new().required("key"), |params| {
            Ok(Arc::new(Emit(fields(&[(params["key"].as_str(), "v")]))) as Arc<dyn Task>)
        });
        registry.register_shell("upper", ConfigSchema::new(), |_| {
            Ok(Arc::new(CountingShell) as Arc<dyn Shell>)
        });

        let definition = ServiceDefinition::new("bot")
            .with_shell("upper", None)
            .with_task(TaskSpec::new("one", "emit").with_config_key("one"))
            .with_task(TaskSpec::new("two", "emit").with_config_key("two"))
            .with_params("one", fields(&[("key", "a")]))
            .with_params("two", fields(&[("key", "b")]));

        let pipeline = Pipeline::from_definition(&definition, &registry).unwrap();
        assert_eq!(pipeline.task_names().collect::<Vec<_>>(), vec!["one", "two"]);
        assert!(!pipeline.recalls_shell());
    }
}
