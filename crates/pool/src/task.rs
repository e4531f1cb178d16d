//! Task and shell traits
//!
//! A task turns one message plus the results of earlier tasks into new
//! result fields. Tasks that need a long-lived external session (a browser,
//! a REPL, a remote console) get it through the [`Shell`] trait.

use async_trait::async_trait;
use cannon_ledger::{Fields, Message};

/// Error returned by a task or shell
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task ran and reported a failure
    #[error("{0}")]
    Failed(String),

    /// The task needs a shell and none could be provided
    #[error("shell unavailable: {0}")]
    ShellUnavailable(String),

    /// Any other error raised by task code
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// External session shared by shell-using tasks
#[async_trait]
pub trait Shell: Send + Sync {
    /// Run one command and return its output
    async fn invoke(&self, command: &str) -> Result<String, TaskError>;
}

/// Inputs handed to a task
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    /// Message being processed
    pub message: &'a Message,

    /// Results accumulated by earlier tasks
    pub results: &'a Fields,

    /// Service shell, present only for tasks declared with `uses_shell`
    pub shell: Option<&'a dyn Shell>,
}

impl<'a> TaskContext<'a> {
    /// Look a key up in earlier results, then in the message payload
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.results
            .get(key)
            .map(String::as_str)
            .or_else(|| self.message.get(key))
    }

    /// The shell, or an error for tasks that were not given one
    pub fn shell(&self) -> Result<&'a dyn Shell, TaskError> {
        self.shell
            .ok_or_else(|| TaskError::ShellUnavailable("task was not declared with a shell".into()))
    }
}

/// One unit of work in a pipeline
///
/// Returned fields are merged into the accumulated results; keys already set
/// by an earlier task are kept.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, ctx: TaskContext<'_>) -> Result<Fields, TaskError>;
}
