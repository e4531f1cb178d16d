//! Task registry for named task and shell factories
//!
//! Services refer to tasks by entry-point name. The registry maps each name
//! to a factory plus a declared config schema, so a bad definition is
//! rejected at boot instead of inside a worker.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use cannon_ledger::Fields;

use crate::task::{Shell, Task};

/// Factory function type for building a task from resolved params
pub type TaskFactory = Arc<dyn Fn(&Fields) -> anyhow::Result<Arc<dyn Task>> + Send + Sync>;

/// Factory function type for building a shell from resolved params
pub type ShellFactory = Arc<dyn Fn(&Fields) -> anyhow::Result<Arc<dyn Shell>> + Send + Sync>;

/// Params a factory accepts
///
/// # Example
///
/// ```
/// use cannon_pool::ConfigSchema;
///
/// let schema = ConfigSchema::new()
///     .required("token")
///     .optional("greeting", "hello");
/// assert!(schema.is_required("token"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSchema {
    required: Vec<String>,
    optional: BTreeMap<String, String>,
}

impl ConfigSchema {
    /// Schema accepting no params
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key that must be present
    pub fn required(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    /// Declare a key with a default value
    pub fn optional(mut self, key: impl Into<String>, default: impl Into<String>) -> Self {
        self.optional.insert(key.into(), default.into());
        self
    }

    pub fn is_required(&self, key: &str) -> bool {
        self.required.iter().any(|k| k == key)
    }

    /// Validate `params` and keep only declared keys, filling defaults
    pub fn resolve(&self, entry_point: &str, params: &Fields) -> Result<Fields, RegistryError> {
        let mut resolved = Fields::new();

        for key in &self.required {
            let value = params
                .get(key)
                .ok_or_else(|| RegistryError::MissingKey {
                    entry_point: entry_point.to_string(),
                    key: key.clone(),
                })?;
            resolved.insert(key.clone(), value.clone());
        }

        for (key, default) in &self.optional {
            let value = params.get(key).unwrap_or(default);
            resolved.insert(key.clone(), value.clone());
        }

        Ok(resolved)
    }
}

struct Entry<F> {
    schema: ConfigSchema,
    factory: F,
}

/// Registry of task and shell factories
pub struct TaskRegistry {
    tasks: HashMap<String, Entry<TaskFactory>>,
    shells: HashMap<String, Entry<ShellFactory>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            shells: HashMap::new(),
        }
    }

    /// Register a task factory under `name`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = TaskRegistry::new();
    /// registry.register_task("greeter", ConfigSchema::new().optional("greeting", "hi"), |params| {
    ///     Ok(Arc::new(Greeter::new(&params["greeting"])))
    /// });
    /// ```
    pub fn register_task<F>(&mut self, name: impl Into<String>, schema: ConfigSchema, factory: F)
    where
        F: Fn(&Fields) -> anyhow::Result<Arc<dyn Task>> + Send + Sync + 'static,
    {
        self.tasks.insert(
            name.into(),
            Entry {
                schema,
                factory: Arc::new(factory),
            },
        );
    }

    /// Register a shell factory under `name`
    pub fn register_shell<F>(&mut self, name: impl Into<String>, schema: ConfigSchema, factory: F)
    where
        F: Fn(&Fields) -> anyhow::Result<Arc<dyn Shell>> + Send + Sync + 'static,
    {
        self.shells.insert(
            name.into(),
            Entry {
                schema,
                factory: Arc::new(factory),
            },
        );
    }

    /// Build the task registered as `name`
    pub fn resolve_task(&self, name: &str, params: &Fields) -> Result<Arc<dyn Task>, RegistryError> {
        let (factory, resolved) = self.task_factory(name, params)?;
        factory(&resolved).map_err(|source| RegistryError::Factory {
            entry_point: name.to_string(),
            source,
        })
    }

    /// Build the shell registered as `name`
    pub fn resolve_shell(
        &self,
        name: &str,
        params: &Fields,
    ) -> Result<Arc<dyn Shell>, RegistryError> {
        let (factory, resolved) = self.shell_factory(name, params)?;
        factory(&resolved).map_err(|source| RegistryError::Factory {
            entry_point: name.to_string(),
            source,
        })
    }

    /// Validated shell factory and params, for building shells later
    pub(crate) fn shell_factory(
        &self,
        name: &str,
        params: &Fields,
    ) -> Result<(ShellFactory, Fields), RegistryError> {
        let entry = self
            .shells
            .get(name)
            .ok_or_else(|| RegistryError::UnknownEntryPoint(name.to_string()))?;
        Ok((entry.factory.clone(), entry.schema.resolve(name, params)?))
    }

    fn task_factory(
        &self,
        name: &str,
        params: &Fields,
    ) -> Result<(TaskFactory, Fields), RegistryError> {
        let entry = self
            .tasks
            .get(name)
            .ok_or_else(|| RegistryError::UnknownEntryPoint(name.to_string()))?;
        Ok((entry.factory.clone(), entry.schema.resolve(name, params)?))
    }

    /// Check if a task entry point is registered
    pub fn contains_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Check if a shell entry point is registered
    pub fn contains_shell(&self, name: &str) -> bool {
        self.shells.contains_key(name)
    }

    /// Get the number of registered tasks and shells
    pub fn len(&self) -> usize {
        self.tasks.len() + self.shells.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.shells.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("shells", &self.shells.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Entry point not registered
    #[error("unknown entry point: {0}")]
    UnknownEntryPoint(String),

    /// A `config_key` names a params block the definition does not have
    #[error("no params block {config_key:?} for {entry_point}")]
    MissingParams {
        entry_point: String,
        config_key: String,
    },

    /// A required key is absent from the params block
    #[error("{entry_point} requires param {key:?}")]
    MissingKey { entry_point: String, key: String },

    /// A task uses the shell but the service defines none
    #[error("task {task:?} uses a shell but the service defines none")]
    ShellRequired { task: String },

    /// The factory itself failed
    #[error("failed to build {entry_point}: {source}")]
    Factory {
        entry_point: String,
        #[source]
        source: anyhow::Error,
    },
}
