//! Task definitions and registry
//!
//! A task turns the run's options into an ordered step list. Tasks are
//! registered by name at process start; the engine only does a registry
//! lookup, never any dynamic loading.

use std::collections::HashMap;
use tracing::debug;

use crate::{Error, ExecutionContext, Result};

/// One unit of work within a task, executed in order against a target
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub command: String,
}

impl Step {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// A named task: produces the step sequence for a run
pub trait Task: Send + Sync {
    /// Task name, the registry key
    fn name(&self) -> &str;

    /// One-line description for listings
    fn description(&self) -> &str;

    /// Build the ordered step list from the run's options
    fn steps(&self, ctx: &ExecutionContext) -> Result<Vec<Step>>;
}

/// Registry of tasks, keyed by name
pub struct TaskRegistry {
    tasks: HashMap<String, Box<dyn Task>>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Registry with the built-in tasks registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RunTask));
        registry.register(Box::new(RestartTask));
        registry
    }

    /// Register a task, replacing any existing one with the same name
    pub fn register(&mut self, task: Box<dyn Task>) {
        debug!(task = %task.name(), "Registering task");
        self.tasks.insert(task.name().to_string(), task);
    }

    /// Look up a task by name
    pub fn get(&self, name: &str) -> Result<&dyn Task> {
        self.tasks
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// Registered task names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Built-in task: run one shell command, given by `--command`
pub struct RunTask;

impl Task for RunTask {
    fn name(&self) -> &str {
        "run"
    }

    fn description(&self) -> &str {
        "Run a shell command on every target"
    }

    fn steps(&self, ctx: &ExecutionContext) -> Result<Vec<Step>> {
        let command = ctx.require_text("command")?;
        Ok(vec![Step::new("run", command)])
    }
}

/// Built-in task: restart a systemd service, given by `--service`, and
/// verify it came back up
pub struct RestartTask;

impl Task for RestartTask {
    fn name(&self) -> &str {
        "restart"
    }

    fn description(&self) -> &str {
        "Restart a systemd service and verify it is active"
    }

    fn steps(&self, ctx: &ExecutionContext) -> Result<Vec<Step>> {
        let service = ctx.require_text("service")?;
        if service.contains(|c: char| c.is_whitespace() || c == ';' || c == '&' || c == '|') {
            return Err(Error::OptionError(format!(
                "invalid service name '{}'",
                service
            )));
        }
        Ok(vec![
            Step::new("restart", format!("systemctl restart {}", service)),
            Step::new("verify", format!("systemctl is-active {}", service)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AbortPolicy, Capture, ExecutionMode, OptionValue};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ctx(task: &str, options: BTreeMap<String, OptionValue>) -> ExecutionContext {
        ExecutionContext {
            task: task.to_string(),
            targets: Vec::new(),
            mode: ExecutionMode::Series,
            abort_policy: AbortPolicy::StopOnFailure,
            sudo: false,
            host_locks: false,
            capture: Capture::default(),
            step_timeout: Duration::from_secs(300),
            options,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TaskRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["restart", "run"]);
        assert!(registry.get("run").is_ok());
        assert!(matches!(
            registry.get("patch"),
            Err(Error::UnknownTask(t)) if t == "patch"
        ));
    }

    #[test]
    fn test_run_task_requires_command() {
        let registry = TaskRegistry::with_builtins();
        let task = registry.get("run").unwrap();

        assert!(matches!(
            task.steps(&ctx("run", BTreeMap::new())),
            Err(Error::OptionError(_))
        ));

        let mut options = BTreeMap::new();
        options.insert(
            "command".to_string(),
            OptionValue::Text("uptime".to_string()),
        );
        let steps = task.steps(&ctx("run", options)).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].command, "uptime");
    }

    #[test]
    fn test_restart_task_builds_two_steps() {
        let registry = TaskRegistry::with_builtins();
        let task = registry.get("restart").unwrap();

        let mut options = BTreeMap::new();
        options.insert(
            "service".to_string(),
            OptionValue::Text("nginx".to_string()),
        );
        let steps = task.steps(&ctx("restart", options)).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].command, "systemctl restart nginx");
        assert_eq!(steps[1].command, "systemctl is-active nginx");
    }

    #[test]
    fn test_restart_task_rejects_shell_metacharacters() {
        let registry = TaskRegistry::with_builtins();
        let task = registry.get("restart").unwrap();

        let mut options = BTreeMap::new();
        options.insert(
            "service".to_string(),
            OptionValue::Text("nginx; rm -rf /".to_string()),
        );
        assert!(matches!(
            task.steps(&ctx("restart", options)),
            Err(Error::OptionError(_))
        ));
    }
}
