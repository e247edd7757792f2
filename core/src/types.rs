//! Shared types
//!
//! Value types for servers, target criteria, execution context, and run
//! results. `Server` and `Configuration` are immutable after construction;
//! everything downstream of target resolution holds them read-only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::{Error, Result};

/// A single managed server.
///
/// Identity is the hostname, unique within a [`Configuration`]. The rendered
/// display width is computed once at construction and used by reporting code
/// to align per-target columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    name: String,
    roles: Vec<String>,
    port: Option<u16>,
    display_width: usize,
}

impl Server {
    /// Create a server with role tags and an optional SSH port
    pub fn new(name: impl Into<String>, roles: Vec<String>, port: Option<u16>) -> Self {
        let name = name.into();
        let display_width = match port {
            // "name:port"
            Some(p) => name.chars().count() + 1 + p.to_string().len(),
            None => name.chars().count(),
        };
        Self {
            name,
            roles,
            port,
            display_width,
        }
    }

    /// Create a bare server with no roles and the default port
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), None)
    }

    /// Hostname (unique identity)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role tags attached to this server
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Does this server carry the given role?
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// SSH port, if not the default
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Width of the display form, computed at construction
    pub fn display_width(&self) -> usize {
        self.display_width
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}:{}", self.name, p),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Immutable registry of servers, indexed by name and role.
///
/// Built once per run by a configuration loader, read-only afterwards.
/// Declared order is preserved and drives target ordering everywhere.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    servers: Vec<Server>,
    by_name: HashMap<String, usize>,
    by_role: HashMap<String, Vec<usize>>,
}

impl Configuration {
    /// Build a configuration from servers in declared order.
    ///
    /// Fails if two servers share a hostname.
    pub fn from_servers(servers: Vec<Server>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_role: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, server) in servers.iter().enumerate() {
            if by_name.insert(server.name().to_string(), idx).is_some() {
                return Err(Error::ConfigError(format!(
                    "duplicate server '{}'",
                    server.name()
                )));
            }
            for role in server.roles() {
                by_role.entry(role.clone()).or_default().push(idx);
            }
        }

        Ok(Self {
            servers,
            by_name,
            by_role,
        })
    }

    /// Servers in declared order
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Number of servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Is the configuration empty?
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Look up a server by exact name
    pub fn get(&self, name: &str) -> Option<&Server> {
        self.by_name.get(name).map(|&idx| &self.servers[idx])
    }

    /// Declared-order position of a server, by exact name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Declared-order positions of every server carrying the role
    pub fn role_positions(&self, role: &str) -> &[usize] {
        self.by_role.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All role names present in the configuration, sorted
    pub fn role_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_role.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// What the operator asked to target: explicit server tokens and/or roles.
/// Both empty means "all servers in the configuration".
#[derive(Debug, Clone, Default)]
pub struct TargetCriteria {
    pub servers: Vec<String>,
    pub roles: Vec<String>,
}

impl TargetCriteria {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.roles.is_empty()
    }
}

/// Execution strategy across targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Strictly one target at a time, in resolved order
    Series,
    /// Concurrent targets, bounded by the given maximum
    Parallel(usize),
}

/// What a per-target failure does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPolicy {
    /// No new targets start after the first failure
    StopOnFailure,
    /// Every target is attempted regardless of failures
    Continue,
}

/// Which output streams to capture per target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capture {
    pub stdout: bool,
    pub stderr: bool,
}

impl Capture {
    pub fn any(&self) -> bool {
        self.stdout || self.stderr
    }
}

/// A task-specific option value: a bare flag or a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Text(String),
}

impl OptionValue {
    /// String form, if this is a text option
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            OptionValue::Flag(_) => None,
        }
    }

    /// Truthiness: flags carry their value, text is truthy when non-empty
    pub fn is_set(&self) -> bool {
        match self {
            OptionValue::Flag(v) => *v,
            OptionValue::Text(s) => !s.is_empty(),
        }
    }
}

/// Everything the executor needs for one run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Task identifier
    pub task: String,
    /// Resolved, ordered, deduplicated targets
    pub targets: Vec<Server>,
    /// Series or bounded-parallel
    pub mode: ExecutionMode,
    /// Stop-on-first-failure or continue
    pub abort_policy: AbortPolicy,
    /// Run remote steps under sudo
    pub sudo: bool,
    /// Take a per-host lock around each target's steps
    pub host_locks: bool,
    /// Which streams to capture
    pub capture: Capture,
    /// Per-step timeout
    pub step_timeout: Duration,
    /// Task-specific options passed through from the CLI
    pub options: BTreeMap<String, OptionValue>,
}

impl ExecutionContext {
    /// Fetch a required text option
    pub fn require_text(&self, name: &str) -> Result<&str> {
        self.options
            .get(name)
            .and_then(OptionValue::as_text)
            .ok_or_else(|| {
                Error::OptionError(format!("task '{}' requires --{} <value>", self.task, name))
            })
    }
}

/// Per-target outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    /// Never attempted because the run aborted first
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of running the task against one target
#[derive(Debug, Clone)]
pub struct PerTargetResult {
    pub server: Server,
    pub outcome: Outcome,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Present iff outcome is Failure
    pub error: Option<String>,
    pub duration: Duration,
}

impl PerTargetResult {
    /// Record a target that was never attempted
    pub fn skipped(server: Server) -> Self {
        Self {
            server,
            outcome: Outcome::Skipped,
            stdout: None,
            stderr: None,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Aggregated result of a whole run.
///
/// The result list always has one entry per resolved target, in resolved
/// order, regardless of failures or aborts.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub task: String,
    pub results: Vec<PerTargetResult>,
}

impl RunResult {
    /// Overall success: every target succeeded
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.outcome == Outcome::Success)
    }

    /// (success, failure, skipped) counts
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for r in &self.results {
            match r.outcome {
                Outcome::Success => counts.0 += 1,
                Outcome::Failure => counts.1 += 1,
                Outcome::Skipped => counts.2 += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web(n: u32) -> Server {
        Server::new(format!("web{}.example.com", n), vec!["web".into()], None)
    }

    #[test]
    fn test_display_width_computed_once() {
        let plain = Server::bare("db1.example.com");
        assert_eq!(plain.display_width(), "db1.example.com".len());
        assert_eq!(plain.to_string(), "db1.example.com");

        let with_port = Server::new("db1.example.com", vec![], Some(2222));
        assert_eq!(with_port.to_string(), "db1.example.com:2222");
        assert_eq!(with_port.display_width(), "db1.example.com:2222".len());
    }

    #[test]
    fn test_configuration_indexes() {
        let config =
            Configuration::from_servers(vec![web(1), web(2), Server::new("db1", vec!["db".into()], None)])
                .unwrap();

        assert_eq!(config.len(), 3);
        assert_eq!(config.position("web2.example.com"), Some(1));
        assert_eq!(config.role_positions("web"), &[0, 1]);
        assert_eq!(config.role_positions("db"), &[2]);
        assert!(config.role_positions("missing").is_empty());
        assert!(config.get("db1").unwrap().has_role("db"));
    }

    #[test]
    fn test_configuration_rejects_duplicates() {
        let err = Configuration::from_servers(vec![web(1), web(1)]).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_run_result_counts_and_verdict() {
        let run = RunResult {
            task: "restart".into(),
            results: vec![
                PerTargetResult {
                    server: web(1),
                    outcome: Outcome::Success,
                    stdout: None,
                    stderr: None,
                    error: None,
                    duration: Duration::from_secs(1),
                },
                PerTargetResult {
                    server: web(2),
                    outcome: Outcome::Failure,
                    stdout: None,
                    stderr: None,
                    error: Some("exit 1".into()),
                    duration: Duration::from_secs(1),
                },
                PerTargetResult::skipped(Server::bare("db1")),
            ],
        };

        assert!(!run.succeeded());
        assert_eq!(run.counts(), (1, 1, 1));
    }
}
