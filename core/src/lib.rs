//! Core library for fleetsteer
//!
//! This crate holds the orchestration engine: target resolution, run and
//! per-host locking, series/parallel task execution, output aggregation,
//! and level-filtered notification dispatch.

pub mod config;
pub mod error;
pub mod executor;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod output;
pub mod resolver;
pub mod task;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{expand_hosts, parse_config, split_uri, ConfigLoader, FileLoader, LoaderRegistry};
pub use error::{Error, Result};
pub use executor::{TaskExecutor, DEFAULT_MAX_CONCURRENT, DEFAULT_TIMEOUT_SECONDS};
pub use lock::{LockGuard, LockManager, DEFAULT_STALE_AFTER, REMOTE_LOCK_PATH};
pub use notify::{
    Channel, ChannelRegistry, ConsoleChannel, FileChannel, IrcChannel, Level, MailChannel,
    NotificationDispatcher, NotificationEvent, WebhookChannel,
};
pub use orchestrator::Orchestrator;
pub use output::{OutputCollector, TargetOutput};
pub use task::{RestartTask, RunTask, Step, Task, TaskRegistry};
pub use transport::{CommandOutput, SshTransport, Transport};
pub use types::{
    AbortPolicy, Capture, Configuration, ExecutionContext, ExecutionMode, OptionValue, Outcome,
    PerTargetResult, RunResult, Server, TargetCriteria,
};
