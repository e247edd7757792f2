//! Run orchestration
//!
//! One `steer` call is one run: resolve targets, look up the task, take the
//! run-scope lock, emit the start notification, execute, release, emit the
//! summary, flush channels, return the aggregated result. Setup failures
//! (config, resolution, task lookup, locking) abort before any remote host
//! is contacted; the run lock is released on every exit path.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::{
    resolver, Configuration, ExecutionContext, Level, LockManager, NotificationDispatcher,
    OutputCollector, Result, RunResult, TargetCriteria, TaskExecutor, TaskRegistry, Transport,
};

/// Composes the engine components into runs
pub struct Orchestrator {
    config: Option<Configuration>,
    tasks: TaskRegistry,
    transport: Arc<dyn Transport>,
    locks: Arc<LockManager>,
    dispatcher: NotificationDispatcher,
    collector: Arc<OutputCollector>,
}

impl Orchestrator {
    pub fn new(
        config: Option<Configuration>,
        tasks: TaskRegistry,
        transport: Arc<dyn Transport>,
        locks: Arc<LockManager>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            config,
            tasks,
            transport,
            locks,
            dispatcher,
            collector: Arc::new(OutputCollector::new()),
        }
    }

    /// The loaded configuration, if any
    pub fn config(&self) -> Option<&Configuration> {
        self.config.as_ref()
    }

    /// Captured output from the last run
    pub fn collector(&self) -> &OutputCollector {
        &self.collector
    }

    /// Run a task once against the targets the criteria resolve to.
    ///
    /// `ctx.targets` is filled in from the resolution; callers pass it empty.
    #[instrument(skip_all, fields(task = %ctx.task))]
    pub async fn steer(
        &self,
        criteria: &TargetCriteria,
        ctx: ExecutionContext,
    ) -> Result<RunResult> {
        let result = self.steer_inner(criteria, ctx).await;
        if let Err(e) = &result {
            self.dispatcher
                .emit(Level::Fatal, "steer", e.to_string())
                .await;
        }
        // Deferred channels flush exactly once, before final status is
        // reported to the caller.
        self.dispatcher.close().await;
        result
    }

    async fn steer_inner(
        &self,
        criteria: &TargetCriteria,
        mut ctx: ExecutionContext,
    ) -> Result<RunResult> {
        // Pre-lock phase: resolution and task lookup. Failures here are
        // fatal and touch neither locks nor remote hosts.
        ctx.targets = resolver::resolve(criteria, self.config.as_ref())?;
        let task = self.tasks.get(&ctx.task)?;
        let steps = task.steps(&ctx)?;

        info!(
            task = %ctx.task,
            targets = ctx.targets.len(),
            steps = steps.len(),
            "Run starting"
        );

        // The guard releases on drop, so even an unexpected unwind below
        // cannot leave the marker behind.
        let guard = self.locks.acquire_local()?;

        self.dispatcher
            .emit(
                Level::Info,
                "steer",
                format!(
                    "task '{}' starting on {} target(s)",
                    ctx.task,
                    ctx.targets.len()
                ),
            )
            .await;

        let executor = TaskExecutor::new(
            self.transport.clone(),
            self.locks.clone(),
            self.collector.clone(),
        );
        let results = executor.execute(&ctx, &steps).await;

        guard.release();

        let run = RunResult {
            task: ctx.task.clone(),
            results,
        };
        let (ok, failed, skipped) = run.counts();
        let level = if run.succeeded() {
            Level::Info
        } else {
            Level::Warn
        };
        self.dispatcher
            .emit(
                level,
                "steer",
                format!(
                    "task '{}' complete: {} succeeded, {} failed, {} skipped",
                    run.task, ok, failed, skipped
                ),
            )
            .await;

        Ok(run)
    }
}
