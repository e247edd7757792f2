//! Task execution engine
//!
//! Runs a task's ordered step sequence against every resolved target, in
//! series or bounded-parallel, applying the abort policy. The emitted result
//! list always matches the resolved target list in length and order; targets
//! the abort policy kept from starting are recorded as skipped, never
//! dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::{
    AbortPolicy, CommandOutput, Error, ExecutionContext, ExecutionMode, LockManager, Outcome,
    OutputCollector, PerTargetResult, Result, Server, Step, Transport,
};

/// Default bound on in-flight targets in parallel mode
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default per-step timeout in seconds
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Executes one run's steps across its targets
#[derive(Clone)]
pub struct TaskExecutor {
    transport: Arc<dyn Transport>,
    locks: Arc<LockManager>,
    collector: Arc<OutputCollector>,
}

impl TaskExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        locks: Arc<LockManager>,
        collector: Arc<OutputCollector>,
    ) -> Self {
        Self {
            transport,
            locks,
            collector,
        }
    }

    /// Run the steps against every target in the context.
    ///
    /// Per-target failures land in the result list; this call itself does
    /// not fail.
    #[instrument(skip_all, fields(task = %ctx.task, targets = ctx.targets.len()))]
    pub async fn execute(&self, ctx: &ExecutionContext, steps: &[Step]) -> Vec<PerTargetResult> {
        match ctx.mode {
            ExecutionMode::Series => self.execute_series(ctx, steps).await,
            ExecutionMode::Parallel(max) => self.execute_parallel(ctx, steps, max.max(1)).await,
        }
    }

    /// Strictly ordered, one target at a time
    async fn execute_series(&self, ctx: &ExecutionContext, steps: &[Step]) -> Vec<PerTargetResult> {
        let mut results = Vec::with_capacity(ctx.targets.len());
        let mut aborted = false;

        for server in &ctx.targets {
            if aborted {
                debug!(server = %server, "Skipping target after earlier failure");
                results.push(PerTargetResult::skipped(server.clone()));
                continue;
            }

            let result = self.run_target(ctx, steps, server).await;
            if result.outcome == Outcome::Failure && ctx.abort_policy == AbortPolicy::StopOnFailure
            {
                aborted = true;
            }
            results.push(result);
        }

        results
    }

    /// Concurrent targets, bounded by `max`.
    ///
    /// Abort is cooperative: a failure stops new targets from starting, but
    /// targets already in flight run to completion — commands already issued
    /// cannot be recalled.
    async fn execute_parallel(
        &self,
        ctx: &ExecutionContext,
        steps: &[Step],
        max: usize,
    ) -> Vec<PerTargetResult> {
        let ctx = Arc::new(ctx.clone());
        let steps: Arc<[Step]> = steps.to_vec().into();
        let semaphore = Arc::new(Semaphore::new(max));
        let abort = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(ctx.targets.len());
        for server in ctx.targets.iter().cloned() {
            let executor = self.clone();
            let ctx = ctx.clone();
            let steps = steps.clone();
            let semaphore = semaphore.clone();
            let abort = abort.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    // Semaphore only closes when the run is torn down
                    Err(_) => return PerTargetResult::skipped(server),
                };
                if abort.load(Ordering::SeqCst) {
                    debug!(server = %server, "Skipping target after earlier failure");
                    return PerTargetResult::skipped(server);
                }

                let result = executor.run_target(&ctx, &steps, &server).await;
                if result.outcome == Outcome::Failure
                    && ctx.abort_policy == AbortPolicy::StopOnFailure
                {
                    abort.store(true, Ordering::SeqCst);
                }
                result
            });
            handles.push(handle);
        }

        // Joining in spawn order keeps results in resolved-target order no
        // matter which targets finish first.
        let mut results = Vec::with_capacity(handles.len());
        for (handle, server) in handles.into_iter().zip(ctx.targets.iter()) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(server = %server, error = %e, "Target worker failed");
                    failure(server.clone(), format!("worker failed: {}", e), Duration::ZERO)
                }
            };
            results.push(result);
        }
        results
    }

    /// Run every step against one target: host lock, steps in order, first
    /// failure stops this target's remaining steps, lock released on every
    /// path, captured output recorded once.
    async fn run_target(
        &self,
        ctx: &ExecutionContext,
        steps: &[Step],
        server: &Server,
    ) -> PerTargetResult {
        let started = Instant::now();
        info!(server = %server, task = %ctx.task, "Running task on target");

        if ctx.host_locks {
            if let Err(e) = self.locks.acquire_host(self.transport.as_ref(), server).await {
                warn!(server = %server, error = %e, "Host lock not acquired");
                return failure(server.clone(), e.to_string(), started.elapsed());
            }
        }

        let mut stdout_buf = ctx.capture.stdout.then(String::new);
        let mut stderr_buf = ctx.capture.stderr.then(String::new);
        let mut error = None;

        for step in steps {
            match self.run_step(ctx, server, step).await {
                Ok(output) => {
                    if let Some(buf) = stdout_buf.as_mut() {
                        buf.push_str(&output.stdout);
                    }
                    if let Some(buf) = stderr_buf.as_mut() {
                        buf.push_str(&output.stderr);
                    }
                    if !output.success() {
                        let detail = output.stderr.trim();
                        error = Some(if detail.is_empty() {
                            format!("step '{}' exited with code {}", step.name, output.exit_code)
                        } else {
                            format!(
                                "step '{}' exited with code {}: {}",
                                step.name, output.exit_code, detail
                            )
                        });
                        break;
                    }
                }
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        if ctx.host_locks {
            // Unconditional; a failed release must not turn a good run bad.
            if let Err(e) = self.locks.release_host(self.transport.as_ref(), server).await {
                warn!(server = %server, error = %e, "Host lock release failed");
            }
        }

        self.collector
            .record(server.name(), stdout_buf.clone(), stderr_buf.clone())
            .await;

        let duration = started.elapsed();
        match error {
            None => {
                info!(server = %server, elapsed_ms = duration.as_millis() as u64, "Target succeeded");
                PerTargetResult {
                    server: server.clone(),
                    outcome: Outcome::Success,
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                    error: None,
                    duration,
                }
            }
            Some(detail) => {
                warn!(server = %server, error = %detail, "Target failed");
                PerTargetResult {
                    server: server.clone(),
                    outcome: Outcome::Failure,
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                    error: Some(detail),
                    duration,
                }
            }
        }
    }

    async fn run_step(
        &self,
        ctx: &ExecutionContext,
        server: &Server,
        step: &Step,
    ) -> Result<CommandOutput> {
        let command = if ctx.sudo {
            format!("sudo -n {}", step.command)
        } else {
            step.command.clone()
        };

        debug!(server = %server, step = %step.name, "Running step");
        match timeout(ctx.step_timeout, self.transport.run(server, &command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteExecutionError(format!(
                "step '{}' timed out after {}s",
                step.name,
                ctx.step_timeout.as_secs()
            ))),
        }
    }
}

fn failure(server: Server, error: String, duration: Duration) -> PerTargetResult {
    PerTargetResult {
        server,
        outcome: Outcome::Failure,
        stdout: None,
        stderr: None,
        error: Some(error),
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, Scripted};
    use crate::Capture;
    use std::collections::BTreeMap;

    struct Fixture {
        transport: Arc<MockTransport>,
        executor: TaskExecutor,
    }

    fn fixture(test: &str) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let lock_dir =
            std::env::temp_dir().join(format!("fleetsteer-exec-{}-{}", test, std::process::id()));
        let executor = TaskExecutor::new(
            transport.clone(),
            Arc::new(LockManager::new(lock_dir)),
            Arc::new(OutputCollector::new()),
        );
        Fixture {
            transport,
            executor,
        }
    }

    fn ctx(targets: &[&str], mode: ExecutionMode, abort_policy: AbortPolicy) -> ExecutionContext {
        ExecutionContext {
            task: "run".to_string(),
            targets: targets.iter().map(|n| Server::bare(*n)).collect(),
            mode,
            abort_policy,
            sudo: false,
            host_locks: false,
            capture: Capture::default(),
            step_timeout: Duration::from_secs(300),
            options: BTreeMap::new(),
        }
    }

    fn steps(commands: &[&str]) -> Vec<Step> {
        commands
            .iter()
            .enumerate()
            .map(|(i, c)| Step::new(format!("step{}", i + 1), *c))
            .collect()
    }

    fn outcomes(results: &[PerTargetResult]) -> Vec<Outcome> {
        results.iter().map(|r| r.outcome).collect()
    }

    #[tokio::test]
    async fn test_series_stop_on_failure_records_skipped() {
        let f = fixture("series-stop");
        f.transport.script("web2", vec![Scripted::Output(1, "", "boom\n")]);

        let ctx = ctx(&["web1", "web2", "web3"], ExecutionMode::Series, AbortPolicy::StopOnFailure);
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(
            outcomes(&results),
            vec![Outcome::Success, Outcome::Failure, Outcome::Skipped]
        );
        assert!(results[1].error.as_deref().unwrap().contains("boom"));
        assert!(results[2].error.is_none());
        // The skipped target was never contacted
        assert!(f.transport.commands_for("web3").is_empty());
    }

    #[tokio::test]
    async fn test_series_continue_attempts_everything() {
        let f = fixture("series-continue");
        f.transport.script("web2", vec![Scripted::Output(1, "", "")]);

        let ctx = ctx(&["web1", "web2", "web3"], ExecutionMode::Series, AbortPolicy::Continue);
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(
            outcomes(&results),
            vec![Outcome::Success, Outcome::Failure, Outcome::Success]
        );
        assert_eq!(f.transport.commands_for("web3").len(), 1);
    }

    #[tokio::test]
    async fn test_step_failure_stops_that_target_only() {
        let f = fixture("step-abort");
        f.transport.script("web1", vec![Scripted::Output(1, "", "")]);

        let ctx = ctx(&["web1", "web2"], ExecutionMode::Series, AbortPolicy::Continue);
        let results = f.executor.execute(&ctx, &steps(&["first", "second"])).await;

        assert_eq!(outcomes(&results), vec![Outcome::Failure, Outcome::Success]);
        // web1 stopped after its failed first step; web2 ran both
        assert_eq!(f.transport.commands_for("web1").len(), 1);
        assert_eq!(f.transport.commands_for("web2").len(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_a_target_failure() {
        let f = fixture("transport-error");
        f.transport
            .script("web1", vec![Scripted::TransportError("connection refused")]);

        let ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(outcomes(&results), vec![Outcome::Failure]);
        assert!(results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_parallel_preserves_resolved_order() {
        let f = fixture("parallel-order");
        f.transport.script("web2", vec![Scripted::Output(1, "", "")]);

        let ctx = ctx(
            &["web1", "web2", "web3"],
            ExecutionMode::Parallel(3),
            AbortPolicy::Continue,
        );
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        let names: Vec<&str> = results.iter().map(|r| r.server.name()).collect();
        assert_eq!(names, vec!["web1", "web2", "web3"]);
        assert_eq!(
            outcomes(&results),
            vec![Outcome::Success, Outcome::Failure, Outcome::Success]
        );
    }

    #[tokio::test]
    async fn test_parallel_abort_skips_unstarted_targets() {
        let f = fixture("parallel-abort");
        f.transport.script("web1", vec![Scripted::Output(1, "", "")]);

        // Concurrency 1 makes the dispatch order deterministic
        let ctx = ctx(
            &["web1", "web2", "web3"],
            ExecutionMode::Parallel(1),
            AbortPolicy::StopOnFailure,
        );
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(
            outcomes(&results),
            vec![Outcome::Failure, Outcome::Skipped, Outcome::Skipped]
        );
        assert!(f.transport.commands_for("web2").is_empty());
        assert!(f.transport.commands_for("web3").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_a_failure() {
        let f = fixture("timeout");
        f.transport.script("web1", vec![Scripted::Hang]);

        let mut ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        ctx.step_timeout = Duration::from_secs(5);
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(outcomes(&results), vec![Outcome::Failure]);
        assert!(results[0].error.as_deref().unwrap().contains("timed out after 5s"));
    }

    #[tokio::test]
    async fn test_sudo_prefixes_each_step() {
        let f = fixture("sudo");
        let mut ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        ctx.sudo = true;

        f.executor.execute(&ctx, &steps(&["systemctl restart nginx"])).await;
        assert_eq!(
            f.transport.commands_for("web1"),
            vec!["sudo -n systemctl restart nginx"]
        );
    }

    #[tokio::test]
    async fn test_capture_lands_in_result_and_collector() {
        let f = fixture("capture");
        f.transport
            .script("web1", vec![Scripted::Output(0, "out\n", "err\n")]);

        let mut ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        ctx.capture = Capture {
            stdout: true,
            stderr: true,
        };
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(results[0].stdout.as_deref(), Some("out\n"));
        assert_eq!(results[0].stderr.as_deref(), Some("err\n"));

        let collected = f.executor.collector.get("web1").await.unwrap();
        assert_eq!(collected.stdout.as_deref(), Some("out\n"));
        assert_eq!(collected.stderr.as_deref(), Some("err\n"));
    }

    #[tokio::test]
    async fn test_no_capture_means_no_buffers() {
        let f = fixture("no-capture");
        let ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert!(results[0].stdout.is_none());
        assert!(results[0].stderr.is_none());
        assert!(f.executor.collector.get("web1").await.is_none());
    }

    #[tokio::test]
    async fn test_host_locks_wrap_the_steps() {
        let f = fixture("host-locks");
        let mut ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        ctx.host_locks = true;

        f.executor.execute(&ctx, &steps(&["uptime"])).await;

        let commands = f.transport.commands_for("web1");
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("set -C"));
        assert_eq!(commands[1], "uptime");
        assert!(commands[2].starts_with("rm -f"));
    }

    #[tokio::test]
    async fn test_host_lock_released_even_when_steps_fail() {
        let f = fixture("host-locks-failure");
        f.transport.script("web1", vec![Scripted::Output(1, "", "")]);
        let mut ctx = ctx(&["web1"], ExecutionMode::Series, AbortPolicy::Continue);
        ctx.host_locks = true;

        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(outcomes(&results), vec![Outcome::Failure]);
        let commands = f.transport.commands_for("web1");
        assert!(commands.last().unwrap().starts_with("rm -f"));
    }

    #[tokio::test]
    async fn test_held_host_lock_fails_target_without_running_steps() {
        let f = fixture("host-lock-held");
        f.transport.deny_lock("web1");
        let mut ctx = ctx(&["web1", "web2"], ExecutionMode::Series, AbortPolicy::Continue);
        ctx.host_locks = true;

        let results = f.executor.execute(&ctx, &steps(&["uptime"])).await;

        assert_eq!(outcomes(&results), vec![Outcome::Failure, Outcome::Success]);
        assert!(results[0].error.as_deref().unwrap().contains("already held"));
        // Acquire attempt only: no steps, and nothing to release
        assert_eq!(f.transport.commands_for("web1").len(), 1);
    }
}
