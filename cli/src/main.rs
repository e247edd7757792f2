//! steer — run a task across a fleet of servers
//!
//! Resolves the requested servers and roles against the configuration, takes
//! the run lock, executes the task in series or parallel, and reports one
//! line per target plus any captured output.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use fleetsteer_core::{
    AbortPolicy, Capture, ChannelRegistry, Configuration, ConsoleChannel, ExecutionContext,
    ExecutionMode, Level, LoaderRegistry, LockManager, NotificationDispatcher, Orchestrator,
    OptionValue, OutputCollector, RunResult, SshTransport, TargetCriteria, TaskRegistry,
    DEFAULT_TIMEOUT_SECONDS,
};

/// steer — cluster task orchestrator
///
/// Run flags go before the task name; everything after the task name is
/// passed to the task as `--name value` or `--flag` options.
#[derive(Parser, Debug)]
#[command(name = "steer", version, about, long_about = None)]
struct Cli {
    /// Task to run (e.g. `run`, `restart`)
    task: Option<String>,

    /// Server names or unambiguous abbreviations, comma-separated
    #[arg(long, value_delimiter = ',', value_name = "NAME")]
    servers: Vec<String>,

    /// Role tags to target, comma-separated
    #[arg(long, value_delimiter = ',', value_name = "ROLE")]
    roles: Vec<String>,

    /// Configuration URI (`file://PATH` or a bare path)
    #[arg(long, env = "FLEETSTEER_CONFIG", value_name = "URI")]
    config: Option<String>,

    /// Notification channel URI (repeatable)
    #[arg(long, value_name = "URI")]
    notify: Vec<String>,

    /// Minimum level delivered to notification channels
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    notify_level: String,

    /// Capture a stream from every target: stdout or stderr (repeatable)
    #[arg(long, value_name = "STREAM")]
    capture: Vec<String>,

    /// Activate a named extension set (repeatable)
    #[arg(long, value_name = "NAME")]
    load: Vec<String>,

    /// Run every step under sudo
    #[arg(long)]
    sudo: bool,

    /// Skip loading .env
    #[arg(long)]
    noenv: bool,

    /// Suppress the default stderr notification channel
    #[arg(long, short)]
    quiet: bool,

    /// Run targets concurrently, bounded by MAX in-flight targets
    #[arg(long, value_name = "MAX", num_args = 0..=1, default_missing_value = "5")]
    parallel: Option<usize>,

    /// Keep starting new targets after a failure
    #[arg(long = "continue")]
    continue_on_failure: bool,

    /// Skip the per-host lock markers on the targets
    #[arg(long)]
    no_host_locks: bool,

    /// Per-step timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECONDS, value_name = "SECS")]
    timeout: u64,

    /// Directory for the run lock marker
    #[arg(long, value_name = "DIR")]
    lock_dir: Option<PathBuf>,

    /// SSH private key for the remote transport
    #[arg(long, env = "FLEETSTEER_SSH_KEY", value_name = "PATH")]
    ssh_key: Option<String>,

    /// Print the server/role listing from the configuration and exit
    #[arg(long)]
    dump_config: bool,

    /// Show the full manual
    #[arg(long)]
    man: bool,

    /// Task-specific options, after the task name
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    task_options: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if !cli.noenv {
        dotenvy::dotenv().ok();
    }

    // Keep stdout for the report; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    if cli.man {
        print!("{}", MANUAL);
        return Ok(0);
    }

    let config = match &cli.config {
        Some(uri) => Some(LoaderRegistry::new().load(uri).await?),
        None => None,
    };
    if let Some(config) = &config {
        tracing::debug!(servers = config.len(), "Configuration loaded");
    }

    if cli.dump_config {
        let config = config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--dump-config requires --config"))?;
        print_config(config);
        return Ok(0);
    }

    let task = cli
        .task
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no task given (see --help for usage)"))?;

    let notify_level: Level = cli.notify_level.parse()?;
    let dispatcher = build_dispatcher(&cli, notify_level)?;

    let criteria = TargetCriteria {
        servers: cli.servers.clone(),
        roles: cli.roles.clone(),
    };

    let ctx = ExecutionContext {
        task,
        targets: Vec::new(),
        mode: match cli.parallel {
            Some(max) => ExecutionMode::Parallel(max.max(1)),
            None => ExecutionMode::Series,
        },
        abort_policy: if cli.continue_on_failure {
            AbortPolicy::Continue
        } else {
            AbortPolicy::StopOnFailure
        },
        sudo: cli.sudo,
        host_locks: !cli.no_host_locks,
        capture: parse_capture(&cli.capture)?,
        step_timeout: Duration::from_secs(cli.timeout),
        options: parse_task_options(&cli.task_options)?,
    };

    let lock_dir = cli.lock_dir.clone().unwrap_or_else(std::env::temp_dir);
    let orchestrator = Orchestrator::new(
        config,
        TaskRegistry::with_builtins(),
        Arc::new(SshTransport::new(cli.ssh_key.clone())),
        Arc::new(LockManager::new(lock_dir)),
        dispatcher,
    );

    let capture = ctx.capture;
    let run = orchestrator.steer(&criteria, ctx).await?;
    print_report(&run, orchestrator.collector(), capture).await;

    Ok(if run.succeeded() { 0 } else { 1 })
}

/// Assemble the channel set: the stderr echo unless quieted, then each
/// `--notify` URI in order.
fn build_dispatcher(cli: &Cli, notify_level: Level) -> anyhow::Result<NotificationDispatcher> {
    let mut registry = ChannelRegistry::with_builtins();
    for name in &cli.load {
        match name.as_str() {
            "webhook" => registry.register_webhook(),
            other => anyhow::bail!("unknown extension '{}'", other),
        }
    }

    let mut dispatcher = NotificationDispatcher::new();
    if !cli.quiet {
        dispatcher.add_channel(notify_level, Box::new(ConsoleChannel));
    }
    for uri in &cli.notify {
        dispatcher.add_channel(notify_level, registry.create(uri)?);
    }
    Ok(dispatcher)
}

/// Parse `--capture stdout --capture stderr` style flags
fn parse_capture(streams: &[String]) -> anyhow::Result<Capture> {
    let mut capture = Capture::default();
    for stream in streams {
        match stream.as_str() {
            "stdout" => capture.stdout = true,
            "stderr" => capture.stderr = true,
            other => anyhow::bail!("unknown capture stream '{}' (stdout or stderr)", other),
        }
    }
    Ok(capture)
}

/// Collect tokens after the task name into task options: `--name value`
/// pairs, or bare `--flag` booleans.
fn parse_task_options(tokens: &[String]) -> anyhow::Result<BTreeMap<String, OptionValue>> {
    let mut options = BTreeMap::new();
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        let name = token
            .strip_prefix("--")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("unexpected task argument '{}'", token))?;

        let value = match iter.peek() {
            Some(next) if !next.starts_with("--") => {
                OptionValue::Text(iter.next().cloned().unwrap_or_default())
            }
            _ => OptionValue::Flag(true),
        };
        options.insert(name.to_string(), value);
    }

    Ok(options)
}

/// The `--dump-config` listing: servers with their roles, then the role index
fn print_config(config: &Configuration) {
    let width = config
        .servers()
        .iter()
        .map(|s| s.display_width())
        .max()
        .unwrap_or(0);

    println!("servers ({}):", config.len());
    for server in config.servers() {
        if server.roles().is_empty() {
            println!("  {:<width$}", server.to_string(), width = width);
        } else {
            println!(
                "  {:<width$}  roles: {}",
                server.to_string(),
                server.roles().join(", "),
                width = width
            );
        }
    }

    let roles = config.role_names();
    if !roles.is_empty() {
        println!("roles ({}):", roles.len());
        for role in roles {
            let members: Vec<&str> = config
                .role_positions(role)
                .iter()
                .map(|&idx| config.servers()[idx].name())
                .collect();
            println!("  {:<12}  {}", role, members.join(", "));
        }
    }
}

/// One line per target, in run order, then captured output and the summary
async fn print_report(run: &RunResult, collector: &OutputCollector, capture: Capture) {
    let width = run
        .results
        .iter()
        .map(|r| r.server.display_width())
        .max()
        .unwrap_or(0);

    for result in &run.results {
        let detail = result.error.as_deref().unwrap_or("");
        println!(
            "{:<width$}  {:<7}  {:>6.1}s  {}",
            result.server.to_string(),
            result.outcome.to_string(),
            result.duration.as_secs_f64(),
            detail,
            width = width
        );
    }

    if capture.any() {
        for result in &run.results {
            let Some(output) = collector.get(result.server.name()).await else {
                continue;
            };
            if let Some(stdout) = &output.stdout {
                println!("---- {} stdout ----", result.server);
                print!("{}", stdout);
                if !stdout.ends_with('\n') {
                    println!();
                }
            }
            if let Some(stderr) = &output.stderr {
                println!("---- {} stderr ----", result.server);
                print!("{}", stderr);
                if !stderr.ends_with('\n') {
                    println!();
                }
            }
        }
    }

    let (ok, failed, skipped) = run.counts();
    println!(
        "{} target(s): {} succeeded, {} failed, {} skipped",
        run.results.len(),
        ok,
        failed,
        skipped
    );
}

const MANUAL: &str = r#"STEER(1)

NAME
    steer - run a task across a fleet of servers

SYNOPSIS
    steer [run flags] <task> [task options]

DESCRIPTION
    steer resolves the requested servers and roles against a configuration,
    takes a run lock, executes the task's steps against every target, and
    reports one line per target. The process exits 0 only when every target
    succeeded.

    Targets come from --servers (exact names or unambiguous abbreviations),
    --roles, or - with neither - every server in the configuration. Targets
    run in series by default; --parallel [MAX] runs them concurrently with
    at most MAX in flight. A failing target stops new targets from starting
    unless --continue is given; targets that never started are reported as
    skipped.

    Each target is protected by a lock marker on the target host for the
    duration of its steps (disable with --no-host-locks). Stale lock
    markers, local or remote, are reclaimed automatically.

TASKS
    run        Run a shell command on every target.
                   steer --roles web run --command 'uptime'
    restart    Restart a systemd service and verify it is active.
                   steer --roles web --sudo restart --service nginx

CONFIGURATION
    A TOML document of [[servers]] blocks, loaded from --config (file://
    URIs or bare paths). Host lists support numeric range expansion.

        [[servers]]
        hosts = ["web[1-5].example.com"]
        roles = ["web"]

        [[servers]]
        hosts = ["db1.example.com"]
        roles = ["db"]
        port = 2222

    --dump-config prints the resolved server/role listing and exits.

NOTIFICATION
    Progress events carry a level (debug, info, warn, error, fatal) and are
    delivered to every --notify channel at or above --notify-level, plus a
    stderr echo unless --quiet. Channel URIs:

        file:///var/log/steer.log
        irc://irc.example.com:6667/ops
        mailto://ops@example.com        (one mail, sent at run end)
        https://hooks.example.com/x     (requires --load webhook)

EXIT STATUS
    0 on overall success, 1 when any target failed, 2 on a fatal setup
    error (bad usage, configuration, resolution, or locking).
"#;
