use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use pushd::{
    api::{ApiClient, TodoStatusUpdate},
    config::DaemonConfig,
    dispatcher::Dispatcher,
    health::{EnsureOutcome, SelfHeal},
    identity, paths,
    registry::ProjectRegistry,
    remote, status,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pushd",
    about = "Push task daemon — routes voice-captured todos to local coding-assistant sessions",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Seconds between queue polls
    #[arg(long, env = "PUSH_POLL_INTERVAL", global = true)]
    poll_interval: Option<u64>,

    /// Maximum concurrently supervised assistant processes
    #[arg(long, env = "PUSH_MAX_CONCURRENT", global = true)]
    max_concurrent: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PUSH_LOG", global = true)]
    log: Option<String>,

    /// Force routed mode: service every registered project, even before
    /// the first registration exists
    #[arg(long, global = true, conflicts_with = "single_project")]
    routed: bool,

    /// Service only the project in the current directory (no registry,
    /// no cross-machine claiming)
    #[arg(long, global = true)]
    single_project: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    ///
    /// Polls the queue, dispatches tasks into per-task git worktrees, and
    /// supervises the spawned assistant processes. `pushd start` runs this
    /// detached; running it directly is useful for debugging.
    Serve,
    /// Start the daemon in the background (no-op if already running and
    /// current; restarts an outdated daemon).
    Start,
    /// Stop the background daemon.
    Stop,
    /// Stop, then start the daemon again.
    Restart,
    /// Show daemon health and the latest task snapshot.
    Status,
    /// Manage the project registry used to route tasks to directories.
    Projects {
        #[command(subcommand)]
        action: ProjectsAction,
    },
    /// Mark a todo as completed on the queue.
    ///
    /// This is what the assistant's session-end hook invokes when a task
    /// session finishes; it flips the user-visible checkbox in the app.
    Complete {
        /// The task's opaque id (not the display number)
        todo_id: String,
        /// Completion comment shown in the app
        #[arg(long)]
        comment: Option<String>,
    },
    /// Print this machine's identity as seen by the queue.
    Identity,
}

#[derive(Subcommand)]
enum ProjectsAction {
    /// Register a project (defaults to the current directory's origin remote).
    Register {
        /// Path to the checkout (default: current directory)
        path: Option<PathBuf>,
        /// Override the remote key instead of reading `origin`
        #[arg(long)]
        remote: Option<String>,
    },
    /// List registered projects.
    List,
    /// Remove a project from the registry.
    Unregister { remote: String },
    /// Mark a registered project as the default.
    SetDefault { remote: String },
    /// Report registry entries whose checkout is missing or broken.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::new(
        args.poll_interval,
        args.max_concurrent,
        args.log.clone(),
        args.routed,
        args.single_project,
    );

    init_tracing(&config.log);

    match args.command.unwrap_or(Command::Status) {
        Command::Serve => {
            let dispatcher = Dispatcher::new(config);
            dispatcher.run().await
        }
        Command::Start => {
            let heal = SelfHeal::new(&config.state_dir);
            report_ensure(heal.ensure_running(DaemonConfig::version(), config.mode.is_routed())?);
            Ok(())
        }
        Command::Stop => {
            let heal = SelfHeal::new(&config.state_dir);
            if heal.stop()? {
                println!("Daemon stopped.");
            } else {
                println!("Daemon was not running.");
            }
            Ok(())
        }
        Command::Restart => {
            let heal = SelfHeal::new(&config.state_dir);
            heal.stop()?;
            let pid = heal.start(DaemonConfig::version(), config.mode.is_routed())?;
            println!("Daemon restarted (PID {pid}).");
            Ok(())
        }
        Command::Status => {
            let heal = SelfHeal::new(&config.state_dir);
            report_ensure(heal.ensure_running(DaemonConfig::version(), config.mode.is_routed())?);
            print_status(&heal);
            Ok(())
        }
        Command::Projects { action } => run_projects(action, &config),
        Command::Complete { todo_id, comment } => {
            let api = ApiClient::new(&config.api_base_url, paths::credential_file());
            let update = TodoStatusUpdate {
                todo_id: todo_id.clone(),
                is_completed: true,
                completed_at: chrono::Utc::now(),
                completion_comment: comment,
            };
            api.set_todo_status(&update)
                .await
                .with_context(|| format!("failed to mark {todo_id} completed"))?;
            println!("Marked {todo_id} completed.");
            Ok(())
        }
        Command::Identity => {
            let id = identity::machine_id(&paths::machine_id_file());
            println!("machine_id:   {id}");
            println!("machine_name: {}", identity::machine_name());
            println!("suffix:       {}", identity::machine_suffix(&id));
            Ok(())
        }
    }
}

fn init_tracing(filter: &str) {
    // Non-blocking writer so a slow log sink never stalls the poll loop.
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    // Keep the flush guard alive for the life of the process.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
}

fn report_ensure(outcome: EnsureOutcome) {
    match outcome {
        EnsureOutcome::AlreadyRunning { .. } => {}
        EnsureOutcome::Started { pid } => eprintln!("[push] Daemon started (PID {pid})"),
        EnsureOutcome::Restarted { pid } => eprintln!("[push] Daemon upgraded and restarted (PID {pid})"),
        EnsureOutcome::NotInstalled => {}
    }
}

fn print_status(heal: &SelfHeal) {
    let report = heal.report(DaemonConfig::version());
    if !report.running {
        println!("Daemon: OFFLINE");
        println!("\nRun `pushd start` to bring it up.");
        return;
    }

    let snapshot = status::read_status(&paths::status_file());
    let version = snapshot
        .as_ref()
        .map(|s| s.daemon.version.clone())
        .or(report.version)
        .unwrap_or_else(|| "?".to_string());
    println!(
        "Daemon: ONLINE (v{version}, PID {})",
        report.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
    );
    if let Some(uptime) = report.uptime_secs {
        println!("Uptime: {}", status::format_duration(uptime));
    }

    let Some(snapshot) = snapshot else {
        println!("\nNo status snapshot yet.");
        return;
    };
    println!("Machine: {}", snapshot.daemon.machine_name);

    let running: Vec<_> = snapshot
        .active_tasks
        .iter()
        .filter(|t| t.status == status::ActiveStatus::Running)
        .collect();
    let queued: Vec<_> = snapshot
        .active_tasks
        .iter()
        .filter(|t| t.status == status::ActiveStatus::Queued)
        .collect();

    if running.is_empty() && queued.is_empty() {
        println!("\nNo active tasks.");
    }
    if !running.is_empty() {
        println!("\nRunning ({}):", running.len());
        for task in running {
            let elapsed = status::format_duration(task.elapsed_seconds.unwrap_or(0));
            println!("  ● #{} {} ({elapsed})", task.display_number, task.summary);
            if let Some(ref detail) = task.detail {
                println!("    └─ {detail}");
            }
        }
    }
    if !queued.is_empty() {
        println!("\nQueued ({}):", queued.len());
        for task in queued {
            println!("  ○ #{} {}", task.display_number, task.summary);
        }
    }

    println!(
        "\nCompleted today: {} | Slots: {}/{}",
        snapshot.stats.completed_today, snapshot.stats.running, snapshot.stats.max_concurrent
    );
    if !snapshot.completed_today.is_empty() {
        println!("\nRecent completions:");
        for task in snapshot.completed_today.iter().rev().take(3) {
            let marker = match task.status {
                status::CompletionStatus::Completed => "✓",
                status::CompletionStatus::Failed => "✗",
                status::CompletionStatus::Timeout => "⏱",
            };
            let duration = status::format_duration(task.duration_seconds);
            print!("  {marker} #{} ({duration})", task.display_number);
            if let Some(ref url) = task.pr_url {
                print!(" {url}");
            }
            println!();
        }
    }
}

fn run_projects(action: ProjectsAction, config: &DaemonConfig) -> Result<()> {
    let mut registry = ProjectRegistry::open(&paths::registry_file());

    match action {
        ProjectsAction::Register { path, remote } => {
            let path = path.unwrap_or_else(|| PathBuf::from("."));
            let path = path
                .canonicalize()
                .with_context(|| format!("path does not exist: {}", path.display()))?;
            let remote_key = match remote {
                Some(r) => remote::normalize_remote(&r),
                None => remote::repo_remote(&path).context(
                    "no `origin` remote found — pass --remote host/owner/repo explicitly",
                )?,
            };
            let is_new = registry.register(&remote_key, &path)?;
            if is_new {
                println!("Registered {remote_key} -> {}", path.display());
            } else {
                println!("Updated {remote_key} -> {}", path.display());
            }
            // Registration is the moment a routed daemon becomes useful.
            let heal = SelfHeal::new(&config.state_dir);
            report_ensure(heal.ensure_running(DaemonConfig::version(), true)?);
        }
        ProjectsAction::List => {
            if registry.count() == 0 {
                println!("No projects registered. Run `pushd projects register` in a checkout.");
                return Ok(());
            }
            let default = registry.get_default().map(str::to_string);
            for (remote, entry) in registry.list() {
                let marker = if Some(remote) == default.as_deref() {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {remote}");
                println!("    -> {}", entry.local_path.display());
            }
        }
        ProjectsAction::Unregister { remote } => {
            let remote = remote::normalize_remote(&remote);
            if registry.unregister(&remote)? {
                println!("Unregistered {remote}");
            } else {
                println!("{remote} was not registered");
            }
        }
        ProjectsAction::SetDefault { remote } => {
            let remote = remote::normalize_remote(&remote);
            if registry.set_default(&remote)? {
                println!("Default project: {remote}");
            } else {
                println!("{remote} is not registered");
            }
        }
        ProjectsAction::Validate => {
            let invalid = registry.validate();
            if invalid.is_empty() {
                println!("All {} registered project(s) look valid.", registry.count());
            } else {
                println!("{} invalid entr(y/ies):", invalid.len());
                for entry in invalid {
                    println!(
                        "  {} -> {} ({:?})",
                        entry.remote,
                        entry.local_path.display(),
                        entry.reason
                    );
                }
            }
        }
    }
    Ok(())
}
