use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drover::client::Client;
use drover::config::ManagerConfig;
use drover::error::Result;
use drover::scheduler::local::LocalBackend;
use drover::scheduler::SchedulerBackend;
use drover::server::{Server, StopReason};
use drover::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "A distributed job queue manager")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// The job queue manager daemon
    Manager {
        #[command(subcommand)]
        command: ManagerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ManagerCommand {
    /// Start the manager, daemonizing it into the background (unless
    /// --foreground is supplied)
    Start {
        /// Do not daemonize
        #[arg(long, short = 'f')]
        foreground: bool,
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// Stop the manager, gracefully shutting down the queues
    Stop {
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// Find out whether the manager is currently running
    Status {
        #[command(flatten)]
        opts: CommonOpts,
    },
}

#[derive(clap::Args, Debug)]
struct CommonOpts {
    /// Port the manager listens on
    #[arg(long, default_value_t = 11301)]
    port: u16,

    /// Working directory for the manager's files
    #[arg(long, default_value = ".drover")]
    dir: PathBuf,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn load_config(opts: &CommonOpts) -> ManagerConfig {
    let mut cfg = match &opts.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .unwrap_or_else(|e| fatal(format!("could not read config {}: {e}", path.display())));
            serde_json::from_str(&contents)
                .unwrap_or_else(|e| fatal(format!("bad config {}: {e}", path.display())))
        }
        None => ManagerConfig::new(opts.port, opts.dir.clone()),
    };
    cfg.port = opts.port;
    if cfg.allowed_users.is_empty() {
        let user = std::env::var("USER").unwrap_or_else(|_| "drover".to_string());
        cfg.allowed_users.push(user);
    }
    cfg
}

fn current_user(cfg: &ManagerConfig) -> String {
    std::env::var("USER").unwrap_or_else(|_| {
        cfg.allowed_users
            .first()
            .cloned()
            .unwrap_or_else(|| "drover".to_string())
    })
}

async fn connect(cfg: &ManagerConfig, wait: Duration) -> Option<Client> {
    let addr = format!("localhost:{}", cfg.port);
    Client::connect(&addr, "cmds", current_user(cfg), wait)
        .await
        .ok()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Command::Manager { command } = args.command;
    match command {
        ManagerCommand::Start { foreground, opts } => start(foreground, opts).await,
        ManagerCommand::Stop { opts } => stop(opts).await,
        ManagerCommand::Status { opts } => status(opts).await,
    }
}

async fn start(foreground: bool, opts: CommonOpts) {
    let cfg = load_config(&opts);

    if let Err(e) = std::fs::create_dir_all(&cfg.manager_dir) {
        fatal(format!(
            "could not create the working directory '{}': {e}",
            cfg.manager_dir.display()
        ));
    }

    // a meaningful message for the most obvious failure mode
    if let Some(mut client) = connect(&cfg, Duration::from_millis(10)).await {
        let pid = client
            .server_stats()
            .await
            .map(|s| s.server_info.pid)
            .unwrap_or(0);
        fatal(format!(
            "drover manager on port {} is already running (pid {pid})",
            cfg.port
        ));
    }

    if foreground {
        apply_umask(&cfg);
        run_manager(cfg, true).await;
    } else {
        daemonize(cfg).await;
    }
}

/// Re-exec ourselves with --foreground, detached, stdout/stderr appended to
/// the log file, then wait for the child to bring the manager up.
async fn daemonize(cfg: ManagerConfig) {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()
        .unwrap_or_else(|e| fatal(format!("could not find own executable: {e}")));
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.log_file)
        .unwrap_or_else(|e| fatal(format!("could not open log file {}: {e}", cfg.log_file.display())));

    let mut command = std::process::Command::new(exe);
    command
        .args(["manager", "start", "--foreground", "--port"])
        .arg(cfg.port.to_string())
        .arg("--dir")
        .arg(&cfg.manager_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone().unwrap_or_else(|e| fatal(e))))
        .stderr(Stdio::from(log))
        .process_group(0);
    if let Err(e) = command.spawn() {
        fatal(format!("failed to daemonize: {e}"));
    }

    match connect(&cfg, Duration::from_secs(10)).await {
        Some(mut client) => match client.server_stats().await {
            Ok(stats) => {
                println!(
                    "drover manager started on {}, pid {}",
                    stats.server_info.addr, stats.server_info.pid
                );
            }
            Err(e) => fatal(format!(
                "drover manager started but doesn't seem to be functional: {e}"
            )),
        },
        None => fatal(format!(
            "drover manager failed to start on port {} after 10s",
            cfg.port
        )),
    }
}

fn apply_umask(cfg: &ManagerConfig) {
    let mode = nix::sys::stat::Mode::from_bits_truncate(cfg.umask);
    nix::sys::stat::umask(mode);
}

async fn run_manager(cfg: ManagerConfig, say_started: bool) {
    let backend: std::sync::Arc<dyn SchedulerBackend> = match make_backend(&cfg) {
        Ok(backend) => backend,
        Err(e) => fatal(format!("could not initialise the scheduler: {e}")),
    };

    let mut server = match Server::serve(cfg.clone(), backend).await {
        Ok(server) => server,
        Err(e) => fatal(format!("could not start the manager: {e}")),
    };
    install_shutdown_handler(&server);

    if let Err(e) = std::fs::write(&cfg.pid_file, std::process::id().to_string()) {
        fatal(format!(
            "could not write pid file {}: {e}",
            cfg.pid_file.display()
        ));
    }

    let info = server.server_info();
    if say_started {
        tracing::info!(addr = %info.addr, pid = info.pid, "drover manager started");
    }

    let reason = server.block().await;
    let _ = std::fs::remove_file(&cfg.pid_file);
    match reason {
        StopReason::Term => {
            tracing::info!(addr = %info.addr, "drover manager gracefully stopped (received SIGTERM)");
        }
        StopReason::Int => {
            tracing::info!(addr = %info.addr, "drover manager gracefully stopped (received SIGINT)");
        }
        StopReason::Stop => {
            tracing::info!(addr = %info.addr, "drover manager gracefully stopped");
        }
    }
}

fn make_backend(cfg: &ManagerConfig) -> Result<std::sync::Arc<dyn SchedulerBackend>> {
    // the cloud backend needs a provider implementation wired in by the
    // embedding application; the CLI schedules locally
    Ok(std::sync::Arc::new(LocalBackend::new(&cfg.shell)?))
}

async fn stop(opts: CommonOpts) {
    let cfg = load_config(&opts);

    // the daemon could be running but non-responsive, or could have exited
    // leaving the pid file behind; check the pid file first, then fall back
    // to asking the server itself
    let pid = read_pid_file(&cfg.pid_file);
    let mut stopped = false;
    match pid {
        Some(pid) => {
            stopped = stop_daemon(pid, &format!("pid file {}", cfg.pid_file.display())).await;
        }
        None => {
            if connect(&cfg, Duration::from_secs(1)).await.is_none() {
                fatal(format!(
                    "drover manager does not seem to be running on port {}",
                    cfg.port
                ));
            }
        }
    }

    if stopped {
        if connect(&cfg, Duration::from_millis(10)).await.is_none() {
            println!(
                "drover manager running on port {} was gracefully shut down",
                cfg.port
            );
            let _ = std::fs::remove_file(&cfg.pid_file);
            return;
        }
        eprintln!(
            "I terminated the pid from {}, but the manager is still up on port {}!",
            cfg.pid_file.display(),
            cfg.port
        );
    }

    // ask the live server for its real pid and try again
    let Some(mut client) = connect(&cfg, Duration::from_secs(5)).await else {
        fatal(format!(
            "according to the pid file {} the manager was running, but it could not be \
             terminated and cannot be connected to; after confirming it is dead, delete \
             the pid file",
            cfg.pid_file.display()
        ));
    };
    let Ok(stats) = client.server_stats().await else {
        fatal("the manager is connectable but would not reveal its pid; giving up");
    };
    drop(client);
    if stop_daemon(stats.server_info.pid as i32, "the manager itself").await {
        println!(
            "drover manager running on port {} was gracefully shut down",
            cfg.port
        );
        let _ = std::fs::remove_file(&cfg.pid_file);
    } else {
        eprintln!("I've tried everything; giving up trying to stop the manager");
        std::process::exit(1);
    }
}

async fn status(opts: CommonOpts) {
    let cfg = load_config(&opts);
    if read_pid_file(&cfg.pid_file).is_some() {
        if connect(&cfg, Duration::from_secs(5)).await.is_some() {
            println!("started");
            return;
        }
        fatal(format!(
            "drover manager on port {} is supposed to be running, but is non-responsive",
            cfg.port
        ));
    }
    if connect(&cfg, Duration::from_millis(10)).await.is_none() {
        println!("stopped");
    } else {
        println!("started");
    }
}

fn read_pid_file(path: &std::path::Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// SIGTERM the pid and wait for it to go away.
async fn stop_daemon(pid: i32, source: &str) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        eprintln!("drover manager is running with pid {pid} according to {source}, but failed to send it SIGTERM: {e}");
        return false;
    }

    let give_up = Duration::from_secs(15);
    let start = std::time::Instant::now();
    loop {
        // signal 0 just checks the process still exists
        if kill(pid, None).is_err() {
            return true;
        }
        if start.elapsed() >= give_up {
            eprintln!(
                "drover manager, running with pid {pid} according to {source}, is still \
                 running 15s after I sent it a SIGTERM"
            );
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
