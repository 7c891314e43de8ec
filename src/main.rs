use clap::{Args, Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use webexec::auth::FileAuthorizer;
use webexec::config::{self, Config, ConfigError};
use webexec::pane::PaneRegistry;
use webexec::peer::{ControlEngine, PeerConfig, PeerHub, SharedPayload};
use webexec::signaling::{self, AgentState};
use webexec::telemetry::{self, LogConfig, LogLevel};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    config::ensure_home()?;
    match cli.command {
        Command::Start(args) => start(args).await,
        Command::Stop => stop(),
        Command::Status => status(),
        Command::Restart(args) => {
            match stop() {
                Ok(()) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(CliError::AgentNotRunning) => {}
                Err(err) => return Err(err),
            }
            start(args).await
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "webexec",
    about = "Execute commands and pipe their stdin/stdout over WebRTC",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn the agent: an http server and a webrtc peer per client
    Start(StartArgs),
    /// Stop the user's agent
    Stop,
    /// Print the agent's status
    Status,
    /// Restart the agent, starting it if it is stopped
    Restart(StartArgs),
}

#[derive(Args, Debug, Default)]
struct StartArgs {
    #[arg(
        long,
        short = 'a',
        value_name = "ADDRESS",
        env = "WEBEXEC_ADDRESS",
        help = "The address to listen to (defaults to the configured one)"
    )]
    address: Option<String>,

    #[arg(long, help = "Run in the foreground, logging to stderr")]
    debug: bool,

    #[arg(long, help = "Run as the background agent (set by `start` itself)")]
    agent: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("agent is not running")]
    AgentNotRunning,
    #[error("agent is already running as process {0}")]
    AlreadyRunning(i32),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] telemetry::InitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Agent(String),
}

async fn start(args: StartArgs) -> Result<(), CliError> {
    if args.debug {
        telemetry::init(&LogConfig {
            level: LogLevel::Debug,
            file: None,
        })?;
        return run_agent(args.address).await;
    }
    if args.agent {
        let pid_path = config::conf_path("agent.pid")?;
        write_pidfile(&pid_path)?;
        telemetry::init(&LogConfig {
            level: LogLevel::Info,
            file: Some(config::conf_path("agent.log")?),
        })?;
        let result = run_agent(args.address).await;
        let _ = std::fs::remove_file(&pid_path);
        return result;
    }
    launch_background(args)
}

/// Re-execute ourselves with `--agent` and return immediately.
fn launch_background(args: StartArgs) -> Result<(), CliError> {
    let pid_path = config::conf_path("agent.pid")?;
    if let Some(pid) = running_pid(&pid_path) {
        println!("agent is already running as process {pid}, doing nothing");
        return Ok(());
    }
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command.arg("start").arg("--agent");
    if let Some(address) = &args.address {
        command.arg("--address").arg(address);
    }
    let child = command
        .spawn()
        .map_err(|err| CliError::Agent(format!("agent failed to start: {err}")))?;
    std::thread::sleep(Duration::from_millis(100));
    println!("agent started as process #{}", child.id());
    Ok(())
}

async fn run_agent(address: Option<String>) -> Result<(), CliError> {
    let config = Config::load()?;
    let address = address.unwrap_or_else(|| config.address.clone());

    let authorizer = Arc::new(FileAuthorizer::new(config::conf_path("authorized_tokens")?));
    let registry = Arc::new(PaneRegistry::new(config.buffer_bytes));
    let payload: SharedPayload = Arc::new(RwLock::new(Vec::new()));
    let engine = Arc::new(ControlEngine::new(
        Arc::clone(&registry),
        authorizer.clone(),
        Arc::clone(&payload),
    ));
    let hub = Arc::new(PeerHub::new());
    let state = Arc::new(AgentState::new(
        authorizer,
        Arc::clone(&registry),
        engine,
        Arc::clone(&hub),
        payload,
        PeerConfig::from(&config),
        config.offer_ttl(),
    ));

    let sock_path = config::run_path(config::SOCK_FILE)?;
    info!(%address, sock = %sock_path.display(), "agent starting");

    let http_state = Arc::clone(&state);
    let http_address = address.clone();
    let http = tokio::spawn(async move { signaling::http::serve(http_state, &http_address).await });

    let sock_state = Arc::clone(&state);
    let sock_serve_path = sock_path.clone();
    let sock =
        tokio::spawn(async move { signaling::sock::serve(sock_state, &sock_serve_path).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = http => {
            return Err(CliError::Agent(serve_failure("http server", result)));
        }
        result = sock => {
            return Err(CliError::Agent(serve_failure("socket server", result)));
        }
        _ = tokio::signal::ctrl_c() => info!("exiting on SIGINT"),
        _ = sigterm.recv() => info!("exiting on SIGTERM"),
    }

    hub.shutdown().await;
    registry.shutdown().await;
    let _ = std::fs::remove_file(&sock_path);
    Ok(())
}

fn serve_failure(
    what: &str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> String {
    match result {
        Ok(Ok(())) => format!("{what} exited unexpectedly"),
        Ok(Err(err)) => format!("{what} failed: {err}"),
        Err(err) => format!("{what} task panicked: {err}"),
    }
}

fn stop() -> Result<(), CliError> {
    let pid_path = config::conf_path("agent.pid")?;
    let Some(pid) = running_pid(&pid_path) else {
        return Err(CliError::AgentNotRunning);
    };
    println!("Sending a SIGINT to agent process {pid}");
    kill(Pid::from_raw(pid), Signal::SIGINT)
        .map_err(|err| CliError::Agent(format!("failed to signal the agent: {err}")))?;
    Ok(())
}

fn status() -> Result<(), CliError> {
    let pid_path = config::conf_path("agent.pid")?;
    match read_pid(&pid_path) {
        None => println!("agent is not running"),
        Some(pid) if pid_running(pid) => println!("agent is running with process id {pid}"),
        Some(_) => println!("agent is not running and pid is stale"),
    }
    Ok(())
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_running(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn running_pid(path: &Path) -> Option<i32> {
    read_pid(path).filter(|&pid| pid_running(pid))
}

fn write_pidfile(path: &Path) -> Result<(), CliError> {
    if let Some(pid) = running_pid(path) {
        return Err(CliError::AlreadyRunning(pid));
    }
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}
