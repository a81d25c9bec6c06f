//! The supervisor: parent of the worker and the edge server.
//!
//! It cleans stale IPC endpoints, spawns the children in order, watches
//! their liveness and respawns the worker whenever it exits with status 0
//! (the cooperative code-reload path). Every other child exit is fatal:
//! the survivor is torn down and the supervisor exits non-zero so an
//! external manager can observe the fault.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use robolink_model::Config;
use tokio::process::{Child, Command};
use tracing_subscriber::Layer as _;

/// Give the worker time to bind its sockets before the edge connects.
const WORKER_SETTLE: Duration = Duration::from_secs(2);
/// Let the previous worker's resources drain before the respawn.
const RESPAWN_COOLDOWN: Duration = Duration::from_secs(1);
/// SIGTERM grace before escalating to SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const LIVENESS_POLL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(short, long, env = "ROBOLINK_CONFIG", default_value = "robolink.toml")]
    config: PathBuf,

    /// Worker binary; defaults to `robolink-worker` next to this executable.
    #[arg(long, env = "ROBOLINK_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    /// Edge server binary; defaults to `robolink-edge` next to this executable.
    #[arg(long, env = "ROBOLINK_EDGE_BIN")]
    edge_bin: Option<PathBuf>,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger has been set up yet when config loading fails."
)]
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{:#}", anyhow::Error::from(error));
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("{error:#}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(try_main(&cli, config)) {
        Ok(()) => {
            tracing::info!("goodbye");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: &Cli, config: Config) -> Result<()> {
    let (file_layer, _log_handle) = logging::file::layer(
        logging::file::Settings {
            directory: config.log.dir.clone(),
            rotation_bytes: config.log.rotation_mb * 1024 * 1024,
            backup_count: config.log.backup_count,
        },
        "supervisor",
    );
    let file_filter = logging::try_filter(&config.log.file_level)
        .context("invalid file log level in config")?;
    logging::setup_global_subscriber(
        &config.log.console_level,
        Some(file_layer.with_filter(file_filter)),
    )
    .context("failed to set up logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "supervisor started logging");

    // A previous run may have left the named sockets behind; the worker
    // cannot bind over them.
    for socket in [&config.ipc.command_socket, &config.ipc.callback_socket] {
        match std::fs::remove_file(socket) {
            Ok(()) => tracing::debug!(path = %socket.display(), "removed stale IPC endpoint"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => tracing::warn!(path = %socket.display(), %error, "couldn't remove stale IPC endpoint"),
        }
    }

    let worker_bin = resolve_binary(cli.worker_bin.as_deref(), "robolink-worker")?;
    let edge_bin = resolve_binary(cli.edge_bin.as_deref(), "robolink-edge")?;

    let mut worker = spawn_child(&worker_bin, &cli.config).context("failed to spawn the worker")?;
    tracing::info!(pid = worker.id(), "worker started");
    tokio::time::sleep(WORKER_SETTLE).await;

    let mut edge = spawn_child(&edge_bin, &cli.config).context("failed to spawn the edge server")?;
    tracing::info!(pid = edge.id(), "edge server started");

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("failed to install SIGINT handler")?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let mut poll = tokio::time::interval(LIVENESS_POLL);

    let result = loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("caught SIGINT, shutting down");
                break Ok(());
            }
            _ = sigterm.recv() => {
                tracing::info!("caught SIGTERM, shutting down");
                break Ok(());
            }
            _ = poll.tick() => {
                if let Some(status) = worker.try_wait().context("couldn't poll the worker")? {
                    match Decision::from_worker_exit(status) {
                        Decision::Respawn => {
                            tracing::info!("worker exited cleanly, respawning it with a fresh module cache");
                            tokio::time::sleep(RESPAWN_COOLDOWN).await;
                            worker = spawn_child(&worker_bin, &cli.config)
                                .context("failed to respawn the worker")?;
                            tokio::time::sleep(WORKER_SETTLE).await;
                            tracing::info!(pid = worker.id(), "worker respawned");
                        }
                        Decision::Fatal => {
                            break Err(anyhow::anyhow!("worker crashed ({status})"));
                        }
                    }
                }

                if let Some(status) = edge.try_wait().context("couldn't poll the edge server")? {
                    break Err(anyhow::anyhow!("edge server exited unexpectedly ({status})"));
                }
            }
        }
    };

    shutdown_child("edge-server", &mut edge).await;
    shutdown_child("worker", &mut worker).await;

    result
}

/// What to do when the worker exits.
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    /// Exit 0 is the worker asking for a fresh interpreter.
    Respawn,
    /// Everything else (non-zero, signal) tears the system down; an
    /// observable fault beats a zombie.
    Fatal,
}

impl Decision {
    fn from_worker_exit(status: ExitStatus) -> Self {
        if status.code() == Some(0) {
            Decision::Respawn
        } else {
            Decision::Fatal
        }
    }
}

fn resolve_binary(override_path: Option<&Path>, name: &str) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path.to_owned());
    }

    let exe = std::env::current_exe().context("couldn't locate the supervisor executable")?;
    let dir = exe
        .parent()
        .context("supervisor executable has no parent directory")?;
    let path = dir.join(name);

    if !path.exists() {
        bail!(
            "couldn't find `{name}` next to the supervisor; pass --worker-bin / --edge-bin"
        );
    }

    Ok(path)
}

fn spawn_child(binary: &Path, config: &Path) -> Result<Child> {
    Command::new(binary)
        .arg("--config")
        .arg(config)
        .spawn()
        .with_context(|| format!("couldn't spawn `{}`", binary.display()))
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn shutdown_child(name: &str, child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already exited; just reap it.
        let _ = child.try_wait();
        return;
    };

    tracing::info!(name, pid, "stopping child");
    if let Err(error) = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(name, %error, "couldn't signal child");
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(name, %status, "child stopped"),
        Ok(Err(error)) => tracing::warn!(name, %error, "couldn't await child"),
        Err(_elapsed) => {
            tracing::warn!(name, "child ignored SIGTERM, killing it");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt as _;

    #[test]
    fn clean_exit_respawns() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(Decision::from_worker_exit(status), Decision::Respawn);
    }

    #[test]
    fn non_zero_exit_is_fatal() {
        // Wait status encodes the exit code in the high byte.
        let status = ExitStatus::from_raw(1 << 8);
        assert_eq!(status.code(), Some(1));
        assert_eq!(Decision::from_worker_exit(status), Decision::Fatal);
    }

    #[test]
    fn signal_death_is_fatal() {
        // Killed by SIGKILL: no exit code at all.
        let status = ExitStatus::from_raw(9);
        assert_eq!(status.code(), None);
        assert_eq!(Decision::from_worker_exit(status), Decision::Fatal);
    }
}
