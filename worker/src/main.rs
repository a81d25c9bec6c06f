//! The worker process: loads user projects and serves commands from the
//! edge server over the command channel.
//!
//! Exit status is part of the contract with the supervisor: 0 asks for a
//! respawn (the clean code-reload path), anything else tears the whole
//! system down.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use robolink_ipc::{CallbackPublisher, CommandListener, IncomingCommand};
use robolink_model::{Config, ErrorCode, Reply};
use tracing_subscriber::Layer as _;

mod executor;
mod project;
mod service;

use service::Service;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(short, long, env = "ROBOLINK_CONFIG", default_value = "robolink.toml")]
    config: PathBuf,
}

enum Outcome {
    /// Exit 0 so the supervisor respawns us with a fresh interpreter.
    Restart,
    /// Signal-driven shutdown.
    Terminated,
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

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
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

    match runtime.block_on(try_main(config)) {
        Ok(Outcome::Restart) => {
            tracing::info!("exiting with status 0 so the supervisor respawns us");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Terminated) => {
            tracing::info!("goodbye");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(config: Config) -> Result<Outcome> {
    let (file_layer, _log_handle) = logging::file::layer(
        logging::file::Settings {
            directory: config.log.dir.clone(),
            rotation_bytes: config.log.rotation_mb * 1024 * 1024,
            backup_count: config.log.backup_count,
        },
        "worker",
    );
    let file_filter = logging::try_filter(&config.log.file_level)
        .context("invalid file log level in config")?;
    logging::setup_global_subscriber(
        &config.log.console_level,
        Some(file_layer.with_filter(file_filter)),
    )
    .context("failed to set up logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "worker started logging");

    let listener = CommandListener::bind(&config.ipc.command_socket)
        .await
        .context("failed to bind the command channel")?;
    let publisher = CallbackPublisher::bind(&config.ipc.callback_socket)
        .await
        .context("failed to bind the callback channel")?;

    let mut service = Service::new(&config.storage, publisher);
    service.try_load_existing_project();

    tracing::info!("worker ready");

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("failed to install SIGINT handler")?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let outcome = tokio::select! {
        outcome = command_loop(listener, &mut service) => outcome?,
        _ = sigint.recv() => {
            tracing::info!("caught SIGINT, shutting down");
            Outcome::Terminated
        }
        _ = sigterm.recv() => {
            tracing::info!("caught SIGTERM, shutting down");
            Outcome::Terminated
        }
    };

    service.shutdown();

    Ok(outcome)
}

/// Serve one edge peer at a time, strictly alternating request and reply.
async fn command_loop(mut listener: CommandListener, service: &mut Service) -> Result<Outcome> {
    loop {
        let mut stream = listener.accept().await.context("command channel accept")?;

        while let Some(request) = stream.next_request().await {
            let request = match request {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(%error, "broken command stream, waiting for a reconnect");
                    break;
                }
            };

            let reply = match request {
                // User code may block arbitrarily long; keep the runtime
                // threads responsive while it does.
                IncomingCommand::Valid(command) => {
                    tokio::task::block_in_place(|| service.handle(command))
                }
                IncomingCommand::Malformed { error, .. } => Reply::error_with_message(
                    ErrorCode::ProtocolUnknownCommand,
                    format!("unparseable command: {error}"),
                ),
            };

            stream
                .reply(&reply)
                .await
                .context("failed to send a reply")?;

            if service.restart_pending() {
                return Ok(Outcome::Restart);
            }
        }

        tracing::info!("edge server disconnected from the command channel");
    }
}
