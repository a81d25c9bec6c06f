//! The edge server: terminates the client's realtime channel, enforces
//! single-client admission, verifies bearers against the identity service
//! and bridges validated commands onto the worker's IPC channels.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::{RawQuery, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use envelope::EnvelopeCipher;
use robolink_ipc::CommandClient;
use robolink_model::{Config, ErrorCode};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing_subscriber::Layer as _;
use uuid::Uuid;

mod auth;
mod protocol;
mod session;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(short, long, env = "ROBOLINK_CONFIG", default_value = "robolink.toml")]
    config: PathBuf,
}

/// An admitted client's identity triple.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    #[allow(dead_code)]
    pub claims: Value,
}

pub struct AppState {
    config: Config,
    /// The single admission slot; at most one client session at a time.
    admission: parking_lot::Mutex<Option<Session>>,
    /// Shared command channel client; the async lock is what serializes
    /// dispatch so the channel never sees two outstanding requests.
    command: tokio::sync::Mutex<CommandClient>,
    cipher: Option<EnvelopeCipher>,
    http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    fn new(config: Config) -> Result<SharedState> {
        let cipher = if config.encryption.enabled {
            let passphrase = config
                .encryption
                .passphrase
                .as_deref()
                .context("encryption is enabled but no passphrase is configured")?;
            Some(EnvelopeCipher::new(passphrase))
        } else {
            None
        };

        let command = CommandClient::new(&config.ipc.command_socket);
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build the identity HTTP client")?;

        Ok(Arc::new(Self {
            config,
            admission: parking_lot::Mutex::new(None),
            command: tokio::sync::Mutex::new(command),
            cipher,
            http,
        }))
    }

    /// Try to take the admission slot for a freshly verified client.
    fn admit(&self, claims: Value) -> Result<Session, ErrorCode> {
        let mut slot = self.admission.lock();
        if slot.is_some() {
            return Err(ErrorCode::ConnectionRejected);
        }

        let user_id = claims
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_owned();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            claims,
        };
        *slot = Some(session.clone());

        Ok(session)
    }

    /// Clear the slot if `session_id` still holds it. Idempotent.
    fn release(&self, session_id: Uuid) -> bool {
        let mut slot = self.admission.lock();
        if slot.as_ref().is_some_and(|s| s.id == session_id) {
            *slot = None;
            return true;
        }

        false
    }
}

/// Releases the admission slot even when the upgrade never completes.
pub struct AdmissionGuard {
    state: SharedState,
    session_id: Uuid,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.state.release(self.session_id) {
            tracing::debug!(session = %self.session_id, "admission slot reclaimed");
        }
    }
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

async fn try_main(config: Config) -> Result<()> {
    let (file_layer, _log_handle) = logging::file::layer(
        logging::file::Settings {
            directory: config.log.dir.clone(),
            rotation_bytes: config.log.rotation_mb * 1024 * 1024,
            backup_count: config.log.backup_count,
        },
        "edge-server",
    );
    let file_filter = logging::try_filter(&config.log.file_level)
        .context("invalid file log level in config")?;
    logging::setup_global_subscriber(
        &config.log.console_level,
        Some(file_layer.with_filter(file_filter)),
    )
    .context("failed to set up logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        encryption = config.encryption.enabled,
        identity = config.identity.url,
        "edge server started logging"
    );

    let host: IpAddr = config
        .channel
        .host
        .parse()
        .with_context(|| format!("invalid channel host `{}`", config.channel.host))?;
    let addr = SocketAddr::new(host, config.channel.port);

    let state = AppState::new(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("couldn't bind the realtime channel on {addr}"))?;
    tracing::info!(%addr, "realtime channel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("realtime channel server failed")?;

    Ok(())
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(service_status))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn service_status() -> Json<Value> {
    Json(json!({
        "service": "robolink",
        "protocol": "websocket",
        "status": "running",
    }))
}

/// Admission and credential checks happen before the upgrade; a refusal is
/// an HTTP 403 whose body is `"<error_code>:<message>"`.
async fn ws_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = auth::extract_token(&headers, query.as_deref()) else {
        tracing::warn!("connection rejected: no token provided");
        return refuse(ErrorCode::AuthTokenMissing);
    };

    let claims = match auth::verify_token(&state.http, &state.config.identity.url, &token).await {
        Ok(Some(claims)) => claims,
        Ok(None) => return refuse(ErrorCode::AuthTokenInvalid),
        Err(error) => {
            tracing::error!(%error, "identity service unreachable");
            return refuse(ErrorCode::AuthTokenInvalid);
        }
    };

    let session = match state.admit(claims) {
        Ok(session) => session,
        Err(code) => {
            tracing::warn!("connection rejected: another client is active");
            return refuse(code);
        }
    };

    let guard = AdmissionGuard {
        state: state.clone(),
        session_id: session.id,
    };

    ws.on_upgrade(move |socket| session::run(state, session, guard, socket))
}

fn refuse(code: ErrorCode) -> Response {
    (
        StatusCode::FORBIDDEN,
        format!("{}:{}", code.code(), code.default_message()),
    )
        .into_response()
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(error) => {
            tracing::error!(%error, "couldn't install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    tracing::info!("shutdown signal received");
}
