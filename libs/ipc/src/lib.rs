//! The split IPC layer between the edge server and the worker.
//!
//! Two Unix domain sockets, both bound by the worker:
//!
//! - the **command channel** is strictly alternating request/reply with at
//!   most one outstanding request ([`CommandClient`] / [`CommandListener`]);
//! - the **callback channel** is one-way, fire-and-forget fan-in of events
//!   produced by user code ([`CallbackPublisher`] / [`CallbackSubscriber`]).
//!
//! Keeping the channels on separate endpoints means user-driven push
//! traffic can never block or reorder command/reply traffic.
//!
//! Frames are length-prefixed JSON on both endpoints.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod callback;
mod codec;
mod command;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};

pub use callback::{CallbackPublisher, CallbackSubscriber};
pub use command::{CommandClient, CommandListener, CommandStream, IncomingCommand};

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O failure on the IPC socket")]
    Io(#[from] std::io::Error),
    #[error("couldn't encode or decode an IPC frame")]
    Codec(#[from] serde_json::Error),
    /// A receive deadline elapsed. The exchange is in an unknown state;
    /// [`CommandClient`] reconnects (with a log line) before its next use.
    #[error("timed out waiting on the IPC channel")]
    Timeout,
    #[error("the IPC peer closed the channel")]
    Disconnected,
    /// Misuse of the strictly alternating command channel. Always a
    /// programming error, never a runtime condition to retry.
    #[error("command channel protocol violation: {0}")]
    Protocol(&'static str),
    #[error("couldn't connect to `{path}` after {attempts} attempts")]
    Connect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

/// How long connect attempts keep retrying. Generous enough to ride out a
/// worker respawn (settle interval included).
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_PAUSE: Duration = Duration::from_millis(100);

/// Bind a listener on `path`, unlinking whatever a previous run left there.
async fn bind_socket(path: &Path) -> Result<UnixListener, IpcError> {
    use std::os::unix::fs::PermissionsExt as _;

    tokio::fs::remove_file(path).await.ok();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(path)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).await?;

    Ok(listener)
}

/// Connect to `path`, sleeping and retrying while the worker comes up.
async fn connect_with_retry(path: &Path) -> Result<UnixStream, IpcError> {
    let mut last_err = None;

    for _ in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                tracing::trace!(path = %path.display(), %error, "IPC endpoint not ready yet");
                last_err = Some(error);
                tokio::time::sleep(CONNECT_PAUSE).await;
            }
        }
    }

    Err(IpcError::Connect {
        path: path.to_owned(),
        attempts: CONNECT_ATTEMPTS,
        source: last_err
            .unwrap_or_else(|| std::io::Error::other("no connection attempt was made")),
    })
}
