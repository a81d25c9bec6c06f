//! The strictly alternating request/reply channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use robolink_model::{Command, Reply};
use serde_json::Value;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::JsonFrame;
use crate::IpcError;

/// Worker side: owns the bound socket and accepts one edge peer at a time.
pub struct CommandListener {
    listener: tokio::net::UnixListener,
}

impl CommandListener {
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        let listener = crate::bind_socket(path).await?;
        tracing::debug!(path = %path.display(), "command channel bound");

        Ok(Self { listener })
    }

    pub async fn accept(&mut self) -> Result<CommandStream, IpcError> {
        let (stream, _) = self.listener.accept().await?;

        if let Ok(cred) = stream.peer_cred() {
            tracing::info!(
                uid = cred.uid(),
                pid = cred.pid(),
                "accepted a command channel peer"
            );
        }

        let (rx, tx) = tokio::io::split(stream);

        Ok(CommandStream {
            rx: FramedRead::new(rx, JsonFrame::default()),
            tx: FramedWrite::new(tx, JsonFrame::default()),
            awaiting_reply: false,
        })
    }
}

/// One accepted command connection, enforcing request/reply alternation.
pub struct CommandStream {
    rx: FramedRead<ReadHalf<UnixStream>, JsonFrame<Value>>,
    tx: FramedWrite<WriteHalf<UnixStream>, JsonFrame<Reply>>,
    awaiting_reply: bool,
}

/// What the worker pulled off the wire.
///
/// Requests are decoded leniently so a malformed command still gets an
/// error reply instead of poisoning the channel's alternation.
#[derive(Debug)]
pub enum IncomingCommand {
    Valid(Command),
    Malformed {
        raw: Value,
        error: serde_json::Error,
    },
}

impl CommandStream {
    /// The next request from the edge; `None` once the peer hangs up.
    pub async fn next_request(&mut self) -> Option<Result<IncomingCommand, IpcError>> {
        if self.awaiting_reply {
            return Some(Err(IpcError::Protocol(
                "received a request while the previous one is still unanswered",
            )));
        }

        let raw = match self.rx.next().await? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };
        self.awaiting_reply = true;

        let incoming = match serde_json::from_value::<Command>(raw.clone()) {
            Ok(command) => IncomingCommand::Valid(command),
            Err(error) => IncomingCommand::Malformed { raw, error },
        };

        Some(Ok(incoming))
    }

    pub async fn reply(&mut self, reply: &Reply) -> Result<(), IpcError> {
        if !self.awaiting_reply {
            return Err(IpcError::Protocol("reply without a pending request"));
        }

        self.tx.send(reply).await?;
        self.awaiting_reply = false;

        Ok(())
    }
}

/// Edge side: issues commands and waits for the matching reply.
///
/// At most one request is ever in flight: `call` holds `&mut self` across
/// the full send/receive exchange. The connection is established lazily
/// and re-established transparently once when the worker was recycled
/// between two commands.
pub struct CommandClient {
    path: PathBuf,
    conn: Option<Conn>,
}

struct Conn {
    rx: FramedRead<ReadHalf<UnixStream>, JsonFrame<Reply>>,
    tx: FramedWrite<WriteHalf<UnixStream>, JsonFrame<Command>>,
}

impl CommandClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    /// Send `command` and block until the worker replies.
    pub async fn call(&mut self, command: &Command) -> Result<Reply, IpcError> {
        self.call_inner(command, None).await
    }

    /// Like [`call`](Self::call) but gives up after `deadline`.
    ///
    /// A timeout leaves the exchange in an unknown state, so the
    /// connection is dropped (logged, never silent) and rebuilt on the
    /// next call.
    pub async fn call_timeout(
        &mut self,
        command: &Command,
        deadline: Duration,
    ) -> Result<Reply, IpcError> {
        self.call_inner(command, Some(deadline)).await
    }

    async fn call_inner(
        &mut self,
        command: &Command,
        deadline: Option<Duration>,
    ) -> Result<Reply, IpcError> {
        let mut reconnected = false;

        loop {
            if self.conn.is_none() {
                let stream = crate::connect_with_retry(&self.path).await?;
                let (rx, tx) = tokio::io::split(stream);
                self.conn = Some(Conn {
                    rx: FramedRead::new(rx, JsonFrame::default()),
                    tx: FramedWrite::new(tx, JsonFrame::default()),
                });
            }
            let Some(conn) = self.conn.as_mut() else {
                return Err(IpcError::Disconnected);
            };

            match Self::exchange(conn, command, deadline).await {
                Ok(reply) => return Ok(reply),
                Err(IpcError::Timeout) => {
                    tracing::warn!(
                        command = command.name(),
                        "command timed out, dropping the connection so the next call starts clean"
                    );
                    self.conn = None;
                    return Err(IpcError::Timeout);
                }
                Err(error) if !reconnected => {
                    tracing::debug!(
                        command = command.name(),
                        %error,
                        "command channel broken (worker recycled?), reconnecting once"
                    );
                    self.conn = None;
                    reconnected = true;
                }
                Err(error) => {
                    self.conn = None;
                    return Err(error);
                }
            }
        }
    }

    async fn exchange(
        conn: &mut Conn,
        command: &Command,
        deadline: Option<Duration>,
    ) -> Result<Reply, IpcError> {
        conn.tx.send(command).await?;

        let next = conn.rx.next();
        let msg = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, next)
                .await
                .map_err(|_| IpcError::Timeout)?,
            None => next.await,
        };

        msg.ok_or(IpcError::Disconnected)?
    }
}
