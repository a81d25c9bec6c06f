//! The one-way, lossy callback channel.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use robolink_model::CallbackMessage;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::JsonFrame;
use crate::IpcError;

/// Worker side: publishes callback messages to whichever subscriber is
/// currently attached.
///
/// `publish` never blocks and is callable from any thread (user code runs
/// its own threads); all writes funnel through a single owning task, which
/// is what keeps concurrent publishes serialized. Messages published while
/// no subscriber is attached are dropped, not queued.
#[derive(Clone)]
pub struct CallbackPublisher {
    tx: mpsc::UnboundedSender<CallbackMessage>,
}

impl CallbackPublisher {
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        let listener = crate::bind_socket(path).await?;
        tracing::debug!(path = %path.display(), "callback channel bound");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(publisher_task(listener, rx));

        Ok(Self { tx })
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, message: CallbackMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("callback writer task is gone, dropping message");
        }
    }
}

/// Owns the listener and the at-most-one live subscriber connection.
async fn publisher_task(
    listener: UnixListener,
    mut rx: mpsc::UnboundedReceiver<CallbackMessage>,
) {
    let mut subscriber: Option<FramedWrite<UnixStream, JsonFrame<CallbackMessage>>> = None;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tracing::debug!("callback subscriber attached");
                    subscriber = Some(FramedWrite::new(stream, JsonFrame::default()));
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to accept a callback subscriber");
                }
            },
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break; // every publisher handle dropped
                };

                let Some(sink) = subscriber.as_mut() else {
                    tracing::trace!("no callback subscriber attached, dropping message");
                    continue;
                };

                if let Err(error) = sink.send(&msg).await {
                    tracing::debug!(%error, "callback subscriber went away");
                    subscriber = None;
                }
            }
        }
    }
}

/// Edge side: a single subscription to the worker's callback stream.
pub struct CallbackSubscriber {
    rx: FramedRead<UnixStream, JsonFrame<CallbackMessage>>,
}

impl CallbackSubscriber {
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = crate::connect_with_retry(path).await?;

        Ok(Self {
            rx: FramedRead::new(stream, JsonFrame::default()),
        })
    }

    /// Poll for the next message; `Ok(None)` when `window` elapses empty.
    pub async fn recv_timeout(
        &mut self,
        window: Duration,
    ) -> Result<Option<CallbackMessage>, IpcError> {
        match tokio::time::timeout(window, self.rx.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(IpcError::Disconnected),
            Ok(Some(msg)) => msg.map(Some),
        }
    }
}
