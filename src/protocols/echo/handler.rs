//! Echo handler for a single accepted connection.

use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn, Instrument};

use super::announcer::AliveAnnouncer;
use crate::config::Config;

/// How a handler finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerExit {
    /// The peer closed the connection.
    Closed,
    /// The cancellation signal fired.
    Cancelled,
}

/// Connection-fatal handler errors.
#[derive(Debug)]
pub enum HandlerError {
    /// Read or write failed.
    Io(io::Error),
    /// A write on a non-empty slice reported no progress.
    ZeroWrite,
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Io(e) => write!(f, "connection I/O error: {e}"),
            HandlerError::ZeroWrite => write!(f, "zero bytes indicated in write call"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Io(e) => Some(e),
            HandlerError::ZeroWrite => None,
        }
    }
}

enum Event {
    Cancelled,
    ReadTimeout,
    Read(io::Result<usize>),
    Announce(Bytes),
}

enum WriteOutcome {
    Complete,
    PeerClosed,
}

/// Per-connection echo loop.
///
/// Reads into a fixed buffer and writes each read back in full before the
/// next read. This task is the only writer of its connection; alive
/// announcements arrive over a channel and are written between echoes.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    announce_alive: bool,
    announce_interval: Duration,
    read_deadline: Duration,
    buffer_size: usize,
    /// Announcer tasks, so whoever drains connections drains these too.
    tasks: TaskTracker,
}

impl EchoHandler {
    pub fn new(config: &Config, tasks: TaskTracker) -> Self {
        Self {
            announce_alive: config.announce_alive,
            announce_interval: config.announce_interval,
            read_deadline: config.read_deadline,
            buffer_size: config.buffer_size.max(1),
            tasks,
        }
    }

    /// Echo everything read from `stream` until the peer closes, an I/O
    /// error occurs, or `cancel` fires.
    ///
    /// The stream is dropped, and so closed, when this returns.
    pub async fn run<S>(
        &self,
        mut stream: S,
        cancel: CancellationToken,
    ) -> Result<HandlerExit, HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.buffer_size];
        info!("echoer running");

        // The announcer lives in a child scope that ends with this call.
        let scope = cancel.child_token();
        let _scope_guard = scope.clone().drop_guard();

        let (tx, mut announcements) = mpsc::channel(1);
        if self.announce_alive {
            let announcer = AliveAnnouncer::new(self.announce_interval, tx, scope);
            self.tasks.spawn(announcer.run().in_current_span());
        } else {
            drop(tx);
        }

        loop {
            if cancel.is_cancelled() {
                debug!("exiting due to cancelled context");
                return Ok(HandlerExit::Cancelled);
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                Some(message) = announcements.recv() => Event::Announce(message),
                read = time::timeout(self.read_deadline, stream.read(&mut buffer)) => match read {
                    Ok(result) => Event::Read(result),
                    Err(_) => Event::ReadTimeout,
                },
            };

            match event {
                Event::Cancelled => {
                    debug!("exiting due to cancelled context");
                    return Ok(HandlerExit::Cancelled);
                }
                Event::ReadTimeout => {
                    trace!("read timeout. continuing...");
                }
                Event::Announce(message) => {
                    let written = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(HandlerExit::Cancelled),
                        written = write_fully(&mut stream, &message) => written,
                    };
                    // Real connection faults surface on the echo path
                    if let Err(e) = written {
                        trace!(error = %e, "ignoring failed alive write");
                    }
                }
                Event::Read(Ok(0)) => {
                    info!("connection closed");
                    return Ok(HandlerExit::Closed);
                }
                Event::Read(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    info!("connection closed");
                    return Ok(HandlerExit::Closed);
                }
                Event::Read(Err(e)) => {
                    warn!(error = %e, "error while reading from connection");
                    return Err(HandlerError::Io(e));
                }
                Event::Read(Ok(n)) => {
                    info!(num_bytes = n, "read bytes");
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("exiting due to cancelled context");
                            return Ok(HandlerExit::Cancelled);
                        }
                        outcome = write_fully(&mut stream, &buffer[..n]) => outcome?,
                    };
                    if let WriteOutcome::PeerClosed = outcome {
                        info!("connection closed");
                        return Ok(HandlerExit::Closed);
                    }
                }
            }
        }
    }
}

/// Write all of `data`, advancing a cursor past whatever each call accepts.
async fn write_fully<S>(stream: &mut S, data: &[u8]) -> Result<WriteOutcome, HandlerError>
where
    S: AsyncWrite + Unpin,
{
    let mut cursor = 0;
    while cursor < data.len() {
        match stream.write(&data[cursor..]).await {
            Ok(0) => {
                warn!("wrote zero bytes. aborting.");
                return Err(HandlerError::ZeroWrite);
            }
            Ok(n) => {
                debug!(num_bytes = n, "wrote bytes");
                cursor += n;
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(WriteOutcome::PeerClosed),
            Err(e) => {
                warn!(error = %e, "error while writing to connection");
                return Err(HandlerError::Io(e));
            }
        }
    }
    stream.flush().await.map_err(HandlerError::Io)?;
    Ok(WriteOutcome::Complete)
}
