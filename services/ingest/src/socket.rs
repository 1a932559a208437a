//! The stream connection as a movable value.
//!
//! A connection is owned by exactly one side at a time: the web client until
//! takeover, the receiver afterwards. Moving it out of the web client is the
//! single ownership transition; the source is left `Closed`.
//!
//! The connection starts in `Async` mode (tokio, non-blocking) for the
//! handshake, and the negotiator switches it to `Blocking` mode (a plain
//! `std` socket with a receive timeout) before the prompt is sent, because
//! the streaming worker that inherits it reads synchronously on a dedicated
//! thread. A TLS session, when the front terminates TLS, rides along with
//! the socket through the same moves.

use std::io::Write;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::warn;

pub enum StreamConn {
    /// Pre-negotiation: owned by the acceptance flow on the runtime.
    Async(TcpStream),
    /// Post-negotiation: blocking with a receive timeout, shared with the
    /// receiver handle so a preempting connection can wake a blocked read.
    Blocking(Arc<std::net::TcpStream>),
    Closed,
}

impl StreamConn {
    /// Write `token` raw on the socket, bounded by `timeout`.
    ///
    /// Used for in-band error tokens after takeover, while the connection is
    /// still in async mode.
    pub async fn send_token(&mut self, token: &str, timeout: Duration) -> std::io::Result<()> {
        match self {
            Self::Async(stream) => {
                tokio::time::timeout(timeout, stream.write_all(token.as_bytes()))
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
            }
            Self::Blocking(sock) => {
                sock.set_write_timeout(Some(timeout))?;
                let mut writer: &std::net::TcpStream = sock;
                writer.write_all(token.as_bytes())
            }
            Self::Closed => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    /// Switch to blocking mode with `recv_timeout` on reads.
    ///
    /// Failures to apply the socket options are logged and ignored; losing a
    /// timeout is survivable, losing the connection is not.
    pub fn make_blocking(&mut self, recv_timeout: Duration) -> std::io::Result<Arc<std::net::TcpStream>> {
        match std::mem::replace(self, Self::Closed) {
            Self::Async(stream) => {
                let sock = stream.into_std()?;
                if let Err(e) = sock.set_nonblocking(false) {
                    warn!(error = %e, "cannot clear the non-blocking flag on the stream socket");
                }
                if let Err(e) = sock.set_read_timeout(Some(recv_timeout)) {
                    warn!(error = %e, "cannot set the receive timeout on the stream socket");
                }
                let sock = Arc::new(sock);
                *self = Self::Blocking(Arc::clone(&sock));
                Ok(sock)
            }
            other => {
                *self = other;
                Err(std::io::Error::from(std::io::ErrorKind::NotConnected))
            }
        }
    }

    pub fn close(&mut self) {
        if let Self::Blocking(sock) = self {
            let _ = sock.shutdown(Shutdown::Both);
        }
        *self = Self::Closed;
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async(_) => f.write_str("StreamConn::Async"),
            Self::Blocking(_) => f.write_str("StreamConn::Blocking"),
            Self::Closed => f.write_str("StreamConn::Closed"),
        }
    }
}
