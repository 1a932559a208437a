//! Capability negotiation and the initial response.
//!
//! Runs on a blocking thread after the host is bound: picks the stream
//! codec from the negotiated capabilities, switches the socket from the
//! async front to blocking mode with the receive timeout, then writes the
//! version-appropriate prompt under the send timeout.

use crate::config::StreamSettings;
use crate::receiver::ReceiverState;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum NegotiateError {
    #[error("cannot switch the stream socket to blocking mode: {0}")]
    Blocking(#[source] std::io::Error),
    #[error("cannot deliver the initial response: {0}")]
    CantReply(#[source] std::io::Error),
}

pub fn negotiate_and_greet(
    state: &mut ReceiverState,
    settings: &StreamSettings,
) -> Result<(), NegotiateError> {
    state.decompressor.algorithm = state.capabilities.select_compression();

    let sock = state
        .conn
        .make_blocking(Duration::from_secs(settings.receive_timeout_secs))
        .map_err(NegotiateError::Blocking)?;
    state.shared.register_socket(Arc::clone(&sock));

    if let Err(e) = sock.set_write_timeout(Some(Duration::from_secs(settings.send_timeout_secs))) {
        debug!(error = %e, "cannot set the send timeout on the stream socket");
    }

    // A short write here means the child never learned the negotiated
    // format; the connection is useless.
    let prompt = state.capabilities.initial_prompt();
    let mut writer: &std::net::TcpStream = &sock;
    writer
        .write_all(prompt.as_bytes())
        .map_err(NegotiateError::CantReply)?;
    Ok(())
}
