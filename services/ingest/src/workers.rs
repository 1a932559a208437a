//! Streaming worker pool and the handoff queue.
//!
//! Each worker is a dedicated OS thread draining its own queue. Enqueue is
//! the ownership transfer: after it, the acceptance flow never touches the
//! receiver again. The channel provides the release/acquire edge between
//! the producing acceptance task and the consuming worker.

use crate::receiver::ReceiverState;
use crate::registry::Host;
use crate::socket::StreamConn;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use stream_protocol::ExitReason;
use tokio::sync::mpsc;
use tracing::{debug, info};

const QUEUE_DEPTH: usize = 64;

/// A receiver bound to its host, ready for the streaming loop.
pub struct BoundReceiver {
    pub state: ReceiverState,
    pub host: Arc<Host>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("the streaming worker queue is gone")]
    QueueClosed,
}

pub struct StreamWorkers {
    queues: Vec<mpsc::Sender<BoundReceiver>>,
    next: AtomicUsize,
}

impl StreamWorkers {
    /// Spawn `count` worker threads (at least one), each with its own queue.
    pub fn start(count: usize) -> Self {
        let count = count.max(1);
        let mut queues = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, rx) = mpsc::channel::<BoundReceiver>(QUEUE_DEPTH);
            thread::Builder::new()
                .name(format!("stream-rx-{i}"))
                .spawn(move || worker_loop(rx))
                .expect("failed to spawn a streaming worker thread");
            queues.push(tx);
        }
        Self {
            queues,
            next: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Round-robin a bound receiver onto a worker queue. Blocking; must not
    /// be called from the async runtime directly.
    ///
    /// An undeliverable receiver is torn down here: detached from its host,
    /// closed, and marked exited, so nothing waits on it.
    pub fn enqueue(&self, bound: BoundReceiver) -> Result<(), HandoffError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        match self.queues[idx].blocking_send(bound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(bound)) => {
                let BoundReceiver { mut state, host } = bound;
                state.shared.set_exit_reason(ExitReason::Shutdown);
                host.detach_receiver(&state.shared);
                state.conn.close();
                state.shared.mark_exited();
                Err(HandoffError::QueueClosed)
            }
        }
    }
}

fn worker_loop(mut rx: mpsc::Receiver<BoundReceiver>) {
    while let Some(bound) = rx.blocking_recv() {
        run_receiver(bound);
    }
}

/// The streaming loop for one receiver: chunked reads under the receive
/// timeout, liveness updates, cooperative stop. Decoding the frames is the
/// downstream decoder's job; this loop owns the socket and the lifecycle.
fn run_receiver(bound: BoundReceiver) {
    let BoundReceiver { mut state, host } = bound;
    let shared = Arc::clone(&state.shared);

    let sock = match &state.conn {
        StreamConn::Blocking(sock) => Some(Arc::clone(sock)),
        _ => None,
    };
    match sock {
        None => shared.set_exit_reason(ExitReason::SocketError),
        Some(sock) => loop {
            if shared.should_stop() {
                shared.set_exit_reason(ExitReason::Shutdown);
                break;
            }
            let mut reader: &std::net::TcpStream = &sock;
            match reader.read(&mut state.decompressor.buffer) {
                Ok(0) => {
                    shared.set_exit_reason(ExitReason::SocketClosed);
                    break;
                }
                Ok(n) => {
                    shared.touch();
                    debug!(
                        hostname = %state.hostname,
                        bytes = n,
                        "stream chunk received"
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    shared.set_exit_reason(ExitReason::Timeout);
                    break;
                }
                Err(_) => {
                    shared.set_exit_reason(ExitReason::SocketError);
                    break;
                }
            }
        },
    }

    let reason = shared.exit_reason().unwrap_or(ExitReason::SocketClosed);
    host.detach_receiver(&shared);
    state.conn.close();
    shared.mark_exited();
    info!(
        client_ip = %state.client_ip,
        client_port = %state.client_port,
        hostname = %state.hostname,
        reason = %reason,
        "receiver disconnected"
    );
}
