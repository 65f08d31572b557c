//! Direct-path byte pump
//!
//! Shuttles bytes between the client session and a directly dialed target
//! socket: one pipe per direction over 32 KiB buffers. The two pipes share
//! a bounded write-retry budget, rendezvous on termination (the first
//! message to arrive becomes the forwarder's result), and half-close their
//! own write side before the sockets are fully released.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::session::Session;

/// Per-direction relay buffer size
pub const PIPE_BUF_SIZE: usize = 32 * 1024;

/// Combined write-failure budget across both directions
pub const MAX_WRITE_RETRIES: u32 = 3;

/// Done message published when the session's close signal ends a pipe
pub const CLOSE_SIGNAL_DONE: &str = "SkConn closed";

/// Whether a forwarder done message describes a graceful termination
///
/// Empty messages, EOF terminations, and close-signal terminations are
/// graceful; anything else carries an error cause.
#[must_use]
pub fn is_graceful_done(message: &str) -> bool {
    message.is_empty() || message.contains("EOF") || message == CLOSE_SIGNAL_DONE
}

/// Write-failure budget shared by both pipe directions
///
/// Each direction increments its own slot on a failed write and resets it
/// on success; a pipe terminates once the combined count reaches the
/// budget. A successful write in one direction therefore restores budget
/// headroom to the other.
pub(crate) struct RetryBudget {
    slots: [AtomicU32; 2],
}

pub(crate) const DIR_UPLINK: usize = 0;
pub(crate) const DIR_DOWNLINK: usize = 1;

impl RetryBudget {
    pub(crate) fn new() -> Self {
        Self {
            slots: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Record a failed write; returns true when the budget is exhausted
    pub(crate) fn record_failure(&self, dir: usize) -> bool {
        self.slots[dir].fetch_add(1, Ordering::AcqRel);
        self.combined() >= MAX_WRITE_RETRIES
    }

    /// Record a successful write, resetting this direction's count
    pub(crate) fn record_success(&self, dir: usize) {
        self.slots[dir].store(0, Ordering::Release);
    }

    fn combined(&self) -> u32 {
        self.slots[DIR_UPLINK].load(Ordering::Acquire)
            + self.slots[DIR_DOWNLINK].load(Ordering::Acquire)
    }
}

/// Two-pipe forwarder for a directly dialed session
pub struct DirectForwarder {
    session: Arc<Session>,
    target: TcpStream,
}

impl DirectForwarder {
    /// Create a forwarder over the session and its dialed target socket
    #[must_use]
    pub fn new(session: Arc<Session>, target: TcpStream) -> Self {
        debug!(short_id = %session.short_id(), "direct forwarder created");
        Self { session, target }
    }

    /// Pump both directions until termination
    ///
    /// Returns the first pipe's done message. Both pipes have stopped and
    /// FIN has been sent on both write sides by the time this returns; the
    /// sockets close fully when their last references drop.
    pub async fn run(self) -> String {
        let Self { session, target } = self;
        debug!(short_id = %session.short_id(), "direct forwarder start");

        let (target_read, target_write) = target.into_split();
        let budget = Arc::new(RetryBudget::new());
        let (done_tx, mut done_rx) = mpsc::channel::<String>(2);

        let uplink = tokio::spawn(uplink_pipe(
            Arc::clone(&session),
            target_write,
            Arc::clone(&budget),
            done_tx.clone(),
        ));
        let downlink = tokio::spawn(downlink_pipe(
            Arc::clone(&session),
            target_read,
            budget,
            done_tx,
        ));

        // First terminator wins; its message becomes the composite result.
        let first = done_rx.recv().await.unwrap_or_default();

        // Both write sides have been (or are about to be) FIN'd by their
        // owning pipes; drain both before reporting.
        let _ = uplink.await;
        let _ = downlink.await;

        debug!(short_id = %session.short_id(), done = %first, "direct forwarder done");
        first
    }
}

/// client → target pipe
async fn uplink_pipe(
    session: Arc<Session>,
    mut target_write: OwnedWriteHalf,
    budget: Arc<RetryBudget>,
    done_tx: mpsc::Sender<String>,
) {
    let short_id = session.short_id().to_owned();
    let mut buf = vec![0u8; PIPE_BUF_SIZE];
    let mut close_rx = session.close_signal();

    let message = 'pipe: loop {
        let n = tokio::select! {
            biased;
            _ = close_rx.wait_for(|closed| *closed) => {
                debug!(short_id = %short_id, "uplink ended by close signal");
                break 'pipe CLOSE_SIGNAL_DONE.to_owned();
            }
            result = session.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(short_id = %short_id, "uplink read EOF");
                    break 'pipe "read local EOF".to_owned();
                }
                Ok(n) => n,
                Err(e) => {
                    error!(short_id = %short_id, error = %e, "uplink read error");
                    break 'pipe format!("read from local error: {e}");
                }
            },
        };

        // Resend only the unwritten remainder after a short write; bytes
        // already on the wire are never repeated.
        let mut written = 0;
        while written < n {
            match target_write.write(&buf[written..n]).await {
                Ok(0) => {
                    error!(short_id = %short_id, "uplink wrote zero bytes");
                    if budget.record_failure(DIR_UPLINK) {
                        break 'pipe "write to remote error: write zero bytes".to_owned();
                    }
                }
                Ok(wn) => {
                    budget.record_success(DIR_UPLINK);
                    written += wn;
                }
                Err(e) => {
                    error!(short_id = %short_id, error = %e, "uplink write error");
                    if budget.record_failure(DIR_UPLINK) {
                        break 'pipe format!("write to remote error: {e}");
                    }
                }
            }
        }
    };

    // Flush FIN toward the target before the socket is released.
    let _ = target_write.shutdown().await;
    let _ = done_tx.send(message).await;
}

/// target → client pipe
async fn downlink_pipe(
    session: Arc<Session>,
    mut target_read: OwnedReadHalf,
    budget: Arc<RetryBudget>,
    done_tx: mpsc::Sender<String>,
) {
    let short_id = session.short_id().to_owned();
    let mut buf = vec![0u8; PIPE_BUF_SIZE];
    let mut close_rx = session.close_signal();

    let message = 'pipe: loop {
        let n = tokio::select! {
            biased;
            _ = close_rx.wait_for(|closed| *closed) => {
                debug!(short_id = %short_id, "downlink ended by close signal");
                break 'pipe CLOSE_SIGNAL_DONE.to_owned();
            }
            result = target_read.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(short_id = %short_id, "downlink read EOF");
                    break 'pipe "read remote EOF".to_owned();
                }
                Ok(n) => n,
                Err(e) => {
                    error!(short_id = %short_id, error = %e, "downlink read error");
                    break 'pipe format!("read from remote error: {e}");
                }
            },
        };

        let mut written = 0;
        while written < n {
            match session.write_some(&buf[written..n]).await {
                Ok(0) => {
                    error!(short_id = %short_id, "downlink wrote zero bytes");
                    if budget.record_failure(DIR_DOWNLINK) {
                        break 'pipe "write to local error: write zero bytes".to_owned();
                    }
                }
                Ok(wn) => {
                    budget.record_success(DIR_DOWNLINK);
                    written += wn;
                }
                Err(e) => {
                    error!(short_id = %short_id, error = %e, "downlink write error");
                    if budget.record_failure(DIR_DOWNLINK) {
                        break 'pipe format!("write to local error: {e}");
                    }
                }
            }
        }
    };

    // FIN toward the client; the read side stays open for the uplink.
    session.shutdown_write().await;
    let _ = done_tx.send(message).await;
}
