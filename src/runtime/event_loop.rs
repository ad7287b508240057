//! Completion-driven event loop.
//!
//! Completion-based model: submit operations to the queue, block until one
//! completes, then dispatch it by the tag of its context. Each connection
//! runs accept -> read -> write -> close, advanced one completion at a time.
//!
//! There is no connection table. A connection exists only as the fd held
//! by whichever single context currently references it, so at most one
//! operation is ever outstanding per connection.

use super::context::{ContextStore, OpContext, OpKind, BUFFER_SIZE};
use super::queue::{Completion, CompletionQueue, QueueFull};
use crate::signal::Shutdown;
use bytes::Bytes;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long a shutdown waits for in-flight operations to finish.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters describing what the loop has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Accept operations submitted, including re-arms.
    pub accept_submissions: u64,
    /// Connections accepted.
    pub accepted: u64,
    /// Accept completions that failed.
    pub accept_errors: u64,
    /// Complete responses written.
    pub responses: u64,
    /// Writes that completed short and were resubmitted.
    pub partial_writes: u64,
    /// Connection handles closed.
    pub closed: u64,
    /// Operations dropped because the submission queue stayed full.
    pub queue_full: u64,
    /// Failed waits on the completion queue.
    pub wait_errors: u64,
    /// Contexts still live when the loop returned.
    pub leaked_contexts: u64,
}

/// Single-threaded server loop over a [`CompletionQueue`].
pub struct EventLoop<Q: CompletionQueue> {
    // Declared before `contexts` so the queue is torn down before any buffer
    // it may still reference.
    queue: Q,
    contexts: ContextStore,
    listener: RawFd,
    response: Bytes,
    accept_armed: bool,
    /// Set once shutdown starts.
    drain_deadline: Option<Instant>,
    drain_timeout: Duration,
    stats: LoopStats,
}

impl<Q: CompletionQueue> EventLoop<Q> {
    pub fn new(queue: Q, listener: RawFd, response: Bytes) -> Self {
        Self {
            queue,
            contexts: ContextStore::with_capacity(1024),
            listener,
            response,
            accept_armed: false,
            drain_deadline: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stats: LoopStats::default(),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Serve until `shutdown` is requested and in-flight work has drained.
    pub fn run(&mut self, shutdown: &Shutdown) -> LoopStats {
        self.arm_accept();

        while self.turn(shutdown) {}

        self.stats.leaked_contexts = self.outstanding() as u64;
        info!(
            accept_submissions = self.stats.accept_submissions,
            accepted = self.stats.accepted,
            accept_errors = self.stats.accept_errors,
            responses = self.stats.responses,
            closed = self.stats.closed,
            wait_errors = self.stats.wait_errors,
            contexts_allocated = self.contexts.allocated(),
            contexts_released = self.contexts.released(),
            leaked = self.stats.leaked_contexts,
            "Event loop stopped"
        );
        self.stats
    }

    /// One cycle: submit, wait, dispatch. Returns `false` once the loop
    /// should stop.
    fn turn(&mut self, shutdown: &Shutdown) -> bool {
        if self.drain_deadline.is_none() && shutdown.is_requested() {
            info!(outstanding = self.contexts.len(), "Shutdown requested, draining");
            self.begin_drain();
        }

        if let Some(deadline) = self.drain_deadline {
            if self.contexts.is_empty() {
                return false;
            }
            if Instant::now() >= deadline {
                warn!(
                    outstanding = self.contexts.len(),
                    "Drain timed out with operations still in flight"
                );
                return false;
            }
        } else if !self.accept_armed {
            // A previous re-arm was dropped on a full queue.
            self.arm_accept();
        }

        self.submit_all();

        if let Some(completion) = self.wait_for_completion() {
            self.dispatch(completion);
        }
        true
    }

    /// Flush every queued operation to the kernel in one batch.
    pub fn submit_all(&mut self) -> usize {
        match self.queue.submit_all() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Submit failed, will retry");
                0
            }
        }
    }

    /// Wait for the next completion. Failures are logged and retried by the
    /// caller's next iteration.
    pub fn wait_for_completion(&mut self) -> Option<Completion> {
        match self.queue.wait_for_completion() {
            Ok(completion) => completion,
            Err(e) => {
                self.stats.wait_errors += 1;
                if e.kind() == io::ErrorKind::Interrupted {
                    debug!("Completion wait interrupted");
                } else {
                    warn!(error = %e, "Completion wait failed, retrying");
                }
                None
            }
        }
    }

    /// Route a completion to the handler for its operation kind.
    ///
    /// The context leaves the store here; whichever handler receives it
    /// either submits exactly one follow-up operation or closes the handle.
    pub fn dispatch(&mut self, completion: Completion) {
        let Completion { token, result } = completion;

        let context = match self.contexts.release(token) {
            Some(context) => context,
            None => {
                warn!(?token, result, "Completion for unknown operation");
                return;
            }
        };

        match context {
            OpContext::Accept { listener } => self.handle_accept(result, listener),
            OpContext::Read { fd, buf } => self.handle_read(result, fd, &buf),
            OpContext::Write {
                fd,
                response,
                written,
            } => self.handle_write(result, fd, response, written),
        }
    }

    /// Counters so far.
    #[cfg(test)]
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Operations currently in flight.
    pub fn outstanding(&self) -> usize {
        self.contexts.len()
    }

    fn handle_accept(&mut self, result: i32, listener: RawFd) {
        self.accept_armed = false;

        // Always re-arm accept
        if !self.draining() {
            self.arm_accept();
        }

        if result < 0 {
            self.stats.accept_errors += 1;
            let err = io::Error::from_raw_os_error(-result);
            if result == -libc::ECANCELED {
                debug!("Accept cancelled");
            } else {
                warn!(listener, error = %err, "Accept failed");
            }
            return;
        }

        let client_fd = result;
        self.stats.accepted += 1;

        if self.draining() {
            debug!(fd = client_fd, "Accepted during shutdown, closing");
            self.close(client_fd);
            return;
        }

        debug!(fd = client_fd, "Accepted connection");
        self.submit(OpContext::read(client_fd));
    }

    fn handle_read(&mut self, result: i32, fd: RawFd, buf: &[u8; BUFFER_SIZE]) {
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(fd, error = %err, "Read error");
            } else {
                debug!(fd, "Connection closed by peer");
            }
            self.close(fd);
            return;
        }

        let n = result as usize;
        trace!(fd, bytes = n, request = %String::from_utf8_lossy(&buf[..n]), "Read request");

        self.submit(OpContext::write(fd, self.response.clone(), 0));
    }

    fn handle_write(&mut self, result: i32, fd: RawFd, response: Bytes, written: usize) {
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(fd, error = %err, "Write error");
            } else {
                debug!(fd, "Write made no progress");
            }
            self.close(fd);
            return;
        }

        let written = written + result as usize;
        if written < response.len() {
            self.stats.partial_writes += 1;
            debug!(fd, written, total = response.len(), "Partial write, continuing");
            self.submit(OpContext::write(fd, response, written));
            return;
        }

        self.stats.responses += 1;
        debug!(fd, bytes = written, "Response sent");
        self.close(fd);
    }

    fn arm_accept(&mut self) {
        if self.submit(OpContext::accept(self.listener)) {
            self.accept_armed = true;
        }
    }

    /// Take ownership of `context` and queue its operation.
    ///
    /// If the queue is full, already queued entries are flushed and the push
    /// is retried once. Should that fail too, the operation is dropped: its
    /// context is released and a connection handle it carried is closed.
    fn submit(&mut self, mut context: OpContext) -> bool {
        let kind = context.kind();
        let submission = context.submission();
        let token = self.contexts.insert(context);

        // SAFETY: the buffers behind `submission` are owned by the context
        // just stored under `token`; it is only released when the queue
        // returns that token's completion.
        let pushed = match unsafe { self.queue.push(token, submission) } {
            Ok(()) => Ok(()),
            Err(QueueFull) => {
                self.submit_all();
                unsafe { self.queue.push(token, submission) }
            }
        };

        match pushed {
            Ok(()) => {
                if kind == OpKind::Accept {
                    self.stats.accept_submissions += 1;
                }
                trace!(?token, ?kind, "Queued operation");
                true
            }
            Err(e) => {
                self.stats.queue_full += 1;
                warn!(?kind, error = %e, "Dropping operation");
                if let Some(context) = self.contexts.release(token) {
                    if kind != OpKind::Accept {
                        self.close(context.fd());
                    }
                }
                false
            }
        }
    }

    /// Stop accepting and cancel everything that waits on a peer.
    ///
    /// Writes are left to finish so responses already underway are delivered.
    fn begin_drain(&mut self) {
        self.drain_deadline = Some(Instant::now() + self.drain_timeout);

        for token in self.contexts.tokens() {
            let waits_on_peer = matches!(
                self.contexts.get(token).map(OpContext::kind),
                Some(OpKind::Accept) | Some(OpKind::Read)
            );
            if !waits_on_peer {
                continue;
            }

            let pushed = match self.queue.push_cancel(token) {
                Ok(()) => Ok(()),
                Err(QueueFull) => {
                    self.submit_all();
                    self.queue.push_cancel(token)
                }
            };
            if let Err(e) = pushed {
                warn!(?token, error = %e, "Could not queue cancellation");
            }
        }
    }

    fn draining(&self) -> bool {
        self.drain_deadline.is_some()
    }

    fn close(&mut self, fd: RawFd) {
        self.queue.close_handle(fd);
        self.stats.closed += 1;
    }
}
