//! Completion queue abstraction.
//!
//! The event loop talks to the kernel only through [`CompletionQueue`]:
//! queue intents with `push`, flush them with `submit_all`, and collect
//! outcomes one at a time with `wait_for_completion`.
//!
//! Implementors:
//! - `UringQueue` (Linux): io_uring submission/completion rings.
//! - `MioQueue`: completions emulated over mio readiness polling.

use super::context::Token;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

/// An operation as handed to the queue.
///
/// Buffers are raw pointers because the kernel, not Rust, writes to them
/// while the operation is in flight.
#[derive(Debug, Clone, Copy)]
pub enum Submission {
    Accept {
        listener: RawFd,
    },
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: usize,
    },
    Write {
        fd: RawFd,
        buf: *const u8,
        len: usize,
    },
}

/// Outcome of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    /// Non-negative on success (new fd or byte count), `-errno` on failure.
    pub result: i32,
}

/// The submission queue has no free entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission queue full")
    }
}

impl std::error::Error for QueueFull {}

/// Kernel-style submission/completion queue.
///
/// **Contract:** only `wait_for_completion` may block.
pub trait CompletionQueue {
    /// Queue an operation. It is not started until [`submit_all`].
    ///
    /// Returns `Err(QueueFull)` if there is no room; nothing is queued in
    /// that case.
    ///
    /// # Safety
    /// Every buffer referenced by `submission` must stay valid, and must not
    /// be accessed, until the completion carrying `token` has been returned
    /// from [`wait_for_completion`].
    ///
    /// [`submit_all`]: CompletionQueue::submit_all
    /// [`wait_for_completion`]: CompletionQueue::wait_for_completion
    unsafe fn push(&mut self, token: Token, submission: Submission) -> Result<(), QueueFull>;

    /// Queue a best-effort cancellation of the operation carrying `target`.
    ///
    /// The target still produces exactly one completion (`-ECANCELED` if the
    /// cancellation won the race).
    fn push_cancel(&mut self, target: Token) -> Result<(), QueueFull>;

    /// Hand every queued operation to the kernel in one batch.
    ///
    /// Returns the number of operations submitted.
    fn submit_all(&mut self) -> io::Result<usize>;

    /// Block until one completion is available and return it.
    ///
    /// Returns `Ok(None)` when the queue's tick elapses without a completion,
    /// so the caller can check for shutdown.
    fn wait_for_completion(&mut self) -> io::Result<Option<Completion>>;

    /// Close a connection handle.
    fn close_handle(&mut self, fd: RawFd);
}
