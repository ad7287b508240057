//! Linux io_uring backend.
//!
//! Completion-based I/O with batched submissions: the kernel performs each
//! accept, recv and send asynchronously and reports back through the
//! completion ring.

mod queue;

pub use queue::UringQueue;
