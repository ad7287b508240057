//! mio-based completion queue.
//!
//! Emulates completion semantics on top of readiness polling (epoll on
//! Linux, kqueue on macOS), so the same event loop runs where io_uring is
//! unavailable.

mod queue;

pub use queue::MioQueue;
