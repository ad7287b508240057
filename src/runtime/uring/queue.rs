//! io_uring completion queue.
//!
//! Operations are pushed onto the submission ring and handed to the kernel
//! in one `io_uring_enter` per loop cycle. Each entry's user_data is the
//! token of its context, so a completion identifies its own context.
//!
//! Besides context operations the ring carries a few queue-internal entries
//! (tick timeout, link timeouts, cancellations). Their user_data is a
//! reserved token and their completions never reach the event loop.

use crate::runtime::context::Token;
use crate::runtime::queue::{Completion, CompletionQueue, QueueFull, Submission};
use io_uring::squeue::Flags;
use io_uring::{opcode, types, IoUring};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::debug;

/// Wakes a blocked wait so the loop can check for shutdown.
const TICK: Token = Token::reserved(1);
/// Deadline linked to a read when an idle timeout is configured.
const READ_TIMEOUT: Token = Token::reserved(2);
/// Completion of an `AsyncCancel` request itself.
const CANCEL: Token = Token::reserved(3);

/// Floor for completion ring entries. Every in-flight read can complete in
/// the same cycle, so this is sized for connections, not for one batch.
const MIN_CQ_ENTRIES: u32 = 4096;

/// A read with an idle timeout occupies two entries (Recv + LinkTimeout).
const MIN_SQ_ENTRIES: u32 = 2;

/// io_uring-backed [`CompletionQueue`].
pub struct UringQueue {
    ring: IoUring,
    // Boxed so the kernel-visible address survives moves of the queue.
    tick: Box<types::Timespec>,
    tick_armed: bool,
    read_timeout: Option<Box<types::Timespec>>,
}

impl UringQueue {
    /// Create a ring with `entries` submission slots (at least two).
    ///
    /// `tick` bounds how long a single wait may block; `read_timeout`, if
    /// set, cancels reads that take longer.
    pub fn new(entries: u32, tick: Duration, read_timeout: Option<Duration>) -> io::Result<Self> {
        let entries = entries.max(MIN_SQ_ENTRIES);
        let ring = IoUring::builder()
            .setup_cqsize(entries.saturating_mul(2).max(MIN_CQ_ENTRIES))
            .build(entries)?;

        debug!(
            sq_entries = ring.params().sq_entries(),
            cq_entries = ring.params().cq_entries(),
            "io_uring created"
        );

        Ok(Self {
            ring,
            tick: Box::new(timespec(tick)),
            tick_armed: false,
            read_timeout: read_timeout.map(|d| Box::new(timespec(d))),
        })
    }

    /// Pop the next completion that belongs to the event loop.
    fn next_completion(&mut self) -> Option<Completion> {
        let mut cq = self.ring.completion();

        for cqe in &mut cq {
            let token = Token::from_raw(cqe.user_data());
            if token == TICK {
                self.tick_armed = false;
                continue;
            }
            if token.is_reserved() {
                continue;
            }
            return Some(Completion {
                token,
                result: cqe.result(),
            });
        }

        None
    }

    fn arm_tick(&mut self) {
        if self.tick_armed {
            return;
        }

        let tick = opcode::Timeout::new(&*self.tick as *const types::Timespec)
            .build()
            .user_data(TICK.raw());

        // SAFETY: `self.tick` is heap allocated and outlives the ring entry.
        // A full ring simply means no tick this round.
        if unsafe { self.ring.submission().push(&tick) }.is_ok() {
            self.tick_armed = true;
        }
    }
}

impl CompletionQueue for UringQueue {
    unsafe fn push(&mut self, token: Token, submission: Submission) -> Result<(), QueueFull> {
        let user_data = token.raw();

        match submission {
            Submission::Accept { listener } => {
                let accept = opcode::Accept::new(
                    types::Fd(listener),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
                .build()
                .user_data(user_data);

                self.ring.submission().push(&accept).map_err(|_| QueueFull)
            }
            Submission::Read { fd, buf, len } => {
                let recv = opcode::Recv::new(types::Fd(fd), buf, len as u32);

                match self.read_timeout.as_deref() {
                    Some(timeout) => {
                        let recv = recv.build().flags(Flags::IO_LINK).user_data(user_data);
                        let deadline = opcode::LinkTimeout::new(timeout as *const types::Timespec)
                            .build()
                            .user_data(READ_TIMEOUT.raw());

                        // Both entries or neither, so the link is never split.
                        self.ring
                            .submission()
                            .push_multiple(&[recv, deadline])
                            .map_err(|_| QueueFull)
                    }
                    None => {
                        let recv = recv.build().user_data(user_data);
                        self.ring.submission().push(&recv).map_err(|_| QueueFull)
                    }
                }
            }
            Submission::Write { fd, buf, len } => {
                let send = opcode::Send::new(types::Fd(fd), buf, len as u32)
                    .build()
                    .user_data(user_data);

                self.ring.submission().push(&send).map_err(|_| QueueFull)
            }
        }
    }

    fn push_cancel(&mut self, target: Token) -> Result<(), QueueFull> {
        let cancel = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(CANCEL.raw());

        // SAFETY: a cancel request references no memory.
        unsafe { self.ring.submission().push(&cancel) }.map_err(|_| QueueFull)
    }

    fn submit_all(&mut self) -> io::Result<usize> {
        self.ring.submit()
    }

    fn wait_for_completion(&mut self) -> io::Result<Option<Completion>> {
        if let Some(completion) = self.next_completion() {
            return Ok(Some(completion));
        }

        self.arm_tick();
        self.ring.submit_and_wait(1)?;

        Ok(self.next_completion())
    }

    fn close_handle(&mut self, fd: RawFd) {
        // SAFETY: `fd` came from an accept completion and no operation on it
        // is still in flight; the event loop closes each handle once.
        if unsafe { libc::close(fd) } != 0 {
            debug!(fd, error = %io::Error::last_os_error(), "Close failed");
        }
    }
}

fn timespec(d: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(d.as_secs())
        .nsec(d.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::{ContextStore, OpContext};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    /// io_uring may be disabled by the kernel or a seccomp profile.
    fn ring_or_skip(tick: Duration, read_timeout: Option<Duration>) -> Option<UringQueue> {
        ring_or_skip_with(64, tick, read_timeout)
    }

    fn ring_or_skip_with(
        entries: u32,
        tick: Duration,
        read_timeout: Option<Duration>,
    ) -> Option<UringQueue> {
        match UringQueue::new(entries, tick, read_timeout) {
            Ok(queue) => Some(queue),
            Err(e) => {
                eprintln!("skipping io_uring test: {}", e);
                None
            }
        }
    }

    fn wait_one(queue: &mut UringQueue) -> Completion {
        queue.submit_all().unwrap();
        for _ in 0..100 {
            if let Some(c) = queue.wait_for_completion().unwrap() {
                return c;
            }
        }
        panic!("no completion");
    }

    #[test]
    fn test_tick_wakes_idle_wait() {
        let Some(mut queue) = ring_or_skip(Duration::from_millis(20), None) else {
            return;
        };

        let start = std::time::Instant::now();
        assert!(queue.wait_for_completion().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_accept_read_write_roundtrip() {
        let Some(mut queue) = ring_or_skip(Duration::from_millis(50), None) else {
            return;
        };
        let mut store = ContextStore::with_capacity(4);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut accept = OpContext::accept(listener.as_raw_fd());
        let sub = accept.submission();
        let token = store.insert(accept);
        unsafe { queue.push(token, sub).unwrap() };

        let mut client = TcpStream::connect(addr).unwrap();
        let c = wait_one(&mut queue);
        assert_eq!(c.token, token);
        assert!(c.result >= 0, "accept failed: {}", c.result);
        store.release(token);
        let fd = c.result;

        client.write_all(b"hi").unwrap();
        let mut read = OpContext::read(fd);
        let sub = read.submission();
        let token = store.insert(read);
        unsafe { queue.push(token, sub).unwrap() };
        let c = wait_one(&mut queue);
        assert_eq!(c.token, token);
        assert_eq!(c.result, 2);
        match store.release(token) {
            Some(OpContext::Read { buf, .. }) => assert_eq!(&buf[..2], b"hi"),
            other => panic!("unexpected: {:?}", other),
        }

        let mut write = OpContext::write(fd, bytes::Bytes::from_static(b"ok"), 0);
        let sub = write.submission();
        let token = store.insert(write);
        unsafe { queue.push(token, sub).unwrap() };
        let c = wait_one(&mut queue);
        assert_eq!(c.result, 2);
        store.release(token);

        queue.close_handle(fd);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"ok");
    }

    #[test]
    fn test_cancel_pending_read() {
        let Some(mut queue) = ring_or_skip(Duration::from_millis(50), None) else {
            return;
        };
        let mut store = ContextStore::with_capacity(2);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let fd = server.into_raw_fd();

        let mut read = OpContext::read(fd);
        let sub = read.submission();
        let token = store.insert(read);
        unsafe { queue.push(token, sub).unwrap() };
        queue.submit_all().unwrap();

        queue.push_cancel(token).unwrap();
        let c = wait_one(&mut queue);
        assert_eq!(c.token, token);
        assert_eq!(c.result, -libc::ECANCELED);
        store.release(token);
        queue.close_handle(fd);
    }

    #[test]
    fn test_read_timeout_cancels_idle_read() {
        let Some(mut queue) = ring_or_skip(Duration::from_millis(50), Some(Duration::from_millis(30)))
        else {
            return;
        };
        let mut store = ContextStore::with_capacity(2);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let fd = server.into_raw_fd();

        let mut read = OpContext::read(fd);
        let sub = read.submission();
        let token = store.insert(read);
        unsafe { queue.push(token, sub).unwrap() };

        let c = wait_one(&mut queue);
        assert_eq!(c.token, token);
        assert_eq!(c.result, -libc::ECANCELED);
        store.release(token);
        queue.close_handle(fd);
    }

    #[test]
    fn test_single_entry_ring_fits_timed_read() {
        let Some(mut queue) = ring_or_skip_with(1, Duration::from_millis(20), Some(Duration::from_secs(1)))
        else {
            return;
        };
        assert!(queue.ring.params().sq_entries() >= 2);

        let mut store = ContextStore::with_capacity(2);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let fd = server.into_raw_fd();

        let mut read = OpContext::read(fd);
        let sub = read.submission();
        let token = store.insert(read);
        assert!(unsafe { queue.push(token, sub) }.is_ok());

        client.write_all(b"ping").unwrap();
        let c = wait_one(&mut queue);
        assert_eq!(c, Completion { token, result: 4 });
        store.release(token);
        queue.close_handle(fd);
    }

    #[test]
    fn test_failed_close_is_not_fatal() {
        let Some(mut queue) = ring_or_skip(Duration::from_millis(20), None) else {
            return;
        };

        // EBADF is logged and swallowed.
        queue.close_handle(-1);
        assert!(queue.wait_for_completion().unwrap().is_none());
    }

    #[test]
    fn test_queue_full_is_reported() {
        let Some(mut queue) = ring_or_skip(Duration::from_millis(50), None) else {
            return;
        };
        let entries = queue.ring.params().sq_entries() as usize;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sub = Submission::Accept {
            listener: listener.as_raw_fd(),
        };

        let mut pushed = 0;
        let full = loop {
            match unsafe { queue.push(Token::reserved(9), sub) } {
                Ok(()) => pushed += 1,
                Err(e) => break e,
            }
            assert!(pushed <= entries, "ring accepted more than its size");
        };
        assert_eq!(full, QueueFull);
        assert_eq!(pushed, entries);
        // Reserved tokens: these accepts never reach a context. Dropping the
        // ring cancels them.
    }
}
