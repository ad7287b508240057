//! Completion queue emulated over mio readiness polling.
//!
//! Readiness-based model underneath: poll tells us when sockets are ready,
//! then the pending operation is retried with a non-blocking syscall. To
//! the event loop this looks exactly like a completion queue: operations are
//! pushed, submitted in a batch and finish one completion at a time.
//!
//! Every operation is attempted once at submission. Registrations are
//! edge-triggered, so anything that would block then is retried only when a
//! later readiness event names its socket.

use crate::runtime::context::Token;
use crate::runtime::queue::{Completion, CompletionQueue, QueueFull, Submission};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const LISTENER_TOKEN: mio::Token = mio::Token(usize::MAX);

/// An operation handed to the queue and not yet completed.
struct Pending {
    token: Token,
    submission: Submission,
    /// Reads only, when a read timeout is configured.
    deadline: Option<Instant>,
}

impl Pending {
    /// The poll token whose readiness can make progress on this operation.
    fn source(&self) -> mio::Token {
        match self.submission {
            Submission::Accept { .. } => LISTENER_TOKEN,
            Submission::Read { fd, .. } | Submission::Write { fd, .. } => mio::Token(fd as usize),
        }
    }
}

/// mio-backed [`CompletionQueue`].
pub struct MioQueue {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    listener_fd: RawFd,
    /// Open connections, keyed by the fd handed to the event loop.
    streams: HashMap<RawFd, TcpStream>,
    capacity: usize,
    queued: Vec<Pending>,
    in_flight: Vec<Pending>,
    ready: VecDeque<Completion>,
    tick: Duration,
    read_timeout: Option<Duration>,
}

impl MioQueue {
    /// Create a queue serving accepts on `listener`.
    ///
    /// At most `capacity` operations may be pushed between two submits.
    pub fn new(
        listener: &std::net::TcpListener,
        capacity: usize,
        tick: Duration,
        read_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener_fd = listener.as_raw_fd();
        let own = listener.try_clone()?;
        own.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(own);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(64)),
            listener,
            listener_fd,
            streams: HashMap::new(),
            capacity,
            queued: Vec::with_capacity(capacity),
            in_flight: Vec::new(),
            ready: VecDeque::new(),
            tick,
            read_timeout,
        })
    }

    /// Try to finish an operation without blocking.
    ///
    /// Returns `None` if it would block, otherwise the completion result.
    fn attempt(&mut self, submission: Submission) -> Option<i32> {
        match submission {
            Submission::Accept { listener } => {
                debug_assert_eq!(listener, self.listener_fd, "accept on foreign listener");
                self.attempt_accept()
            }
            Submission::Read { fd, buf, len } => {
                let mut stream = match self.streams.get(&fd) {
                    Some(stream) => stream,
                    None => return Some(-libc::EBADF),
                };
                // SAFETY: `push` requires the buffer to stay valid and
                // untouched until this operation completes.
                let buf = unsafe { std::slice::from_raw_parts_mut(buf, len) };
                retry(|| stream.read(buf))
            }
            Submission::Write { fd, buf, len } => {
                let mut stream = match self.streams.get(&fd) {
                    Some(stream) => stream,
                    None => return Some(-libc::EBADF),
                };
                // SAFETY: as above.
                let buf = unsafe { std::slice::from_raw_parts(buf, len) };
                retry(|| stream.write(buf))
            }
        }
    }

    fn attempt_accept(&mut self) -> Option<i32> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let fd = stream.as_raw_fd();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        mio::Token(fd as usize),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(fd, error = %e, "Failed to register connection");
                        return Some(neg_errno(&e));
                    }
                    trace!(fd, peer = %peer, "Accepted");
                    self.streams.insert(fd, stream);
                    return Some(fd);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(neg_errno(&e)),
            }
        }
    }

    /// Retry operations whose socket became ready and expire overdue reads.
    fn progress(&mut self, woken: &HashSet<mio::Token>, now: Instant) {
        for pending in std::mem::take(&mut self.in_flight) {
            if woken.contains(&pending.source()) {
                if let Some(result) = self.attempt(pending.submission) {
                    self.ready.push_back(Completion {
                        token: pending.token,
                        result,
                    });
                    continue;
                }
            }

            if pending.deadline.map_or(false, |deadline| deadline <= now) {
                trace!(token = ?pending.token, "Read timed out");
                self.ready.push_back(Completion {
                    token: pending.token,
                    result: -libc::ECANCELED,
                });
                continue;
            }

            self.in_flight.push(pending);
        }
    }

    /// How long the next poll may block.
    fn poll_timeout(&self, now: Instant) -> Duration {
        self.in_flight
            .iter()
            .filter_map(|pending| pending.deadline)
            .min()
            .map_or(self.tick, |deadline| {
                deadline.saturating_duration_since(now).min(self.tick)
            })
    }
}

impl CompletionQueue for MioQueue {
    unsafe fn push(&mut self, token: Token, submission: Submission) -> Result<(), QueueFull> {
        if self.queued.len() >= self.capacity {
            return Err(QueueFull);
        }

        let deadline = match submission {
            Submission::Read { .. } => self.read_timeout.map(|t| Instant::now() + t),
            _ => None,
        };

        self.queued.push(Pending {
            token,
            submission,
            deadline,
        });
        Ok(())
    }

    fn push_cancel(&mut self, target: Token) -> Result<(), QueueFull> {
        let found = [&mut self.queued, &mut self.in_flight]
            .into_iter()
            .find_map(|list| {
                let pos = list.iter().position(|p| p.token == target)?;
                Some(list.remove(pos))
            });

        if let Some(pending) = found {
            self.ready.push_back(Completion {
                token: pending.token,
                result: -libc::ECANCELED,
            });
        }
        Ok(())
    }

    fn submit_all(&mut self) -> io::Result<usize> {
        let queued = std::mem::take(&mut self.queued);
        let submitted = queued.len();

        for pending in queued {
            match self.attempt(pending.submission) {
                Some(result) => self.ready.push_back(Completion {
                    token: pending.token,
                    result,
                }),
                None => self.in_flight.push(pending),
            }
        }

        Ok(submitted)
    }

    fn wait_for_completion(&mut self) -> io::Result<Option<Completion>> {
        if let Some(completion) = self.ready.pop_front() {
            return Ok(Some(completion));
        }

        let timeout = self.poll_timeout(Instant::now());
        self.poll.poll(&mut self.events, Some(timeout))?;

        let woken: HashSet<mio::Token> = self.events.iter().map(|event| event.token()).collect();
        self.progress(&woken, Instant::now());

        Ok(self.ready.pop_front())
    }

    fn close_handle(&mut self, fd: RawFd) {
        match self.streams.remove(&fd) {
            Some(mut stream) => {
                if let Err(e) = self.poll.registry().deregister(&mut stream) {
                    debug!(fd, error = %e, "Deregister failed");
                }
                // Dropping the stream closes the descriptor.
            }
            None => warn!(fd, "Close of unknown handle"),
        }
    }
}

/// Run a non-blocking syscall, retrying on EINTR.
fn retry(mut op: impl FnMut() -> io::Result<usize>) -> Option<i32> {
    loop {
        match op() {
            Ok(n) => return Some(n as i32),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Some(neg_errno(&e)),
        }
    }
}

fn neg_errno(e: &io::Error) -> i32 {
    -e.raw_os_error().unwrap_or(libc::EIO)
}
