//! Operation contexts and the store that owns them while they are in flight.
//!
//! Every submitted operation gets a context describing what it is (accept,
//! read, write) and holding whatever memory the kernel needs for it. The
//! context is inserted when the operation is submitted and removed exactly
//! once, when its completion is dispatched. Its token (io_uring user_data)
//! encodes the slab slot plus a generation so a stale or duplicated
//! completion can never resolve to a newer context that reused the slot.

use super::queue::Submission;
use bytes::Bytes;
use slab::Slab;
use std::fmt;
use std::os::unix::io::RawFd;

/// Size of the buffer each read is given.
pub const BUFFER_SIZE: usize = 4096;

/// Slot value never handed out by the store; used for queue-internal
/// operations such as timeouts and cancellations.
const RESERVED_SLOT: u32 = u32::MAX;

/// Identifies one in-flight operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    fn new(slot: u32, generation: u32) -> Self {
        Token(((generation as u64) << 32) | slot as u64)
    }

    /// A token the store will never allocate, tagged with `tag`.
    pub const fn reserved(tag: u32) -> Self {
        Token(((tag as u64) << 32) | RESERVED_SLOT as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_reserved(self) -> bool {
        self.slot() == RESERVED_SLOT
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}:{})", self.slot(), self.generation())
    }
}

/// Kind of an operation, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Read,
    Write,
}

/// One in-flight operation and the resources it owns.
pub enum OpContext {
    /// Accept on the listening socket.
    Accept { listener: RawFd },
    /// Read from a connection into `buf`.
    Read {
        fd: RawFd,
        buf: Box<[u8; BUFFER_SIZE]>,
    },
    /// Write `response[written..]` to a connection.
    Write {
        fd: RawFd,
        response: Bytes,
        written: usize,
    },
}

impl OpContext {
    pub fn accept(listener: RawFd) -> Self {
        OpContext::Accept { listener }
    }

    pub fn read(fd: RawFd) -> Self {
        OpContext::Read {
            fd,
            buf: Box::new([0u8; BUFFER_SIZE]),
        }
    }

    pub fn write(fd: RawFd, response: Bytes, written: usize) -> Self {
        OpContext::Write {
            fd,
            response,
            written,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            OpContext::Accept { .. } => OpKind::Accept,
            OpContext::Read { .. } => OpKind::Read,
            OpContext::Write { .. } => OpKind::Write,
        }
    }

    /// The descriptor this operation targets.
    pub fn fd(&self) -> RawFd {
        match self {
            OpContext::Accept { listener } => *listener,
            OpContext::Read { fd, .. } | OpContext::Write { fd, .. } => *fd,
        }
    }

    /// Describe this operation to a completion queue.
    ///
    /// The pointers refer to heap memory owned by the context (the boxed read
    /// buffer, the shared response bytes), so they stay valid when the
    /// context itself is moved into the store.
    pub fn submission(&mut self) -> Submission {
        match self {
            OpContext::Accept { listener } => Submission::Accept {
                listener: *listener,
            },
            OpContext::Read { fd, buf } => Submission::Read {
                fd: *fd,
                buf: buf.as_mut_ptr(),
                len: buf.len(),
            },
            OpContext::Write {
                fd,
                response,
                written,
            } => {
                let remaining = &response[*written..];
                Submission::Write {
                    fd: *fd,
                    buf: remaining.as_ptr(),
                    len: remaining.len(),
                }
            }
        }
    }
}

impl fmt::Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpContext::Accept { listener } => {
                f.debug_struct("Accept").field("listener", listener).finish()
            }
            OpContext::Read { fd, .. } => f.debug_struct("Read").field("fd", fd).finish(),
            OpContext::Write {
                fd,
                response,
                written,
            } => f
                .debug_struct("Write")
                .field("fd", fd)
                .field("written", written)
                .field("total", &response.len())
                .finish(),
        }
    }
}

struct Slot {
    generation: u32,
    context: OpContext,
}

/// Owner of every in-flight operation context.
///
/// Uses a slab for O(1) insert and removal with stable slot numbers.
pub struct ContextStore {
    slots: Slab<Slot>,
    next_generation: u32,
    allocated: u64,
    released: u64,
}

impl ContextStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            next_generation: 0,
            allocated: 0,
            released: 0,
        }
    }

    /// Take ownership of a context for a newly submitted operation.
    pub fn insert(&mut self, context: OpContext) -> Token {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let slot = self.slots.insert(Slot {
            generation,
            context,
        });
        debug_assert!(slot < RESERVED_SLOT as usize, "context slot space exhausted");
        self.allocated += 1;

        Token::new(slot as u32, generation)
    }

    /// Look up a live context.
    pub fn get(&self, token: Token) -> Option<&OpContext> {
        self.slots
            .get(token.slot() as usize)
            .filter(|slot| slot.generation == token.generation())
            .map(|slot| &slot.context)
    }

    /// Remove a context, returning ownership to the caller.
    ///
    /// Returns `None` if the token is reserved, stale or already released.
    pub fn release(&mut self, token: Token) -> Option<OpContext> {
        self.get(token)?;
        let slot = self.slots.remove(token.slot() as usize);
        self.released += 1;
        Some(slot.context)
    }

    /// Tokens of every live context.
    pub fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .map(|(idx, slot)| Token::new(idx as u32, slot.generation))
            .collect()
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total contexts ever inserted.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Total contexts ever released.
    pub fn released(&self) -> u64 {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_release() {
        let mut store = ContextStore::with_capacity(16);

        let t1 = store.insert(OpContext::accept(3));
        let t2 = store.insert(OpContext::read(7));
        assert_eq!(store.len(), 2);

        assert_eq!(store.get(t1).map(OpContext::kind), Some(OpKind::Accept));
        assert_eq!(store.get(t2).map(OpContext::fd), Some(7));

        let ctx = store.release(t1).unwrap();
        assert!(matches!(ctx, OpContext::Accept { listener: 3 }));
        assert!(store.get(t1).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.allocated(), 2);
        assert_eq!(store.released(), 1);
    }

    #[test]
    fn test_release_is_exactly_once() {
        let mut store = ContextStore::with_capacity(4);
        let token = store.insert(OpContext::read(5));

        assert!(store.release(token).is_some());
        assert!(store.release(token).is_none());
        assert_eq!(store.released(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_token_does_not_match_reused_slot() {
        let mut store = ContextStore::with_capacity(4);

        let old = store.insert(OpContext::read(5));
        store.release(old);

        // Slab reuses the slot, but the generation differs.
        let new = store.insert(OpContext::read(6));
        assert_eq!(old.slot(), new.slot());
        assert_ne!(old, new);

        assert!(store.get(old).is_none());
        assert!(store.release(old).is_none());
        assert_eq!(store.get(new).map(OpContext::fd), Some(6));
    }

    #[test]
    fn test_reserved_tokens_never_resolve() {
        let mut store = ContextStore::with_capacity(4);
        store.insert(OpContext::accept(3));

        let reserved = Token::reserved(1);
        assert!(reserved.is_reserved());
        assert!(store.get(reserved).is_none());
        assert!(store.release(reserved).is_none());
        assert_ne!(Token::reserved(1), Token::reserved(2));
    }

    #[test]
    fn test_token_round_trips_through_raw() {
        let mut store = ContextStore::with_capacity(4);
        let token = store.insert(OpContext::accept(3));
        assert_eq!(Token::from_raw(token.raw()), token);
        assert!(!token.is_reserved());
    }

    #[test]
    fn test_write_submission_skips_written_bytes() {
        let response = Bytes::from_static(b"hello world");
        let mut ctx = OpContext::write(9, response.clone(), 6);

        match ctx.submission() {
            Submission::Write { fd, buf, len } => {
                assert_eq!(fd, 9);
                assert_eq!(len, 5);
                let remaining = unsafe { std::slice::from_raw_parts(buf, len) };
                assert_eq!(remaining, b"world");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_read_buffer_survives_move_into_store() {
        let mut store = ContextStore::with_capacity(1);
        let mut ctx = OpContext::read(4);
        let before = match ctx.submission() {
            Submission::Read { buf, len, .. } => {
                assert_eq!(len, BUFFER_SIZE);
                buf
            }
            other => panic!("unexpected: {:?}", other),
        };

        let token = store.insert(ctx);
        // Force the slab to grow and relocate its slots.
        let others: Vec<_> = (0..64).map(|fd| store.insert(OpContext::read(fd))).collect();
        assert_eq!(others.len(), 64);

        match store.release(token) {
            Some(OpContext::Read { buf, .. }) => assert_eq!(buf.as_ptr(), before as *const u8),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
