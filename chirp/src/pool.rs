//! Receive-side admission control: a bounded pool of message slots per connection,
//! refcounted so it outlives the connection while the user still holds a delivered message's
//! borrow. A fixed-capacity store plus a free list, addressed by a small integer id; slot ids
//! are assigned deterministically from the highest free bit (for stable debugging/state
//! logging) via a plain `u32` bitmask rather than a `Vec`-backed free list, since slot ids must
//! come from specific bit positions, not push/pop order.

use crate::config::{MAX_SLOTS_HARD_LIMIT, PREALLOC_DATA, PREALLOC_HEADER};
use mio::Token;
use std::sync::{Arc, Mutex};

struct PoolInner {
    max_slots: u8,
    /// Bit `i` set means slot `i` is free. Only the low `max_slots` bits are ever used.
    free_mask: u32,
    used: u8,
    /// The pool's owning connection.
    /// Lets a released slot tell the engine which connection's paused read to resume, even
    /// though the `Message` being released carries only the pool handle, not the connection.
    conn_token: Option<Token>,
}

/// A refcounted handle to a connection's buffer pool. Cloning is cheap (an `Arc` bump) and is
/// exactly a "retain" operation: a cloned handle keeps the pool's backing storage
/// alive even after the owning connection (and its `Reader`) has gone away, which is how a
/// delivered `Message` can still be released long after its connection shut down. `Arc<Mutex<_>>`
/// rather than `Rc<RefCell<_>>` because a `Message` carrying a pool handle crosses the
/// `Handle::send_ts`/`release_slot_ts` channel from whatever thread the caller is on onto
/// the engine's own thread, and the engine itself is moved onto its thread at `Engine::init` time
/// — both require every field reachable from `Message` to be `Send`.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl BufferPool {
    pub fn new(max_slots: u8) -> BufferPool {
        let max_slots = max_slots.min(MAX_SLOTS_HARD_LIMIT);
        let free_mask = if max_slots == 32 { u32::MAX } else { (1u32 << max_slots) - 1 };

        BufferPool {
            inner: Arc::new(Mutex::new(PoolInner { max_slots, free_mask, used: 0, conn_token: None })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("buffer pool mutex poisoned")
    }

    pub fn set_conn_token(&self, token: Token) {
        self.lock().conn_token = Some(token);
    }

    /// Cleared on connection shutdown: a pool outlives its connection
    /// via the `Message`s still checked out against it, but it must not point back at a
    /// connection that no longer exists.
    pub fn clear_conn_token(&self) {
        self.lock().conn_token = None;
    }

    pub fn conn_token(&self) -> Option<Token> {
        self.lock().conn_token
    }

    pub fn max_slots(&self) -> u8 {
        self.lock().max_slots
    }

    pub fn used(&self) -> u8 {
        self.lock().used
    }

    pub fn is_exhausted(&self) -> bool {
        self.lock().free_mask == 0
    }

    /// Highest-free-bit allocation: deterministic, not "any free slot". Returns `None`
    /// when the pool is exhausted — the caller (the reader) treats this as the trigger to pause
    /// its socket read.
    pub fn acquire(&self) -> Option<u8> {
        let mut inner = self.lock();
        if inner.free_mask == 0 {
            return None;
        }
        let highest_bit = 31 - inner.free_mask.leading_zeros();
        inner.free_mask &= !(1 << highest_bit);
        inner.used += 1;
        Some(highest_bit as u8)
    }

    /// Releases `slot_id` back to the pool. Returns `true` if the pool transitioned from
    /// exhausted to non-exhausted as a result — the signal the connection uses to resume a
    /// paused read. Double-release is a logic error; we catch it with a `debug_assert!` so the
    /// check compiles out of release builds.
    pub fn release(&self, slot_id: u8) -> bool {
        let mut inner = self.lock();
        let bit = 1u32 << slot_id;
        debug_assert!(inner.free_mask & bit == 0, "double-release of slot {}", slot_id);
        let was_exhausted = inner.free_mask == 0;
        inner.free_mask |= bit;
        inner.used = inner.used.saturating_sub(1);
        was_exhausted
    }

    pub fn ptr_eq(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A pre-allocated (header-stash, data-stash) pair. Small messages are copied in place;
/// anything past `PREALLOC_HEADER`/`PREALLOC_DATA` bytes spills to a heap `Vec`, which in Rust
/// is simply a larger allocation on the same `Vec<u8>` rather than a distinct code path — the
/// `FREE_HEADER`/`FREE_DATA` message flags (see `message.rs`) record which case applied.
pub struct Slot {
    pub header: Vec<u8>,
    pub data: Vec<u8>,
}

impl Slot {
    pub fn new() -> Slot {
        Slot {
            header: Vec::with_capacity(PREALLOC_HEADER),
            data: Vec::with_capacity(PREALLOC_DATA),
        }
    }

    pub fn reset(&mut self) {
        self.header.clear();
        self.data.clear();
    }
}

impl Default for Slot {
    fn default() -> Slot {
        Slot::new()
    }
}
