//! What it means to release a received message's slot, independent of which connection the
//! engine drives it through. `Handle` itself (the cross-thread entry point) lives in `engine.rs`
//! next to the loop it bounces into, since the two are tightly coupled; this module holds the
//! part of `release_slot` that is pure bookkeeping over a `Message` and a `BufferPool`, keeping
//! "return this handle to its pool" logic next to the type it operates on rather than folding it
//! into the caller's control flow.

use crate::error::{ChirpError, ChirpResult, ErrorKind};
use crate::message::{flags, remote_key, Message, RemoteKey};
use mio::Token;

/// What releasing `msg`'s slot requires the engine to do next: resume a paused read
/// if the pool transitioned from exhausted to free, and/or enqueue an ack on the owning remote's
/// control queue if the peer asked for one.
pub struct ReleaseOutcome {
    pub result: ChirpResult<()>,
    pub resumed_token: Option<Token>,
    pub ack: Option<(RemoteKey, Message)>,
}

/// Must be called exactly once per acquired slot. Taking `slot_id` and
/// `pool` out of the message (both `Option`s, both cleared here) makes a double-release
/// impossible to observe from this function's own caller — a second call on the same `Message`
/// simply finds both already `None` and reports `ValueError` rather than touching the pool twice.
pub fn release_slot(mut msg: Message) -> ReleaseOutcome {
    if !msg.has_flag(flags::HAS_SLOT) {
        return ReleaseOutcome {
            result: Err(ChirpError::new(ErrorKind::ValueError)),
            resumed_token: None,
            ack: None,
        };
    }

    let slot_id = match msg.slot_id.take() {
        Some(id) => id,
        None => {
            return ReleaseOutcome {
                result: Err(ChirpError::new(ErrorKind::ValueError)),
                resumed_token: None,
                ack: None,
            }
        }
    };
    let pool = match msg.pool.take() {
        Some(p) => p,
        None => {
            return ReleaseOutcome {
                result: Err(ChirpError::new(ErrorKind::ValueError)),
                resumed_token: None,
                ack: None,
            }
        }
    };

    let became_free = pool.release(slot_id);
    let resumed_token = if became_free { pool.conn_token() } else { None };

    msg.clear_flag(flags::HAS_SLOT);

    let ack = if msg.has_flag(flags::SEND_ACK) {
        let identity = msg.identity();
        let serial = msg.serial;
        msg.address().map(|addr| (remote_key(&addr), Message::ack_for(identity, serial)))
    } else {
        None
    };

    msg.free_data();

    ReleaseOutcome { result: Ok(()), resumed_token, ack }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Proto;
    use crate::pool::BufferPool;

    fn delivered_message(pool: &BufferPool, send_ack: bool) -> Message {
        let slot_id = pool.acquire().unwrap();
        let mut msg = Message::new();
        msg.set_flag(flags::HAS_SLOT);
        msg.slot_id = Some(slot_id);
        msg.pool = Some(pool.clone());
        msg.address = crate::message::Address::from_text(Proto::V4, "127.0.0.1", 2998);
        if send_ack {
            msg.set_flag(flags::SEND_ACK);
        }
        msg
    }

    #[test]
    fn release_without_slot_is_value_error() {
        let outcome = release_slot(Message::new());
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::ValueError);
    }

    #[test]
    fn release_returns_resumed_token_only_on_exhausted_transition() {
        let pool = BufferPool::new(1);
        pool.set_conn_token(Token(7));
        let msg = delivered_message(&pool, false);

        let outcome = release_slot(msg);
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.resumed_token, Some(Token(7)));
        assert!(outcome.ack.is_none());
    }

    #[test]
    fn release_does_not_resume_when_pool_still_has_other_slots_free() {
        let pool = BufferPool::new(4);
        pool.set_conn_token(Token(1));
        pool.acquire(); // keep the pool non-exhausted even after releasing `msg`'s slot
        let msg = delivered_message(&pool, false);

        let outcome = release_slot(msg);
        assert!(outcome.resumed_token.is_none());
    }

    #[test]
    fn release_with_send_ack_produces_ack_message() {
        let pool = BufferPool::new(1);
        let mut msg = delivered_message(&pool, true);
        msg.identity = [9u8; 16];
        msg.serial = 42;

        let outcome = release_slot(msg);
        let (_, ack) = outcome.ack.expect("ack should be produced");
        assert!(ack.is_ack());
        assert_eq!(ack.identity(), [9u8; 16]);
        assert_eq!(ack.serial, 42);
    }

    #[test]
    fn double_release_is_rejected() {
        let pool = BufferPool::new(1);
        let slot_id = pool.acquire().unwrap();
        let mut msg = Message::new();
        msg.set_flag(flags::HAS_SLOT);
        msg.slot_id = Some(slot_id);
        msg.pool = Some(pool.clone());

        // Simulate releasing, then handing the now-stripped message to release_slot again.
        let first = release_slot(msg);
        assert!(first.result.is_ok());

        let mut again = Message::new();
        again.set_flag(flags::HAS_SLOT);
        let second = release_slot(again);
        assert_eq!(second.result.unwrap_err().kind(), ErrorKind::ValueError);
    }
}
