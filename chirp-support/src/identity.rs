//! CSPRNG-backed helpers. Kept separate from `tls` because identity/jitter generation has
//! nothing to do with the TLS transport; it just needs a good source of randomness.

use rand::Rng;
use std::time::Duration;

/// A message/node identity: 16 random bytes, assigned once and never mutated.
pub fn random_identity() -> [u8; 16] {
    rand::thread_rng().gen()
}

/// Initial value for a Remote's per-peer send-serial counter. Wraps modulo 2^32 from here on.
pub fn random_serial() -> u32 {
    rand::thread_rng().gen()
}

/// Reconnect debounce delay, uniform in `[50ms, 550ms)`.
pub fn random_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(50..550))
}
