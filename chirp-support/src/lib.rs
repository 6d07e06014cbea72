//! Ambient infrastructure shared by the `chirp` engine: structured logging that forwards to a
//! caller-supplied callback instead of a fixed sink, the TLS integration contract plus its two
//! implementations, and a handful of CSPRNG-backed helpers (identity bytes, reconnect jitter).
//!
//! None of this is part of the wire protocol or the state machines themselves; it exists so
//! `chirp` can stay focused on the engine while still behaving like a complete, embeddable
//! library rather than a bag of algorithms.

pub mod identity;
pub mod logging;
pub mod tls;

pub use identity::{random_identity, random_jitter, random_serial};
pub use logging::{CallbackDrain, LogCallback, LogLevel};
pub use tls::{PassThroughEngine, RustlsEngine, TlsEngine, TlsError};
