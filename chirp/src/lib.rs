//! Chirp: an embeddable message-passing library. Nodes exchange self-delimiting binary messages
//! over TCP, optionally tunnelled through TLS, with at-most-once delivery and an optional
//! per-message acknowledgement turning a connection's delivery into at-least-once.
//!
//! The public surface is small: build a [`config::Config`], call [`engine::Engine::init`] with
//! it and a [`engine::Callbacks`] bundle, and hold on to the returned [`engine::Handle`] to send
//! messages and release received ones from any thread. Everything else in this crate is the
//! single-threaded event loop that makes that surface behave correctly under concurrency and
//! failure.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod message;
pub mod pool;
pub mod public;
pub mod reader;
pub mod remote;
pub mod wire;
pub mod writer;

pub use config::Config;
pub use engine::{set_always_encrypt, Callbacks, Engine, Handle};
pub use error::{ChirpError, ChirpResult, ErrorKind};
pub use message::{Address, Message, Proto, ReceiveCallback, SendCallback, SendOutcome};
