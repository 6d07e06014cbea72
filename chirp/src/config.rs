//! Plain serde-derived configuration: a struct with a `Default` impl holding the library's
//! defaults, and a `validate()` the host calls after loading/overriding fields. Chirp does not
//! own file loading — an embeddable library takes its config as a value, leaving "where do the
//! bytes come from" to the host.

use crate::error::{ChirpError, ChirpResult, ErrorKind};
use serde_derive::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

pub const PREALLOC_HEADER: usize = 32;
pub const PREALLOC_DATA: usize = 1024;
pub const MAX_SLOTS_HARD_LIMIT: u8 = 32;
pub const HANDSHAKE_LEN: usize = 18;
pub const ENVELOPE_LEN: usize = 27;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection idle reuse window, in seconds.
    pub reuse_time: f64,
    /// Per-send timeout, in seconds; connect timeout derives from it (`min(2x, 60)`).
    pub timeout: f64,
    pub port: u16,
    pub backlog: u32,
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
    /// 0 means "library-chosen": 16 slots in async mode, 1 in synchronous mode.
    pub max_slots: u8,
    pub synchronous: bool,
    pub disable_signals: bool,
    /// 0 means "library-chosen": >= 1024, >= ENVELOPE_LEN, >= HANDSHAKE_LEN.
    pub buffer_size: usize,
    pub max_msg_size: u64,
    /// All-zero means "generate randomly at init".
    pub identity: [u8; 16],
    pub cert_chain_pem: Option<PathBuf>,
    pub dh_params_pem: Option<PathBuf>,
    pub disable_encryption: bool,
    pub always_encrypt: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            reuse_time: 30.0,
            timeout: 5.0,
            port: 2998,
            backlog: 100,
            bind_v4: None,
            bind_v6: None,
            max_slots: 0,
            synchronous: true,
            disable_signals: false,
            buffer_size: 0,
            max_msg_size: 100 * 1024 * 1024,
            identity: [0u8; 16],
            cert_chain_pem: None,
            dh_params_pem: None,
            disable_encryption: false,
            always_encrypt: false,
        }
    }
}

impl Config {
    /// Resolves the library-chosen defaults (`0` sentinels) and checks the config invariants.
    /// Returns the normalized config; the caller should use the returned value, not the input,
    /// from this point on.
    pub fn validate(mut self) -> ChirpResult<Config> {
        if self.port <= 1024 {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }
        if self.backlog >= 128 {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }
        if !(0.1..=1200.0).contains(&self.timeout) {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }
        if !(0.5..=3600.0).contains(&self.reuse_time) {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }
        if self.timeout > self.reuse_time {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }

        if self.max_slots == 0 {
            self.max_slots = if self.synchronous { 1 } else { 16 };
        }
        if self.synchronous && self.max_slots != 1 {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }
        if self.max_slots > MAX_SLOTS_HARD_LIMIT {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }

        if self.buffer_size == 0 {
            self.buffer_size = 1024;
        }
        if self.buffer_size < ENVELOPE_LEN || self.buffer_size < HANDSHAKE_LEN {
            return Err(ChirpError::new(ErrorKind::ValueError));
        }

        if !self.disable_encryption {
            let cert = self
                .cert_chain_pem
                .as_ref()
                .ok_or_else(|| ChirpError::new(ErrorKind::ValueError))?;
            if !cert.exists() {
                return Err(ChirpError::new(ErrorKind::ValueError));
            }
            let dh_params = self
                .dh_params_pem
                .as_ref()
                .ok_or_else(|| ChirpError::new(ErrorKind::ValueError))?;
            if !dh_params.exists() {
                return Err(ChirpError::new(ErrorKind::ValueError));
            }
        }

        Ok(self)
    }

    /// The effective idle-reuse window used by the garbage collector: never shorter
    /// than three send-timeouts, so no in-flight message can outlive the window.
    pub fn effective_reuse_time(&self) -> f64 {
        self.reuse_time.max(3.0 * self.timeout)
    }

    pub fn connect_timeout(&self) -> f64 {
        (2.0 * self.timeout).min(60.0)
    }
}
